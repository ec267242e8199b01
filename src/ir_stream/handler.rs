//! Observer interface for committed IR units.
//!
//! The deserializer reports every schema-tree insertion, UTC-offset change
//! and the end of the stream to an [`IrUnitHandler`]. Units read while a log
//! event is being decoded are only reported once that event commits; units
//! undone by a rollback are never reported.

use anyhow::Result;

use crate::log_event::UtcOffset;
use crate::schema_tree::{NodeId, NodeLocator};

/// Receives IR units as the deserializer commits them.
///
/// Every method defaults to doing nothing. An error aborts the current
/// deserializer call with [`IrError::Handler`](super::IrError::Handler);
/// the units already committed stay committed.
pub trait IrUnitHandler {
    /// A node was added to one of the schema trees.
    fn handle_schema_tree_node_insertion(
        &mut self,
        _is_auto_generated: bool,
        _locator: &NodeLocator,
        _node_id: NodeId,
    ) -> Result<()> {
        Ok(())
    }

    fn handle_utc_offset_change(&mut self, _old: UtcOffset, _new: UtcOffset) -> Result<()> {
        Ok(())
    }

    fn handle_end_of_stream(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handler that ignores every unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl IrUnitHandler for NoopHandler {}

/// An IR unit as reported to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandledIrUnit {
    SchemaTreeNodeInsertion {
        is_auto_generated: bool,
        locator: NodeLocator,
        node_id: NodeId,
    },
    UtcOffsetChange {
        old: UtcOffset,
        new: UtcOffset,
    },
    EndOfStream,
}

/// A handler that records every unit in memory.
///
/// Useful for tests and for tools that want the raw unit sequence.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    units: Vec<HandledIrUnit>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> &[HandledIrUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<HandledIrUnit> {
        self.units
    }
}

impl IrUnitHandler for CollectingHandler {
    fn handle_schema_tree_node_insertion(
        &mut self,
        is_auto_generated: bool,
        locator: &NodeLocator,
        node_id: NodeId,
    ) -> Result<()> {
        self.units.push(HandledIrUnit::SchemaTreeNodeInsertion {
            is_auto_generated,
            locator: locator.clone(),
            node_id,
        });
        Ok(())
    }

    fn handle_utc_offset_change(&mut self, old: UtcOffset, new: UtcOffset) -> Result<()> {
        self.units.push(HandledIrUnit::UtcOffsetChange { old, new });
        Ok(())
    }

    fn handle_end_of_stream(&mut self) -> Result<()> {
        self.units.push(HandledIrUnit::EndOfStream);
        Ok(())
    }
}
