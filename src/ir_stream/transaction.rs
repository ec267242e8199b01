//! Scoped, all-or-nothing application of IR units.
//!
//! A transaction spans one deserializer call. It snapshots both schema trees
//! on [`IrUnitTransaction::begin`], applies insertions and UTC-offset changes
//! as they are read, and either keeps them ([`IrUnitTransaction::commit`]) or
//! undoes them ([`IrUnitTransaction::abort`]). Handler notifications for the
//! applied units are queued and only handed out on commit.

use super::error::ProtocolError;
use super::handler::HandledIrUnit;
use crate::log_event::UtcOffset;
use crate::schema_tree::{NodeId, NodeLocator, SchemaTree, SchemaTreeError};

pub struct IrUnitTransaction<'a> {
    auto_gen_keys_schema_tree: &'a SchemaTree,
    user_gen_keys_schema_tree: &'a SchemaTree,
    utc_offset: UtcOffset,
    pending: Vec<HandledIrUnit>,
}

impl<'a> IrUnitTransaction<'a> {
    pub fn begin(
        auto_gen_keys_schema_tree: &'a SchemaTree,
        user_gen_keys_schema_tree: &'a SchemaTree,
        utc_offset: UtcOffset,
    ) -> Self {
        auto_gen_keys_schema_tree.take_snapshot();
        user_gen_keys_schema_tree.take_snapshot();
        Self {
            auto_gen_keys_schema_tree,
            user_gen_keys_schema_tree,
            utc_offset,
            pending: Vec::new(),
        }
    }

    fn tree(&self, is_auto_generated: bool) -> &'a SchemaTree {
        if is_auto_generated {
            self.auto_gen_keys_schema_tree
        } else {
            self.user_gen_keys_schema_tree
        }
    }

    /// UTC offset as of the units applied so far.
    pub fn utc_offset(&self) -> UtcOffset {
        self.utc_offset
    }

    pub fn insert_node(
        &mut self,
        is_auto_generated: bool,
        locator: NodeLocator,
    ) -> Result<NodeId, ProtocolError> {
        let tree = self.tree(is_auto_generated);
        let node_id = tree.insert_node(&locator).map_err(|err| match err {
            SchemaTreeError::NodeExists { .. } => ProtocolError::DuplicateNode {
                is_auto_generated,
                locator: locator.clone(),
            },
            err => ProtocolError::InvalidNode(err),
        })?;
        self.pending.push(HandledIrUnit::SchemaTreeNodeInsertion {
            is_auto_generated,
            locator,
            node_id,
        });
        Ok(node_id)
    }

    pub fn change_utc_offset(&mut self, new: UtcOffset) {
        let old = std::mem::replace(&mut self.utc_offset, new);
        self.pending.push(HandledIrUnit::UtcOffsetChange { old, new });
    }

    /// Keeps every applied unit. Returns the resulting UTC offset and the
    /// units to report, in the order they were read.
    pub fn commit(self) -> (UtcOffset, Vec<HandledIrUnit>) {
        self.auto_gen_keys_schema_tree.discard_snapshot();
        self.user_gen_keys_schema_tree.discard_snapshot();
        (self.utc_offset, self.pending)
    }

    /// Undoes every applied unit. Returns how many were discarded.
    pub fn abort(self) -> Result<usize, SchemaTreeError> {
        self.auto_gen_keys_schema_tree.revert()?;
        self.user_gen_keys_schema_tree.revert()?;
        Ok(self.pending.len())
    }
}
