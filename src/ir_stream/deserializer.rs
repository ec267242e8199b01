//! Stateful IR stream reader.
//!
//! A [`Deserializer`] is created from a reader positioned at the start of a
//! stream (it consumes the preamble) and then pulls one log event per call
//! to [`Deserializer::deserialize_to_next_log_event`]. Schema-tree
//! insertions and UTC-offset changes that precede an event are applied as
//! part of the same call, inside an [`IrUnitTransaction`]: if anything in
//! the call fails, all of them are undone.

use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::Arc;

use super::codec::{
    read_i64, read_node_id, read_tagged_string, read_u8, read_value, KEY_ID_TAGS, PARENT_ID_TAGS,
    STRING_LENGTH_TAGS,
};
use super::error::{IrError, ProtocolError};
use super::handler::{HandledIrUnit, IrUnitHandler, NoopHandler};
use super::metadata::{read_preamble, StreamMetadata, VariableEncodingKind};
use super::protocol::{self, IrUnitType};
use super::transaction::IrUnitTransaction;
use crate::log_event::{KeyNamespace, KeyValuePairLogEvent, NodeIdValuePairs, UtcOffset};
use crate::schema_tree::{NodeId, NodeLocator, SchemaTree};
use crate::search::{AstEvaluationResult, QueryHandler};

pub struct Deserializer<H: IrUnitHandler = NoopHandler> {
    auto_gen_keys_schema_tree: Arc<SchemaTree>,
    user_gen_keys_schema_tree: Arc<SchemaTree>,
    utc_offset: UtcOffset,
    handler: H,
    metadata: StreamMetadata,
    encoding: VariableEncodingKind,
    is_complete: bool,
    pending: Option<PendingDelivery>,
}

/// Units of a committed call not yet reported to the handler, and the event
/// that call read.
struct PendingDelivery {
    units: VecDeque<HandledIrUnit>,
    event: Option<KeyValuePairLogEvent>,
}

impl Deserializer<NoopHandler> {
    /// Reads the stream preamble and returns a deserializer with no handler.
    pub fn create<R: Read>(reader: &mut R) -> Result<Self, IrError> {
        Self::create_with_handler(reader, NoopHandler)
    }
}

impl<H: IrUnitHandler> Deserializer<H> {
    /// Reads the stream preamble and returns a deserializer reporting to
    /// `handler`. Fails with [`IrError::UnsupportedFormat`] on an unknown
    /// magic number or an incompatible metadata version.
    pub fn create_with_handler<R: Read>(reader: &mut R, handler: H) -> Result<Self, IrError> {
        let (encoding, metadata) = read_preamble(reader)?;
        tracing::info!(
            "Opened IR stream version {} with {} variable encoding",
            metadata.version,
            encoding
        );
        Ok(Self {
            auto_gen_keys_schema_tree: Arc::new(SchemaTree::new()),
            user_gen_keys_schema_tree: Arc::new(SchemaTree::new()),
            utc_offset: 0,
            handler,
            metadata,
            encoding,
            is_complete: false,
            pending: None,
        })
    }

    /// Reads IR units up to and including the next log event.
    ///
    /// Returns `Ok(None)` when the end-of-stream tag is read; any call after
    /// that fails with [`IrError::EndOfStream`]. On a read error, every unit
    /// read during this call is rolled back and nothing is reported to the
    /// handler.
    ///
    /// Units are reported to the handler once they are committed. If the
    /// handler fails, [`IrError::Handler`] is returned and the next call
    /// reports the remaining units, then returns the event without reading.
    pub fn deserialize_to_next_log_event<R: Read>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<KeyValuePairLogEvent>, IrError> {
        if let Some(pending) = self.pending.take() {
            return self.deliver(pending);
        }
        if self.is_complete {
            return Err(IrError::EndOfStream);
        }

        let auto_tree = Arc::clone(&self.auto_gen_keys_schema_tree);
        let user_tree = Arc::clone(&self.user_gen_keys_schema_tree);
        let mut txn = IrUnitTransaction::begin(&auto_tree, &user_tree, self.utc_offset);
        let outcome = read_next_log_event(reader, &mut txn, &auto_tree, &user_tree);

        let event = match outcome {
            Ok(event) => event,
            Err(err) => {
                let discarded = txn.abort().map_err(ProtocolError::from)?;
                tracing::warn!(
                    "Rolled back {} IR unit(s) after failed read: {}",
                    discarded,
                    err
                );
                return Err(err);
            }
        };

        let (utc_offset, units) = txn.commit();
        self.utc_offset = utc_offset;
        let mut units = VecDeque::from(units);
        if event.is_none() {
            self.is_complete = true;
            units.push_back(HandledIrUnit::EndOfStream);
        }
        self.deliver(PendingDelivery { units, event })
    }

    fn deliver(
        &mut self,
        mut pending: PendingDelivery,
    ) -> Result<Option<KeyValuePairLogEvent>, IrError> {
        while let Some(unit) = pending.units.pop_front() {
            if let Err(err) = self.notify(unit) {
                tracing::warn!(
                    "IR unit handler failed with {} unit(s) left to report: {}",
                    pending.units.len(),
                    err
                );
                self.pending = Some(pending);
                return Err(err);
            }
        }
        Ok(pending.event)
    }

    fn notify(&mut self, unit: HandledIrUnit) -> Result<(), IrError> {
        let result = match unit {
            HandledIrUnit::SchemaTreeNodeInsertion {
                is_auto_generated,
                locator,
                node_id,
            } => {
                tracing::debug!(
                    "Inserted {} schema tree node {} ({})",
                    KeyNamespace::from_is_auto_generated(is_auto_generated),
                    node_id,
                    locator
                );
                self.handler
                    .handle_schema_tree_node_insertion(is_auto_generated, &locator, node_id)
            }
            HandledIrUnit::UtcOffsetChange { old, new } => {
                tracing::debug!("UTC offset changed from {} to {}", old, new);
                self.handler.handle_utc_offset_change(old, new)
            }
            HandledIrUnit::EndOfStream => self.handler.handle_end_of_stream(),
        };
        result.map_err(IrError::Handler)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    pub fn encoding(&self) -> VariableEncodingKind {
        self.encoding
    }

    pub fn utc_offset(&self) -> UtcOffset {
        self.utc_offset
    }

    /// True once the end-of-stream tag has been read.
    pub fn is_stream_completed(&self) -> bool {
        self.is_complete
    }

    pub fn auto_gen_keys_schema_tree(&self) -> &Arc<SchemaTree> {
        &self.auto_gen_keys_schema_tree
    }

    pub fn user_gen_keys_schema_tree(&self) -> &Arc<SchemaTree> {
        &self.user_gen_keys_schema_tree
    }
}

impl Deserializer<QueryHandler> {
    /// Like [`Deserializer::deserialize_to_next_log_event`], but skips
    /// events the handler's query doesn't evaluate to true.
    pub fn deserialize_to_next_matching_log_event<R: Read>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<KeyValuePairLogEvent>, IrError> {
        while let Some(event) = self.deserialize_to_next_log_event(reader)? {
            if self.handler.evaluate_kv_pair_log_event(&event)? == AstEvaluationResult::True {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

fn read_next_log_event<R: Read>(
    reader: &mut R,
    txn: &mut IrUnitTransaction<'_>,
    auto_tree: &Arc<SchemaTree>,
    user_tree: &Arc<SchemaTree>,
) -> Result<Option<KeyValuePairLogEvent>, IrError> {
    loop {
        let tag = read_u8(reader)?;
        match protocol::classify_tag(tag) {
            IrUnitType::EndOfStream => return Ok(None),
            IrUnitType::UtcOffsetChange => {
                let utc_offset = read_i64(reader)?;
                txn.change_utc_offset(utc_offset);
            }
            IrUnitType::SchemaTreeNodeInsertion => {
                let (is_auto_generated, locator) = read_node_locator(reader, tag)?;
                txn.insert_node(is_auto_generated, locator)?;
            }
            IrUnitType::LogEvent => {
                let (auto_pairs, user_pairs) = read_log_event_pairs(reader, tag)?;
                let event = KeyValuePairLogEvent::create(
                    Arc::clone(auto_tree),
                    Arc::clone(user_tree),
                    auto_pairs,
                    user_pairs,
                    txn.utc_offset(),
                )
                .map_err(ProtocolError::from)?;
                return Ok(Some(event));
            }
        }
    }
}

fn read_node_locator<R: Read>(reader: &mut R, tag: u8) -> Result<(bool, NodeLocator), IrError> {
    let node_type = protocol::node_type_from_tag(tag).ok_or(ProtocolError::UnknownTag(tag))?;
    let id_tag = read_u8(reader)?;
    let (is_auto_generated, parent_id) = read_node_id(reader, id_tag, PARENT_ID_TAGS, "parent id")?;
    let key_name = read_tagged_string(reader, STRING_LENGTH_TAGS, "key name")?;
    Ok((
        is_auto_generated,
        NodeLocator::new(parent_id, key_name, node_type),
    ))
}

/// Decodes a log-event unit whose first byte is `tag`.
///
/// Auto-generated pairs come first as interleaved key/value pairs. They are
/// followed either by the empty-object tag (no user-generated pairs), or by
/// every user-generated key id and then one value per id in the same order.
fn read_log_event_pairs<R: Read>(
    reader: &mut R,
    mut tag: u8,
) -> Result<(NodeIdValuePairs, NodeIdValuePairs), IrError> {
    let mut auto_pairs = NodeIdValuePairs::new();
    let first_user_key = loop {
        if tag == protocol::VALUE_EMPTY {
            return Ok((auto_pairs, NodeIdValuePairs::new()));
        }
        let (is_auto_generated, node_id) = read_key_id(reader, tag)?;
        if !is_auto_generated {
            break node_id;
        }
        if auto_pairs.contains_key(&node_id) {
            return Err(ProtocolError::DuplicateKey {
                namespace: KeyNamespace::AutoGenerated,
                node_id,
            }
            .into());
        }
        let value_tag = read_u8(reader)?;
        auto_pairs.insert(node_id, read_value(reader, value_tag)?);
        tag = read_u8(reader)?;
    };

    let mut schema = vec![first_user_key];
    let mut seen = HashSet::from([first_user_key]);
    loop {
        tag = read_u8(reader)?;
        if !protocol::is_encoded_key_id_tag(tag) {
            break;
        }
        let (is_auto_generated, node_id) = read_key_id(reader, tag)?;
        if is_auto_generated {
            return Err(ProtocolError::InvalidKeyOrdering { node_id }.into());
        }
        if !seen.insert(node_id) {
            return Err(ProtocolError::DuplicateKey {
                namespace: KeyNamespace::UserGenerated,
                node_id,
            }
            .into());
        }
        schema.push(node_id);
    }

    // `tag` already holds the first value's tag.
    let mut user_pairs = NodeIdValuePairs::new();
    for (idx, node_id) in schema.into_iter().enumerate() {
        if idx > 0 {
            tag = read_u8(reader)?;
        }
        user_pairs.insert(node_id, read_value(reader, tag)?);
    }
    Ok((auto_pairs, user_pairs))
}

fn read_key_id<R: Read>(reader: &mut R, tag: u8) -> Result<(bool, NodeId), IrError> {
    if !protocol::is_encoded_key_id_tag(tag) {
        return Err(ProtocolError::UnexpectedTag {
            tag,
            context: "log event key id",
        }
        .into());
    }
    read_node_id(reader, tag, KEY_ID_TAGS, "log event key id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_stream::handler::CollectingHandler;
    use crate::ir_stream::metadata::write_preamble;
    use crate::schema_tree::{NodeType, ROOT_ID};
    use crate::value::Value;

    fn preamble() -> Vec<u8> {
        let mut buf = Vec::new();
        write_preamble(
            &mut buf,
            VariableEncodingKind::EightByte.magic_number(),
            &StreamMetadata::default(),
        )
        .unwrap();
        buf
    }

    /// Insertion of a user-generated node under `parent` (ids < 128).
    fn insertion(node_tag: u8, parent: u8, key: &str) -> Vec<u8> {
        let mut unit = vec![node_tag, protocol::ENCODED_PARENT_ID_BYTE, parent];
        unit.push(protocol::STR_LEN_UBYTE);
        unit.push(key.len() as u8);
        unit.extend_from_slice(key.as_bytes());
        unit
    }

    fn user_key(id: u8) -> [u8; 2] {
        [protocol::ENCODED_KEY_ID_BYTE, id]
    }

    fn auto_key(id: u8) -> [u8; 2] {
        [protocol::ENCODED_KEY_ID_BYTE, !id]
    }

    /// `{"a": {"b": 5}}` with its two insertions.
    fn a_b_event() -> Vec<u8> {
        let mut units = insertion(protocol::SCHEMA_TREE_NODE_OBJ, 0, "a");
        units.extend(insertion(protocol::SCHEMA_TREE_NODE_INT, 1, "b"));
        units.extend(user_key(2));
        units.extend([protocol::VALUE_INT8, 5]);
        units
    }

    fn open(body: &[u8]) -> Vec<u8> {
        let mut stream = preamble();
        stream.extend_from_slice(body);
        stream
    }

    #[test]
    fn test_reads_event_and_end_of_stream() {
        let mut body = vec![protocol::UTC_OFFSET_CHANGE];
        body.extend_from_slice(&(-18000i64).to_be_bytes());
        body.extend(a_b_event());
        body.push(protocol::EOF);
        let stream = open(&body);
        let mut reader = stream.as_slice();

        let mut deserializer =
            Deserializer::create_with_handler(&mut reader, CollectingHandler::new()).unwrap();
        assert_eq!(deserializer.encoding(), VariableEncodingKind::EightByte);

        let event = deserializer
            .deserialize_to_next_log_event(&mut reader)
            .unwrap()
            .unwrap();
        assert_eq!(
            event.user_gen_node_id_value_pairs(),
            &NodeIdValuePairs::from([(2, Some(Value::Int(5)))])
        );
        assert_eq!(event.utc_offset(), -18000);
        assert_eq!(deserializer.utc_offset(), -18000);
        assert_eq!(deserializer.user_gen_keys_schema_tree().size(), 3);

        assert!(deserializer
            .deserialize_to_next_log_event(&mut reader)
            .unwrap()
            .is_none());
        assert!(deserializer.is_stream_completed());
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::EndOfStream)
        ));

        let units = deserializer.into_handler().into_units();
        assert_eq!(units.len(), 4);
        assert_eq!(
            units[0],
            HandledIrUnit::UtcOffsetChange {
                old: 0,
                new: -18000
            }
        );
        assert_eq!(
            units[2],
            HandledIrUnit::SchemaTreeNodeInsertion {
                is_auto_generated: false,
                locator: NodeLocator::new(1, "b", NodeType::Int),
                node_id: 2,
            }
        );
        assert_eq!(units[3], HandledIrUnit::EndOfStream);
    }

    #[test]
    fn test_truncated_event_rolls_back() {
        let mut body = a_b_event();
        // Drop the value byte.
        body.pop();
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer =
            Deserializer::create_with_handler(&mut reader, CollectingHandler::new()).unwrap();

        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::IncompleteStream)
        ));
        let tree = deserializer.user_gen_keys_schema_tree();
        assert_eq!(tree.size(), 1);
        assert_eq!(
            tree.try_get_node_id(&NodeLocator::new(ROOT_ID, "a", NodeType::Obj)),
            None
        );
        assert!(deserializer.handler().units().is_empty());
    }

    #[test]
    fn test_rollback_restores_utc_offset() {
        let mut body = vec![protocol::UTC_OFFSET_CHANGE];
        body.extend_from_slice(&3600i64.to_be_bytes());
        body.extend(user_key(7));
        body.extend([protocol::VALUE_INT8, 1]);
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();

        // Key 7 was never inserted.
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::Protocol(ProtocolError::InvalidLogEvent(_)))
        ));
        assert_eq!(deserializer.utc_offset(), 0);
    }

    #[test]
    fn test_key_ordering_and_duplicates() {
        let mut body = insertion(protocol::SCHEMA_TREE_NODE_INT, 0, "x");
        body.extend(user_key(1));
        body.extend(auto_key(0));
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::Protocol(ProtocolError::InvalidKeyOrdering { node_id: 0 }))
        ));
        assert_eq!(deserializer.user_gen_keys_schema_tree().size(), 1);

        let mut body = insertion(protocol::SCHEMA_TREE_NODE_INT, 0, "x");
        body.extend(user_key(1));
        body.extend(user_key(1));
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::Protocol(ProtocolError::DuplicateKey {
                namespace: KeyNamespace::UserGenerated,
                node_id: 1
            }))
        ));
    }

    #[test]
    fn test_duplicate_node_insertion() {
        let mut body = insertion(protocol::SCHEMA_TREE_NODE_INT, 0, "x");
        body.extend(insertion(protocol::SCHEMA_TREE_NODE_INT, 0, "x"));
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::Protocol(ProtocolError::DuplicateNode { .. }))
        ));
        assert_eq!(deserializer.user_gen_keys_schema_tree().size(), 1);
    }

    #[test]
    fn test_empty_event_and_auto_pairs() {
        let mut body = vec![protocol::VALUE_EMPTY];
        body.push(protocol::SCHEMA_TREE_NODE_STR);
        body.extend([protocol::ENCODED_PARENT_ID_BYTE, !0u8]);
        body.extend([protocol::STR_LEN_UBYTE, 2, b'i', b'd']);
        body.extend(auto_key(1));
        body.extend([protocol::STR_LEN_UBYTE, 1, b'z']);
        body.push(protocol::VALUE_EMPTY);
        body.push(protocol::EOF);
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();

        let empty = deserializer
            .deserialize_to_next_log_event(&mut reader)
            .unwrap()
            .unwrap();
        assert!(empty.auto_gen_node_id_value_pairs().is_empty());
        assert!(empty.user_gen_node_id_value_pairs().is_empty());

        let event = deserializer
            .deserialize_to_next_log_event(&mut reader)
            .unwrap()
            .unwrap();
        assert_eq!(
            event.auto_gen_node_id_value_pairs(),
            &NodeIdValuePairs::from([(1, Some(Value::from("z")))])
        );
        assert_eq!(deserializer.auto_gen_keys_schema_tree().size(), 2);
        assert_eq!(deserializer.user_gen_keys_schema_tree().size(), 1);
    }

    #[test]
    fn test_missing_bytes_before_unit() {
        let stream = open(&[]);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::IncompleteStream)
        ));
        assert!(!deserializer.is_stream_completed());
    }

    #[test]
    fn test_unknown_tags() {
        let stream = open(&[0x77]);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::Protocol(ProtocolError::UnknownTag(0x77)))
        ));

        let mut body = insertion(protocol::SCHEMA_TREE_NODE_INT, 0, "x");
        body.extend(user_key(1));
        body.extend([0x55]);
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer = Deserializer::create(&mut reader).unwrap();
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::Protocol(ProtocolError::UnknownValueTag(0x55)))
        ));
    }

    /// Fails the first insertion it sees, then records every node id.
    #[derive(Default)]
    struct FailFirstInsertion {
        failed: bool,
        node_ids: Vec<NodeId>,
        end_of_stream: bool,
    }

    impl IrUnitHandler for FailFirstInsertion {
        fn handle_schema_tree_node_insertion(
            &mut self,
            _is_auto_generated: bool,
            _locator: &NodeLocator,
            node_id: NodeId,
        ) -> anyhow::Result<()> {
            if !self.failed {
                self.failed = true;
                anyhow::bail!("rejected node {}", node_id);
            }
            self.node_ids.push(node_id);
            Ok(())
        }

        fn handle_end_of_stream(&mut self) -> anyhow::Result<()> {
            self.end_of_stream = true;
            Ok(())
        }
    }

    #[test]
    fn test_handler_failure_resumes_delivery() {
        let mut body = a_b_event();
        body.push(protocol::EOF);
        let stream = open(&body);
        let mut reader = stream.as_slice();
        let mut deserializer =
            Deserializer::create_with_handler(&mut reader, FailFirstInsertion::default())
                .unwrap();

        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::Handler(_))
        ));
        // The read itself succeeded, so its insertions stay.
        assert_eq!(deserializer.user_gen_keys_schema_tree().size(), 3);
        assert!(deserializer.handler().node_ids.is_empty());

        let event = deserializer
            .deserialize_to_next_log_event(&mut reader)
            .unwrap()
            .unwrap();
        assert_eq!(
            event.user_gen_node_id_value_pairs(),
            &NodeIdValuePairs::from([(2, Some(Value::Int(5)))])
        );
        assert_eq!(deserializer.handler().node_ids, vec![2]);

        assert!(deserializer
            .deserialize_to_next_log_event(&mut reader)
            .unwrap()
            .is_none());
        assert!(deserializer.handler().end_of_stream);
        assert!(matches!(
            deserializer.deserialize_to_next_log_event(&mut reader),
            Err(IrError::EndOfStream)
        ));
    }
}
