//! IR stream writer.
//!
//! A [`Serializer`] accumulates stream bytes in an internal buffer. Callers
//! drain it with [`Serializer::ir_buf_view`] and [`Serializer::clear_ir_buf`]
//! and append [`protocol::EOF`] themselves once the stream is finished.

use std::marker::PhantomData;

use serde_json::{Map, Number, Value as JsonValue};

use super::codec::{
    write_encoded_text, write_int, write_length_prefixed, write_node_id, write_value,
    KEY_ID_TAGS, PARENT_ID_TAGS, STRING_LENGTH_TAGS,
};
use super::error::SerializeError;
use super::metadata::{write_preamble, StreamMetadata};
use super::protocol;
use crate::encoded_text::{EncodedTextAst, VariableEncoding};
use crate::log_event::{KeyNamespace, UtcOffset};
use crate::schema_tree::{NodeId, NodeLocator, NodeType, SchemaTree, ROOT_ID};
use crate::value::Value;

/// Byte buffers for the pairs of one log event, assembled before the event
/// unit is appended behind any schema-tree insertions it needed.
#[derive(Default)]
struct EventBufs {
    auto_gen_pairs: Vec<u8>,
    user_gen_keys: Vec<u8>,
    user_gen_values: Vec<u8>,
}

pub struct Serializer<E: VariableEncoding> {
    ir_buf: Vec<u8>,
    auto_gen_keys_schema_tree: SchemaTree,
    user_gen_keys_schema_tree: SchemaTree,
    utc_offset: UtcOffset,
    _encoding: PhantomData<E>,
}

impl<E: VariableEncoding> Serializer<E> {
    /// Starts a stream: writes the magic number and default metadata.
    pub fn create() -> Result<Self, SerializeError> {
        Self::create_with_metadata(&StreamMetadata::default())
    }

    /// Starts a stream whose metadata carries `user_defined_metadata`.
    pub fn create_with_user_defined_metadata(
        user_defined_metadata: Map<String, JsonValue>,
    ) -> Result<Self, SerializeError> {
        Self::create_with_metadata(&StreamMetadata::with_user_defined_metadata(
            user_defined_metadata,
        ))
    }

    fn create_with_metadata(stream_metadata: &StreamMetadata) -> Result<Self, SerializeError> {
        let mut ir_buf = Vec::new();
        write_preamble(&mut ir_buf, E::MAGIC_NUMBER, stream_metadata)?;
        Ok(Self {
            ir_buf,
            auto_gen_keys_schema_tree: SchemaTree::new(),
            user_gen_keys_schema_tree: SchemaTree::new(),
            utc_offset: 0,
            _encoding: PhantomData,
        })
    }

    /// Bytes written since the last [`Serializer::clear_ir_buf`].
    pub fn ir_buf_view(&self) -> &[u8] {
        &self.ir_buf
    }

    pub fn clear_ir_buf(&mut self) {
        self.ir_buf.clear();
    }

    pub fn utc_offset(&self) -> UtcOffset {
        self.utc_offset
    }

    pub fn auto_gen_keys_schema_tree(&self) -> &SchemaTree {
        &self.auto_gen_keys_schema_tree
    }

    pub fn user_gen_keys_schema_tree(&self) -> &SchemaTree {
        &self.user_gen_keys_schema_tree
    }

    /// Records a new UTC offset. Nothing is written if it is unchanged.
    pub fn change_utc_offset(&mut self, utc_offset: UtcOffset) {
        if utc_offset == self.utc_offset {
            return;
        }
        self.ir_buf.push(protocol::UTC_OFFSET_CHANGE);
        self.ir_buf.extend_from_slice(&utc_offset.to_be_bytes());
        self.utc_offset = utc_offset;
    }

    /// Serializes one log event given as its auto-generated and
    /// user-generated JSON objects.
    ///
    /// Keys not yet in a schema tree are inserted, and their insertion units
    /// written ahead of the event. On error the buffer and both trees are
    /// left as they were before the call.
    pub fn serialize_json_object(
        &mut self,
        auto_gen: &Map<String, JsonValue>,
        user_gen: &Map<String, JsonValue>,
    ) -> Result<(), SerializeError> {
        let buf_len = self.ir_buf.len();
        self.auto_gen_keys_schema_tree.take_snapshot();
        self.user_gen_keys_schema_tree.take_snapshot();

        match self.serialize_event(auto_gen, user_gen) {
            Ok(()) => {
                self.auto_gen_keys_schema_tree.discard_snapshot();
                self.user_gen_keys_schema_tree.discard_snapshot();
                tracing::trace!(
                    "Serialized log event into {} bytes",
                    self.ir_buf.len() - buf_len
                );
                Ok(())
            }
            Err(err) => {
                self.ir_buf.truncate(buf_len);
                self.auto_gen_keys_schema_tree.revert()?;
                self.user_gen_keys_schema_tree.revert()?;
                Err(err)
            }
        }
    }

    fn serialize_event(
        &mut self,
        auto_gen: &Map<String, JsonValue>,
        user_gen: &Map<String, JsonValue>,
    ) -> Result<(), SerializeError> {
        let mut bufs = EventBufs::default();
        self.serialize_object(KeyNamespace::AutoGenerated, ROOT_ID, auto_gen, &mut bufs)?;
        self.serialize_object(KeyNamespace::UserGenerated, ROOT_ID, user_gen, &mut bufs)?;

        self.ir_buf.extend_from_slice(&bufs.auto_gen_pairs);
        if bufs.user_gen_keys.is_empty() {
            self.ir_buf.push(protocol::VALUE_EMPTY);
        } else {
            self.ir_buf.extend_from_slice(&bufs.user_gen_keys);
            self.ir_buf.extend_from_slice(&bufs.user_gen_values);
        }
        Ok(())
    }

    fn serialize_object(
        &mut self,
        namespace: KeyNamespace,
        parent_id: NodeId,
        object: &Map<String, JsonValue>,
        bufs: &mut EventBufs,
    ) -> Result<(), SerializeError> {
        for (key, value) in object {
            let node_type = json_node_type(value);
            let node_id = self.get_or_insert_node(
                namespace,
                NodeLocator::new(parent_id, key.as_str(), node_type),
            )?;
            if let JsonValue::Object(child) = value {
                if !child.is_empty() {
                    self.serialize_object(namespace, node_id, child, bufs)?;
                    continue;
                }
            }

            match namespace {
                KeyNamespace::AutoGenerated => {
                    write_node_id(&mut bufs.auto_gen_pairs, node_id, true, KEY_ID_TAGS)?;
                    write_json_leaf::<E>(&mut bufs.auto_gen_pairs, value)?;
                }
                KeyNamespace::UserGenerated => {
                    write_node_id(&mut bufs.user_gen_keys, node_id, false, KEY_ID_TAGS)?;
                    write_json_leaf::<E>(&mut bufs.user_gen_values, value)?;
                }
            }
        }
        Ok(())
    }

    fn get_or_insert_node(
        &mut self,
        namespace: KeyNamespace,
        locator: NodeLocator,
    ) -> Result<NodeId, SerializeError> {
        let tree = match namespace {
            KeyNamespace::AutoGenerated => &self.auto_gen_keys_schema_tree,
            KeyNamespace::UserGenerated => &self.user_gen_keys_schema_tree,
        };
        if let Some(node_id) = tree.try_get_node_id(&locator) {
            return Ok(node_id);
        }
        let node_id = tree.insert_node(&locator)?;

        self.ir_buf.push(protocol::node_type_to_tag(locator.node_type));
        write_node_id(
            &mut self.ir_buf,
            locator.parent_id,
            namespace.is_auto_generated(),
            PARENT_ID_TAGS,
        )?;
        write_length_prefixed(
            &mut self.ir_buf,
            locator.key_name.as_bytes(),
            STRING_LENGTH_TAGS,
        )?;
        Ok(node_id)
    }
}

/// Schema-tree node type a JSON value is stored under.
pub fn json_node_type(value: &JsonValue) -> NodeType {
    match value {
        JsonValue::Null | JsonValue::Object(_) => NodeType::Obj,
        JsonValue::Bool(_) => NodeType::Bool,
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => NodeType::Int,
        JsonValue::Number(_) => NodeType::Float,
        JsonValue::String(_) => NodeType::Str,
        JsonValue::Array(_) => NodeType::UnstructuredArray,
    }
}

fn write_number(buf: &mut Vec<u8>, n: &Number) -> Result<(), SerializeError> {
    if let Some(v) = n.as_i64() {
        write_int(buf, v);
    } else if n.is_u64() {
        return Err(SerializeError::IntegerOutOfRange(n.to_string()));
    } else {
        let v = n
            .as_f64()
            .ok_or_else(|| SerializeError::IntegerOutOfRange(n.to_string()))?;
        write_value(buf, Some(&Value::Float(v)))?;
    }
    Ok(())
}

/// Writes the value of a leaf key. Only called for leaves: a non-empty
/// object is never a leaf.
fn write_json_leaf<E: VariableEncoding>(
    buf: &mut Vec<u8>,
    value: &JsonValue,
) -> Result<(), SerializeError> {
    match value {
        JsonValue::Null => buf.push(protocol::VALUE_NULL),
        JsonValue::Object(_) => buf.push(protocol::VALUE_EMPTY),
        JsonValue::Bool(true) => buf.push(protocol::VALUE_TRUE),
        JsonValue::Bool(false) => buf.push(protocol::VALUE_FALSE),
        JsonValue::Number(n) => write_number(buf, n)?,
        JsonValue::String(s) if s.chars().any(char::is_whitespace) => {
            write_encoded_text(buf, &EncodedTextAst::<E>::encode(s))?;
        }
        JsonValue::String(s) => write_length_prefixed(buf, s.as_bytes(), STRING_LENGTH_TAGS)?,
        JsonValue::Array(_) => {
            let text = serde_json::to_string(value)?;
            write_encoded_text(buf, &EncodedTextAst::<E>::encode(&text))?;
        }
    }
    Ok(())
}
