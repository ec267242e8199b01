//! Byte-level vocabulary of the key-value IR stream.
//!
//! The leading byte of every IR unit is classified in two stages: first
//! [`classify_tag`] maps it to an [`IrUnitType`] by exact value or bit range,
//! then the deserializer decodes the kind-specific payload.

use crate::schema_tree::NodeType;

pub const FOUR_BYTE_ENCODING_MAGIC_NUMBER: [u8; 4] = [0xFD, 0x2F, 0xB5, 0x29];
pub const EIGHT_BYTE_ENCODING_MAGIC_NUMBER: [u8; 4] = [0xFD, 0x2F, 0xB5, 0x30];

pub mod metadata {
    pub const ENCODING_JSON: u8 = 0x01;
    pub const LENGTH_UBYTE: u8 = 0x11;
    pub const LENGTH_USHORT: u8 = 0x12;

    pub const VERSION_VALUE: &str = "0.1.0";
    pub const VARIABLES_SCHEMA_ID: &str = "kvir.variables-schema.v2";
    pub const VARIABLE_ENCODING_METHODS_ID: &str = "kvir.variable-encoding-methods.v1";
}

pub const EOF: u8 = 0x00;

// Encoded-text payload.
pub const PAYLOAD_VAR_STR_LEN_UBYTE: u8 = 0x11;
pub const PAYLOAD_VAR_STR_LEN_USHORT: u8 = 0x12;
pub const PAYLOAD_VAR_STR_LEN_INT: u8 = 0x13;
pub const PAYLOAD_VAR_FOUR_BYTE_ENCODING: u8 = 0x18;
pub const PAYLOAD_VAR_EIGHT_BYTE_ENCODING: u8 = 0x19;
pub const PAYLOAD_LOGTYPE_STR_LEN_UBYTE: u8 = 0x21;
pub const PAYLOAD_LOGTYPE_STR_LEN_USHORT: u8 = 0x22;
pub const PAYLOAD_LOGTYPE_STR_LEN_INT: u8 = 0x23;

pub const UTC_OFFSET_CHANGE: u8 = 0x3F;

pub const STR_LEN_UBYTE: u8 = 0x41;
pub const STR_LEN_USHORT: u8 = 0x42;
pub const STR_LEN_INT: u8 = 0x43;

pub const VALUE_INT8: u8 = 0x51;
pub const VALUE_INT16: u8 = 0x52;
pub const VALUE_INT32: u8 = 0x53;
pub const VALUE_INT64: u8 = 0x54;
pub const VALUE_FLOAT: u8 = 0x56;
pub const VALUE_TRUE: u8 = 0x57;
pub const VALUE_FALSE: u8 = 0x58;
pub const VALUE_FOUR_BYTE_ENCODED_TEXT: u8 = 0x59;
pub const VALUE_EIGHT_BYTE_ENCODED_TEXT: u8 = 0x5A;
pub const VALUE_EMPTY: u8 = 0x5E;
pub const VALUE_NULL: u8 = 0x5F;

pub const ENCODED_PARENT_ID_BYTE: u8 = 0x60;
pub const ENCODED_PARENT_ID_SHORT: u8 = 0x61;
pub const ENCODED_PARENT_ID_INT: u8 = 0x62;

pub const ENCODED_KEY_ID_BYTE: u8 = 0x65;
pub const ENCODED_KEY_ID_SHORT: u8 = 0x66;
pub const ENCODED_KEY_ID_INT: u8 = 0x67;

pub const SCHEMA_TREE_NODE_MASK: u8 = 0x70;
pub const SCHEMA_TREE_NODE_INT: u8 = 0x71;
pub const SCHEMA_TREE_NODE_FLOAT: u8 = 0x72;
pub const SCHEMA_TREE_NODE_BOOL: u8 = 0x73;
pub const SCHEMA_TREE_NODE_STR: u8 = 0x74;
pub const SCHEMA_TREE_NODE_UNSTRUCTURED_ARRAY: u8 = 0x75;
pub const SCHEMA_TREE_NODE_OBJ: u8 = 0x76;

/// Kind of IR unit selected by a unit's leading tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrUnitType {
    EndOfStream,
    UtcOffsetChange,
    SchemaTreeNodeInsertion,
    LogEvent,
}

/// Maps a unit's leading tag to its kind.
///
/// Tags with the schema-tree-node bits set are insertions even when the low
/// bits name no node type; [`node_type_from_tag`] rejects those afterwards.
pub fn classify_tag(tag: u8) -> IrUnitType {
    match tag {
        EOF => IrUnitType::EndOfStream,
        UTC_OFFSET_CHANGE => IrUnitType::UtcOffsetChange,
        t if t & 0xF0 == SCHEMA_TREE_NODE_MASK => IrUnitType::SchemaTreeNodeInsertion,
        _ => IrUnitType::LogEvent,
    }
}

pub fn node_type_from_tag(tag: u8) -> Option<NodeType> {
    match tag {
        SCHEMA_TREE_NODE_INT => Some(NodeType::Int),
        SCHEMA_TREE_NODE_FLOAT => Some(NodeType::Float),
        SCHEMA_TREE_NODE_BOOL => Some(NodeType::Bool),
        SCHEMA_TREE_NODE_STR => Some(NodeType::Str),
        SCHEMA_TREE_NODE_UNSTRUCTURED_ARRAY => Some(NodeType::UnstructuredArray),
        SCHEMA_TREE_NODE_OBJ => Some(NodeType::Obj),
        _ => None,
    }
}

pub fn node_type_to_tag(node_type: NodeType) -> u8 {
    match node_type {
        NodeType::Int => SCHEMA_TREE_NODE_INT,
        NodeType::Float => SCHEMA_TREE_NODE_FLOAT,
        NodeType::Bool => SCHEMA_TREE_NODE_BOOL,
        NodeType::Str => SCHEMA_TREE_NODE_STR,
        NodeType::UnstructuredArray => SCHEMA_TREE_NODE_UNSTRUCTURED_ARRAY,
        NodeType::Obj => SCHEMA_TREE_NODE_OBJ,
    }
}

pub fn is_encoded_key_id_tag(tag: u8) -> bool {
    matches!(
        tag,
        ENCODED_KEY_ID_BYTE | ENCODED_KEY_ID_SHORT | ENCODED_KEY_ID_INT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tag() {
        assert_eq!(classify_tag(EOF), IrUnitType::EndOfStream);
        assert_eq!(classify_tag(UTC_OFFSET_CHANGE), IrUnitType::UtcOffsetChange);
        for tag in SCHEMA_TREE_NODE_INT..=SCHEMA_TREE_NODE_OBJ {
            assert_eq!(classify_tag(tag), IrUnitType::SchemaTreeNodeInsertion);
        }
        assert_eq!(classify_tag(0x7F), IrUnitType::SchemaTreeNodeInsertion);
        for tag in [ENCODED_KEY_ID_BYTE, VALUE_EMPTY, VALUE_INT8, STR_LEN_UBYTE] {
            assert_eq!(classify_tag(tag), IrUnitType::LogEvent);
        }
    }

    #[test]
    fn test_node_type_tags() {
        for tag in SCHEMA_TREE_NODE_INT..=SCHEMA_TREE_NODE_OBJ {
            let node_type = node_type_from_tag(tag).unwrap();
            assert_eq!(node_type_to_tag(node_type), tag);
        }
        assert_eq!(node_type_from_tag(SCHEMA_TREE_NODE_MASK), None);
        assert_eq!(node_type_from_tag(0x77), None);
    }
}
