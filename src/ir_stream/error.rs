//! Error types for IR stream encoding and decoding.

use std::io;

use thiserror::Error;

use crate::encoded_text::EncodedTextError;
use crate::log_event::{KeyNamespace, LogEventError};
use crate::schema_tree::{NodeId, NodeLocator, SchemaTreeError};
use crate::search::QueryError;

/// Failure of a deserializer call.
///
/// Whenever a `deserialize_*` call returns an error, any schema-tree
/// insertions and UTC-offset changes read during that call have been rolled
/// back.
#[derive(Debug, Error)]
pub enum IrError {
    /// The end-of-stream tag was already consumed.
    #[error("end of stream already reached")]
    EndOfStream,
    /// The reader ran out of bytes inside an IR unit.
    #[error("stream truncated inside an IR unit")]
    IncompleteStream,
    #[error("corrupted stream: {0}")]
    Protocol(#[from] ProtocolError),
    /// Magic number or metadata version not understood. Only raised while
    /// reading the stream preamble.
    #[error("unsupported stream format: {0}")]
    UnsupportedFormat(String),
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("IR unit handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl From<io::Error> for IrError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            IrError::IncompleteStream
        } else {
            IrError::Io(err)
        }
    }
}

fn namespace_of(is_auto_generated: &bool) -> KeyNamespace {
    KeyNamespace::from_is_auto_generated(*is_auto_generated)
}

/// Structurally invalid stream content.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown value tag {0:#04x}")]
    UnknownValueTag(u8),
    #[error("unexpected tag {tag:#04x} while reading {context}")]
    UnexpectedTag { tag: u8, context: &'static str },
    #[error("negative length {0}")]
    InvalidLength(i32),
    #[error("string isn't valid UTF-8")]
    InvalidUtf8,
    #[error("{} schema tree node already exists: {locator}", namespace_of(.is_auto_generated))]
    DuplicateNode {
        is_auto_generated: bool,
        locator: NodeLocator,
    },
    #[error("invalid schema tree node insertion: {0}")]
    InvalidNode(#[from] SchemaTreeError),
    #[error("{namespace} key {node_id} appears twice in one log event")]
    DuplicateKey {
        namespace: KeyNamespace,
        node_id: NodeId,
    },
    #[error("auto-generated key {node_id} follows a user-generated key")]
    InvalidKeyOrdering { node_id: NodeId },
    #[error("invalid log event: {0}")]
    InvalidLogEvent(#[from] LogEventError),
    #[error("invalid encoded text: {0}")]
    InvalidEncodedText(#[from] EncodedTextError),
    #[error("invalid stream metadata: {0}")]
    InvalidMetadata(String),
}

/// Failure while serializing. The serializer's buffer and schema trees are
/// left as they were before the failed call.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("{what} of {len} bytes is too long to encode")]
    TooLong { what: &'static str, len: usize },
    #[error("node id {0} is too large to encode")]
    NodeIdTooLarge(NodeId),
    #[error("integer {0} doesn't fit in a signed 64-bit value")]
    IntegerOutOfRange(String),
    #[error("failed to serialize stream metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    SchemaTree(#[from] SchemaTreeError),
    #[error(transparent)]
    EncodedText(#[from] EncodedTextError),
}
