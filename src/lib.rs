//! Key-value IR streams for structured logs.
//!
//! A stream is a sequence of IR units: schema-tree node insertions, UTC
//! offset changes and log events, each event a set of (key id, value) pairs
//! split into an auto-generated and a user-generated namespace. Text with
//! variable parts is stored as encoded text (a logtype plus extracted
//! variables).
//!
//! - [`ir_stream::Serializer`] turns JSON objects into IR units.
//! - [`ir_stream::Deserializer`] reads them back one log event at a time,
//!   rolling back any partially read event.
//! - [`search::QueryHandler`] plugs into the deserializer and evaluates a
//!   filter expression against each event as it is read.

pub mod encoded_text;
pub mod ir_stream;
pub mod log_event;
pub mod schema_tree;
pub mod search;
pub mod value;

pub use encoded_text::{EightByteEncoding, EncodedTextAst, FourByteEncoding, VariableEncoding};
pub use ir_stream::{Deserializer, IrError, Serializer};
pub use log_event::{KeyNamespace, KeyValuePairLogEvent, UtcOffset};
pub use schema_tree::{NodeId, NodeLocator, NodeType, SchemaTree, ROOT_ID};
pub use value::Value;
