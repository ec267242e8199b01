//! Key-value IR stream encoding and decoding.
//!
//! A stream is a preamble (magic number and JSON metadata) followed by IR
//! units: schema-tree node insertions, UTC-offset changes, log events, and a
//! final end-of-stream tag.

mod codec;
pub mod deserializer;
pub mod error;
pub mod handler;
pub mod metadata;
pub mod protocol;
pub mod serializer;
pub mod transaction;

pub use deserializer::Deserializer;
pub use error::{IrError, ProtocolError, SerializeError};
pub use handler::{CollectingHandler, HandledIrUnit, IrUnitHandler, NoopHandler};
pub use metadata::{StreamMetadata, VariableEncodingKind};
pub use serializer::Serializer;
pub use transaction::IrUnitTransaction;
