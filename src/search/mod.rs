//! Incremental search over key-value IR streams.
//!
//! A [`QueryHandler`] is plugged into a
//! [`Deserializer`](crate::ir_stream::Deserializer) as its IR unit handler.
//! Column descriptors in the query (which may contain `*` wildcards) are
//! resolved against schema-tree nodes as the stream inserts them, so an
//! event can be evaluated as soon as it is read.

pub mod ast;
pub mod error;
pub mod evaluate;
pub mod query_handler;
pub mod wildcard;

pub use ast::{
    ColumnDescriptor, DescriptorToken, Expression, FilterExpr, FilterOperation, Literal,
    LiteralType, LiteralTypeSet,
};
pub use error::QueryError;
pub use query_handler::{AstEvaluationResult, ProjectionCallback, QueryHandler};

/// Knobs that change how a query matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    /// Whether string patterns match case-sensitively.
    pub case_sensitive_match: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            case_sensitive_match: true,
        }
    }
}
