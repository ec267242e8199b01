use thiserror::Error;

use super::ast::{FilterOperation, LiteralType};
use crate::encoded_text::EncodedTextError;
use crate::schema_tree::SchemaTreeError;

#[derive(Debug, Error)]
pub enum QueryError {
    /// The value encoding has no comparator for this literal type.
    #[error("literal type {0} isn't supported by the key-value IR")]
    UnsupportedLiteralType(LiteralType),
    /// A literal type that can never be an evaluation target.
    #[error("literal type {0} can't be evaluated")]
    UnexpectedLiteralType(LiteralType),
    #[error("invalid column '{column}': {reason}")]
    InvalidColumn { column: String, reason: &'static str },
    #[error("invalid projection '{column}': {reason}")]
    InvalidProjection { column: String, reason: &'static str },
    #[error("operation {0} requires an operand")]
    MissingOperand(FilterOperation),
    #[error("invalid string pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("failed to decode encoded text: {0}")]
    EncodedText(#[from] EncodedTextError),
    #[error("resolved column refers to a missing node: {0}")]
    SchemaTree(#[from] SchemaTreeError),
}
