//! Typed leaf values carried by schema-tree keys.
//!
//! A [`Value`] is the datum stored against one leaf node of a log event. The
//! empty object is not a variant: it is represented by the absence of a value
//! (`Option<Value>::None`) in the event's node-id/value map, which keeps "present
//! but empty" distinct from "not present".

use std::fmt;

use crate::encoded_text::{EightByteEncoding, EncodedTextAst, EncodedTextError, FourByteEncoding};

/// One leaf datum.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Encoded text using 4-byte variable encoding.
    FourByteEncodedTextAst(EncodedTextAst<FourByteEncoding>),
    /// Encoded text using 8-byte variable encoding.
    EightByteEncodedTextAst(EncodedTextAst<EightByteEncoding>),
    Null,
}

/// Discriminant-only view of [`Value`], used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Str,
    FourByteEncodedTextAst,
    EightByteEncodedTextAst,
    Null,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::Str => "string",
            ValueKind::FourByteEncodedTextAst => "four-byte encoded text",
            ValueKind::EightByteEncodedTextAst => "eight-byte encoded text",
            ValueKind::Null => "null",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::Str(_) => ValueKind::Str,
            Value::FourByteEncodedTextAst(_) => ValueKind::FourByteEncodedTextAst,
            Value::EightByteEncodedTextAst(_) => ValueKind::EightByteEncodedTextAst,
            Value::Null => ValueKind::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true for either encoded-text variant.
    pub fn is_encoded_text(&self) -> bool {
        matches!(
            self,
            Value::FourByteEncodedTextAst(_) | Value::EightByteEncodedTextAst(_)
        )
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Decodes an encoded-text value back into its original text.
    ///
    /// Returns `Ok(None)` for values that are not encoded text.
    pub fn decode_encoded_text(&self) -> Result<Option<String>, EncodedTextError> {
        match self {
            Value::FourByteEncodedTextAst(ast) => ast.decode_and_unparse().map(Some),
            Value::EightByteEncodedTextAst(ast) => ast.decode_and_unparse().map(Some),
            _ => Ok(None),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
