//! Type-dispatched evaluation of a single filter against one value.

use std::cmp::Ordering;

use regex::Regex;

use super::ast::{FilterExpr, FilterOperation, Literal, LiteralType, LiteralTypeSet};
use super::error::QueryError;
use super::wildcard::compile_wildcard;
use super::QueryConfig;
use crate::schema_tree::NodeType;
use crate::value::Value;

/// Literal types a node of `node_type` can hold.
pub fn node_type_literal_types(node_type: NodeType) -> LiteralTypeSet {
    match node_type {
        NodeType::Int => LiteralTypeSet::of(&[LiteralType::Integer]),
        NodeType::Float => LiteralTypeSet::of(&[LiteralType::Float]),
        NodeType::Bool => LiteralTypeSet::of(&[LiteralType::Boolean]),
        NodeType::Str => LiteralTypeSet::of(&[LiteralType::VarString, LiteralType::ClpString]),
        NodeType::UnstructuredArray => LiteralTypeSet::of(&[LiteralType::Array]),
        NodeType::Obj => LiteralTypeSet::of(&[LiteralType::Null]),
    }
}

/// The literal type of a concrete value stored under a `node_type` key.
pub fn literal_type_of(node_type: NodeType, value: Option<&Value>) -> LiteralType {
    match (node_type, value) {
        (NodeType::Int, _) => LiteralType::Integer,
        (NodeType::Float, _) => LiteralType::Float,
        (NodeType::Bool, _) => LiteralType::Boolean,
        (NodeType::Str, Some(v)) if v.is_encoded_text() => LiteralType::ClpString,
        (NodeType::Str, _) => LiteralType::VarString,
        (NodeType::UnstructuredArray, _) => LiteralType::Array,
        (NodeType::Obj, _) => LiteralType::Null,
    }
}

fn ordering_satisfies(operation: FilterOperation, ordering: Ordering) -> bool {
    match operation {
        FilterOperation::Eq => ordering == Ordering::Equal,
        FilterOperation::Neq => ordering != Ordering::Equal,
        FilterOperation::Lt => ordering == Ordering::Less,
        FilterOperation::Gt => ordering == Ordering::Greater,
        FilterOperation::Lte => ordering != Ordering::Greater,
        FilterOperation::Gte => ordering != Ordering::Less,
        FilterOperation::Exists => true,
        FilterOperation::Nexists => false,
    }
}

fn compare_float(operation: FilterOperation, value: f64, operand: f64) -> bool {
    match value.partial_cmp(&operand) {
        Some(ordering) => ordering_satisfies(operation, ordering),
        // NaN only ever satisfies `!=`.
        None => operation == FilterOperation::Neq,
    }
}

/// Orders an integer against a float without rounding the integer.
fn cmp_int_float(value: i64, operand: f64) -> Option<Ordering> {
    // 2^63, the first float past `i64::MAX`.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if operand.is_nan() {
        return None;
    }
    if operand >= LIMIT {
        return Some(Ordering::Less);
    }
    if operand < -LIMIT {
        return Some(Ordering::Greater);
    }
    let floor = operand.floor();
    if floor == operand {
        return Some(value.cmp(&(floor as i64)));
    }
    if value <= floor as i64 {
        Some(Ordering::Less)
    } else {
        Some(Ordering::Greater)
    }
}

fn compare_int(operation: FilterOperation, value: i64, operand: &Literal) -> bool {
    match operand {
        Literal::Integer(operand) => ordering_satisfies(operation, value.cmp(operand)),
        Literal::Float(operand) => match cmp_int_float(value, *operand) {
            Some(ordering) => ordering_satisfies(operation, ordering),
            None => operation == FilterOperation::Neq,
        },
        _ => false,
    }
}

/// Whether a value of `literal_type` goes to [`CompiledFilter::evaluate`]
/// for a filter comparable with `comparable_types`. Types without a
/// comparator are always passed so the error surfaces.
pub fn should_evaluate(comparable_types: LiteralTypeSet, literal_type: LiteralType) -> bool {
    comparable_types.contains(literal_type)
        || matches!(literal_type, LiteralType::Array | LiteralType::Timestamp)
}

/// A filter with its string pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    filter: FilterExpr,
    pattern: Option<Regex>,
}

impl CompiledFilter {
    pub fn compile(filter: FilterExpr, config: &QueryConfig) -> Result<Self, QueryError> {
        let pattern = match filter.operand() {
            Some(Literal::String(s)) => Some(compile_wildcard(s, config.case_sensitive_match)?),
            _ => None,
        };
        Ok(Self { filter, pattern })
    }

    pub fn filter(&self) -> &FilterExpr {
        &self.filter
    }

    /// Literal types worth evaluating this filter against.
    pub fn comparable_types(&self) -> LiteralTypeSet {
        self.filter
            .operand()
            .map_or(LiteralTypeSet::EMPTY, Literal::comparable_types)
    }

    /// Evaluates the filter against one value of the given literal type.
    ///
    /// `EXISTS` and `NEXISTS` return without looking at the value. Array and
    /// timestamp values have no comparator; null and unknown are never valid
    /// targets.
    pub fn evaluate(
        &self,
        literal_type: LiteralType,
        value: Option<&Value>,
    ) -> Result<bool, QueryError> {
        let operation = self.filter.operation();
        match operation {
            FilterOperation::Exists => return Ok(true),
            FilterOperation::Nexists => return Ok(false),
            _ => {}
        }
        let Some(operand) = self.filter.operand() else {
            return Err(QueryError::MissingOperand(operation));
        };

        match literal_type {
            LiteralType::Array | LiteralType::Timestamp => {
                Err(QueryError::UnsupportedLiteralType(literal_type))
            }
            LiteralType::Null | LiteralType::Unknown => {
                Err(QueryError::UnexpectedLiteralType(literal_type))
            }
            LiteralType::Integer => Ok(match value.and_then(Value::as_int) {
                Some(v) => compare_int(operation, v, operand),
                None => false,
            }),
            LiteralType::Float => Ok(match (value.and_then(Value::as_float), operand) {
                (Some(v), Literal::Float(operand)) => compare_float(operation, v, *operand),
                (Some(v), Literal::Integer(operand)) => {
                    match cmp_int_float(*operand, v).map(Ordering::reverse) {
                        Some(ordering) => ordering_satisfies(operation, ordering),
                        None => operation == FilterOperation::Neq,
                    }
                }
                _ => false,
            }),
            LiteralType::Boolean => Ok(match (value.and_then(Value::as_bool), operand) {
                (Some(v), Literal::Boolean(operand)) => match operation {
                    FilterOperation::Eq => v == *operand,
                    FilterOperation::Neq => v != *operand,
                    _ => false,
                },
                _ => false,
            }),
            LiteralType::VarString => {
                let text = value.and_then(Value::as_str);
                Ok(text.is_some_and(|text| self.match_string(operation, text)))
            }
            LiteralType::ClpString => match value.map(Value::decode_encoded_text).transpose()? {
                Some(Some(text)) => Ok(self.match_string(operation, &text)),
                _ => Ok(false),
            },
        }
    }

    fn match_string(&self, operation: FilterOperation, text: &str) -> bool {
        let Some(pattern) = &self.pattern else {
            return false;
        };
        match operation {
            FilterOperation::Eq => pattern.is_match(text),
            FilterOperation::Neq => !pattern.is_match(text),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoded_text::{EightByteEncoding, EncodedTextAst};
    use crate::search::ast::ColumnDescriptor;

    fn compile(operation: FilterOperation, operand: Option<Literal>) -> CompiledFilter {
        let filter =
            FilterExpr::new(ColumnDescriptor::parse("a").unwrap(), operation, operand).unwrap();
        CompiledFilter::compile(filter, &QueryConfig::default()).unwrap()
    }

    #[test]
    fn test_numeric_comparisons() {
        let five = Value::Int(5);
        let cases = [
            (FilterOperation::Eq, Literal::Integer(5), true),
            (FilterOperation::Neq, Literal::Integer(5), false),
            (FilterOperation::Lt, Literal::Integer(6), true),
            (FilterOperation::Gte, Literal::Integer(6), false),
            (FilterOperation::Gt, Literal::Float(4.5), true),
            (FilterOperation::Lte, Literal::Float(5.0), true),
            (FilterOperation::Eq, Literal::Boolean(true), false),
        ];
        for (operation, operand, expected) in cases {
            let filter = compile(operation, Some(operand.clone()));
            assert_eq!(
                filter.evaluate(LiteralType::Integer, Some(&five)).unwrap(),
                expected,
                "{operation} {operand}"
            );
        }

        let filter = compile(FilterOperation::Lt, Some(Literal::Integer(2)));
        assert!(filter
            .evaluate(LiteralType::Float, Some(&Value::Float(1.5)))
            .unwrap());
        let filter = compile(FilterOperation::Eq, Some(Literal::Float(1.0)));
        assert!(!filter
            .evaluate(LiteralType::Float, Some(&Value::Float(f64::NAN)))
            .unwrap());
    }

    #[test]
    fn test_int_float_comparisons_are_exact() {
        // 2^53 + 1 isn't representable as a float.
        let big = Value::Int(9_007_199_254_740_993);
        let two_pow_53 = Literal::Float(9_007_199_254_740_992.0);
        let cases = [
            (FilterOperation::Eq, two_pow_53.clone(), false),
            (FilterOperation::Gt, two_pow_53.clone(), true),
            (FilterOperation::Lte, two_pow_53, false),
            (FilterOperation::Lt, Literal::Float(1e19), true),
            (FilterOperation::Gt, Literal::Float(-1e19), true),
        ];
        for (operation, operand, expected) in cases {
            let filter = compile(operation, Some(operand.clone()));
            assert_eq!(
                filter.evaluate(LiteralType::Integer, Some(&big)).unwrap(),
                expected,
                "{operation} {operand}"
            );
        }

        let five = Value::Int(5);
        for (operation, operand, expected) in [
            (FilterOperation::Lt, 5.5, true),
            (FilterOperation::Gt, 4.5, true),
            (FilterOperation::Eq, 5.0, true),
            (FilterOperation::Lte, 4.999, false),
            (FilterOperation::Neq, f64::NAN, true),
            (FilterOperation::Eq, f64::NAN, false),
        ] {
            let filter = compile(operation, Some(Literal::Float(operand)));
            assert_eq!(
                filter.evaluate(LiteralType::Integer, Some(&five)).unwrap(),
                expected,
                "{operation} {operand}"
            );
        }

        let filter = compile(FilterOperation::Eq, Some(Literal::Integer(9_007_199_254_740_993)));
        assert!(!filter
            .evaluate(LiteralType::Float, Some(&Value::Float(9_007_199_254_740_992.0)))
            .unwrap());
        let filter = compile(FilterOperation::Lt, Some(Literal::Integer(-3)));
        assert!(filter
            .evaluate(LiteralType::Float, Some(&Value::Float(-3.5)))
            .unwrap());
    }

    #[test]
    fn test_should_evaluate() {
        let strings = Literal::String("x".into()).comparable_types();
        assert!(should_evaluate(strings, LiteralType::ClpString));
        assert!(!should_evaluate(strings, LiteralType::Integer));
        assert!(should_evaluate(strings, LiteralType::Array));
        assert!(should_evaluate(
            Literal::Integer(1).comparable_types(),
            LiteralType::Timestamp
        ));
    }

    #[test]
    fn test_string_and_bool_comparisons() {
        let filter = compile(FilterOperation::Eq, Some(Literal::String("ab*".into())));
        assert!(filter
            .evaluate(LiteralType::VarString, Some(&Value::from("abc")))
            .unwrap());
        let encoded = Value::EightByteEncodedTextAst(EncodedTextAst::<EightByteEncoding>::encode(
            "ab took 12 ms",
        ));
        assert!(filter
            .evaluate(LiteralType::ClpString, Some(&encoded))
            .unwrap());
        let filter = compile(FilterOperation::Neq, Some(Literal::String("ab*".into())));
        assert!(!filter
            .evaluate(LiteralType::VarString, Some(&Value::from("abc")))
            .unwrap());
        let filter = compile(FilterOperation::Lt, Some(Literal::String("b".into())));
        assert!(!filter
            .evaluate(LiteralType::VarString, Some(&Value::from("a")))
            .unwrap());

        let filter = compile(FilterOperation::Neq, Some(Literal::Boolean(true)));
        assert!(filter
            .evaluate(LiteralType::Boolean, Some(&Value::Bool(false)))
            .unwrap());
    }

    #[test]
    fn test_exists_short_circuits() {
        let exists = compile(FilterOperation::Exists, None);
        let nexists = compile(FilterOperation::Nexists, None);
        for literal_type in [LiteralType::Array, LiteralType::Null, LiteralType::Unknown] {
            assert!(exists.evaluate(literal_type, None).unwrap());
            assert!(!nexists.evaluate(literal_type, None).unwrap());
        }
    }

    #[test]
    fn test_literal_type_errors() {
        let filter = compile(FilterOperation::Eq, Some(Literal::Integer(1)));
        for literal_type in [LiteralType::Array, LiteralType::Timestamp] {
            assert!(matches!(
                filter.evaluate(literal_type, None),
                Err(QueryError::UnsupportedLiteralType(t)) if t == literal_type
            ));
        }
        for literal_type in [LiteralType::Null, LiteralType::Unknown] {
            assert!(matches!(
                filter.evaluate(literal_type, None),
                Err(QueryError::UnexpectedLiteralType(t)) if t == literal_type
            ));
        }
    }

    #[test]
    fn test_literal_type_mapping() {
        let encoded = Value::EightByteEncodedTextAst(EncodedTextAst::<EightByteEncoding>::encode(
            "a b",
        ));
        assert_eq!(
            literal_type_of(NodeType::Str, Some(&encoded)),
            LiteralType::ClpString
        );
        assert_eq!(
            literal_type_of(NodeType::Str, Some(&Value::from("x"))),
            LiteralType::VarString
        );
        assert_eq!(literal_type_of(NodeType::Obj, None), LiteralType::Null);
        assert!(node_type_literal_types(NodeType::Str).contains(LiteralType::ClpString));
        assert!(node_type_literal_types(NodeType::Obj).contains(LiteralType::Null));
    }
}
