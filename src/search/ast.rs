//! Search expressions over key-value log events.
//!
//! Columns are dotted key paths. A leading `@` selects the auto-generated
//! namespace, a bare `*` segment matches any single key, and `\` escapes the
//! next character (`\.`, `\*`, `\@`, `\\`).

use std::fmt;

use super::error::QueryError;
use crate::log_event::KeyNamespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperation {
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    Exists,
    Nexists,
}

impl FilterOperation {
    pub fn requires_operand(self) -> bool {
        !matches!(self, FilterOperation::Exists | FilterOperation::Nexists)
    }
}

impl fmt::Display for FilterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            FilterOperation::Eq => "==",
            FilterOperation::Neq => "!=",
            FilterOperation::Lt => "<",
            FilterOperation::Gt => ">",
            FilterOperation::Lte => "<=",
            FilterOperation::Gte => ">=",
            FilterOperation::Exists => "exists",
            FilterOperation::Nexists => "not exists",
        };
        f.write_str(op)
    }
}

/// Literal type categories a column value can be compared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiteralType {
    Integer,
    Float,
    /// Plain string.
    VarString,
    /// String stored as encoded text.
    ClpString,
    Boolean,
    Array,
    Timestamp,
    Null,
    Unknown,
}

impl LiteralType {
    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl fmt::Display for LiteralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LiteralType::Integer => "integer",
            LiteralType::Float => "float",
            LiteralType::VarString => "var-string",
            LiteralType::ClpString => "clp-string",
            LiteralType::Boolean => "boolean",
            LiteralType::Array => "array",
            LiteralType::Timestamp => "timestamp",
            LiteralType::Null => "null",
            LiteralType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Bit set of [`LiteralType`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LiteralTypeSet(u16);

impl LiteralTypeSet {
    pub const EMPTY: LiteralTypeSet = LiteralTypeSet(0);

    pub const fn of(types: &[LiteralType]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < types.len() {
            bits |= types[i].bit();
            i += 1;
        }
        LiteralTypeSet(bits)
    }

    pub fn contains(self, literal_type: LiteralType) -> bool {
        self.0 & literal_type.bit() != 0
    }

    pub fn insert(&mut self, literal_type: LiteralType) {
        self.0 |= literal_type.bit();
    }

    pub fn intersects(self, other: LiteralTypeSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<LiteralType> for LiteralTypeSet {
    fn from_iter<I: IntoIterator<Item = LiteralType>>(iter: I) -> Self {
        let mut set = LiteralTypeSet::EMPTY;
        for literal_type in iter {
            set.insert(literal_type);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// A wildcard pattern: `*` matches any run of characters, `?` any one.
    String(String),
}

impl Literal {
    /// Column literal types this operand can be compared against.
    pub fn comparable_types(&self) -> LiteralTypeSet {
        match self {
            Literal::Integer(_) | Literal::Float(_) => {
                LiteralTypeSet::of(&[LiteralType::Integer, LiteralType::Float])
            }
            Literal::Boolean(_) => LiteralTypeSet::of(&[LiteralType::Boolean]),
            Literal::String(_) => {
                LiteralTypeSet::of(&[LiteralType::VarString, LiteralType::ClpString])
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Boolean(v) => write!(f, "{v}"),
            Literal::String(v) => write!(f, "\"{v}\""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorToken {
    Key(String),
    /// Matches exactly one key of any name.
    Wildcard,
}

impl DescriptorToken {
    pub fn matches(&self, key_name: &str) -> bool {
        match self {
            DescriptorToken::Key(key) => key == key_name,
            DescriptorToken::Wildcard => true,
        }
    }
}

/// A parsed column: namespace plus key path tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDescriptor {
    namespace: KeyNamespace,
    tokens: Vec<DescriptorToken>,
}

impl ColumnDescriptor {
    pub fn new(namespace: KeyNamespace, tokens: Vec<DescriptorToken>) -> Self {
        Self { namespace, tokens }
    }

    pub fn parse(column: &str) -> Result<Self, QueryError> {
        let invalid = |reason| QueryError::InvalidColumn {
            column: column.to_string(),
            reason,
        };

        let (namespace, path) = match column.strip_prefix('@') {
            Some(rest) => (KeyNamespace::AutoGenerated, rest),
            None => (KeyNamespace::UserGenerated, column),
        };

        let mut tokens = Vec::new();
        let mut segment = String::new();
        // Whether `segment` is exactly one unescaped `*`.
        let mut bare_star = false;
        let mut chars = path.chars();
        loop {
            let next = chars.next();
            match next {
                Some('\\') => {
                    if bare_star {
                        return Err(invalid("'*' must be a whole key"));
                    }
                    let escaped = chars.next().ok_or_else(|| invalid("dangling escape"))?;
                    segment.push(escaped);
                }
                Some('*') => {
                    if !segment.is_empty() || bare_star {
                        return Err(invalid("'*' must be a whole key"));
                    }
                    bare_star = true;
                }
                Some('.') | None => {
                    if bare_star {
                        tokens.push(DescriptorToken::Wildcard);
                    } else if segment.is_empty() {
                        return Err(invalid("empty key"));
                    } else {
                        tokens.push(DescriptorToken::Key(std::mem::take(&mut segment)));
                    }
                    bare_star = false;
                    if next.is_none() {
                        break;
                    }
                }
                Some(c) => {
                    if bare_star {
                        return Err(invalid("'*' must be a whole key"));
                    }
                    segment.push(c);
                }
            }
        }
        Ok(Self { namespace, tokens })
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    pub fn tokens(&self) -> &[DescriptorToken] {
        &self.tokens
    }

    pub fn has_wildcard(&self) -> bool {
        self.tokens.contains(&DescriptorToken::Wildcard)
    }
}

/// A single-column predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    column: ColumnDescriptor,
    operation: FilterOperation,
    operand: Option<Literal>,
}

impl FilterExpr {
    pub fn new(
        column: ColumnDescriptor,
        operation: FilterOperation,
        operand: Option<Literal>,
    ) -> Result<Self, QueryError> {
        if operation.requires_operand() && operand.is_none() {
            return Err(QueryError::MissingOperand(operation));
        }
        Ok(Self {
            column,
            operation,
            operand,
        })
    }

    pub fn column(&self) -> &ColumnDescriptor {
        &self.column
    }

    pub fn operation(&self) -> FilterOperation {
        self.operation
    }

    pub fn operand(&self) -> Option<&Literal> {
        self.operand.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    Filter(FilterExpr),
}

impl Expression {
    /// Parses `column` and builds a filter leaf.
    pub fn filter(
        column: &str,
        operation: FilterOperation,
        operand: Option<Literal>,
    ) -> Result<Self, QueryError> {
        let column = ColumnDescriptor::parse(column)?;
        Ok(Expression::Filter(FilterExpr::new(column, operation, operand)?))
    }

    pub fn negate(self) -> Self {
        Expression::Not(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> DescriptorToken {
        DescriptorToken::Key(name.to_string())
    }

    #[test]
    fn test_parse_columns() {
        let column = ColumnDescriptor::parse("*.b").unwrap();
        assert_eq!(column.namespace(), KeyNamespace::UserGenerated);
        assert_eq!(column.tokens(), &[DescriptorToken::Wildcard, key("b")]);
        assert!(column.has_wildcard());

        let column = ColumnDescriptor::parse("@ts").unwrap();
        assert_eq!(column.namespace(), KeyNamespace::AutoGenerated);
        assert_eq!(column.tokens(), &[key("ts")]);

        let column = ColumnDescriptor::parse(r"a\.b.\*.\@c").unwrap();
        assert_eq!(column.tokens(), &[key("a.b"), key("*"), key("@c")]);
        assert!(!column.has_wildcard());
    }

    #[test]
    fn test_parse_invalid_columns() {
        for column in ["", "a..b", "a.", ".a", "a*", "*a", "**", "a\\", "@"] {
            assert!(
                matches!(
                    ColumnDescriptor::parse(column),
                    Err(QueryError::InvalidColumn { .. })
                ),
                "{column}"
            );
        }
    }

    #[test]
    fn test_filter_requires_operand() {
        assert!(matches!(
            Expression::filter("a", FilterOperation::Eq, None),
            Err(QueryError::MissingOperand(FilterOperation::Eq))
        ));
        assert!(Expression::filter("a", FilterOperation::Exists, None).is_ok());
    }

    #[test]
    fn test_literal_type_set() {
        let set: LiteralTypeSet = [LiteralType::Integer, LiteralType::ClpString]
            .into_iter()
            .collect();
        assert!(set.contains(LiteralType::Integer));
        assert!(!set.contains(LiteralType::VarString));
        assert!(set.intersects(Literal::String("x".into()).comparable_types()));
        assert!(!set.intersects(Literal::Boolean(true).comparable_types()));
        assert!(LiteralTypeSet::EMPTY.is_empty());
    }
}
