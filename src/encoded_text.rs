//! Encoded text: a lossless, compressed representation of free-text messages.
//!
//! A message is split into a *logtype* (the constant text, with placeholders
//! where variables were) and two variable lists: *encoded variables* (integers
//! and decimal floats packed into a fixed-width integer) and *dictionary
//! variables* (every other variable-looking token, kept as a string).
//!
//! Two variable encodings exist, differing only in the width of an encoded
//! variable: [`FourByteEncoding`] (`i32`) and [`EightByteEncoding`] (`i64`).
//! The encoding is chosen per stream and is recorded by the stream's magic
//! number.
//!
//! # Logtype placeholders
//!
//! | byte   | meaning                         |
//! |--------|---------------------------------|
//! | `0x11` | encoded integer variable        |
//! | `0x12` | dictionary variable             |
//! | `0x13` | encoded float variable          |
//! | `\`    | escapes the following character |

use std::fmt;
use std::io::{self, Read};
use std::marker::PhantomData;

use thiserror::Error;

use crate::ir_stream::protocol;

pub const INTEGER_PLACEHOLDER: char = '\u{11}';
pub const DICTIONARY_PLACEHOLDER: char = '\u{12}';
pub const FLOAT_PLACEHOLDER: char = '\u{13}';
pub const ESCAPE_CHAR: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodedTextError {
    #[error("logtype references more variables than the text carries")]
    MissingVariable,
    #[error("text carries variables the logtype never references")]
    ExcessVariables,
    #[error("logtype ends with a dangling escape character")]
    DanglingEscape,
    #[error("invalid encoded float: {0:#x}")]
    InvalidEncodedFloat(i64),
}

/// A fixed-width scheme for packing integer and float variables.
pub trait VariableEncoding:
    Copy + Clone + fmt::Debug + Default + PartialEq + Send + Sync + 'static
{
    type Var: Copy + fmt::Debug + PartialEq + Send + Sync;

    /// Stream magic number identifying this encoding.
    const MAGIC_NUMBER: [u8; 4];
    /// Value tag leading an encoded-text value.
    const VALUE_TAG: u8;
    /// Payload tag leading one encoded variable.
    const VAR_TAG: u8;
    const NAME: &'static str;

    fn encode_int(token: &str) -> Option<Self::Var>;
    fn encode_float(token: &str) -> Option<Self::Var>;
    fn decode_int(var: Self::Var) -> String;
    fn decode_float(var: Self::Var) -> Result<String, EncodedTextError>;

    /// Appends the big-endian representation of `var`.
    fn write_var(var: Self::Var, buf: &mut Vec<u8>);
    fn read_var<R: Read>(reader: &mut R) -> io::Result<Self::Var>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FourByteEncoding;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EightByteEncoding;

/// Sign, digit string and decimal point position of a decimal float token.
struct FloatParts {
    negative: bool,
    digits: u64,
    num_digits: u32,
    /// Number of digits to the right of the decimal point.
    decimal_point_pos: u32,
}

fn parse_float_token(token: &str, max_digits: u32) -> Option<FloatParts> {
    let (negative, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let (int_part, frac_part) = body.split_once('.')?;
    if frac_part.is_empty() {
        return None;
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return None;
    }
    let num_digits = (int_part.len() + frac_part.len()) as u32;
    if num_digits > max_digits {
        return None;
    }
    let digits = int_part
        .bytes()
        .chain(frac_part.bytes())
        .fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0'));
    Some(FloatParts {
        negative,
        digits,
        num_digits,
        decimal_point_pos: frac_part.len() as u32,
    })
}

fn render_float(parts: FloatParts, raw: i64) -> Result<String, EncodedTextError> {
    let width = parts.num_digits as usize;
    let dp = parts.decimal_point_pos as usize;
    let digits = format!("{:0>width$}", parts.digits, width = width);
    if digits.len() > width || dp > width {
        return Err(EncodedTextError::InvalidEncodedFloat(raw));
    }
    let (int_part, frac_part) = digits.split_at(width - dp);
    let sign = if parts.negative { "-" } else { "" };
    Ok(format!("{sign}{int_part}.{frac_part}"))
}

/// True if `token` is the canonical decimal rendering of an integer, so that
/// decoding reproduces it byte for byte.
fn is_canonical_int(token: &str) -> bool {
    let body = token.strip_prefix('-').unwrap_or(token);
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if body.len() > 1 && body.starts_with('0') {
        return false;
    }
    !(body == "0" && token.starts_with('-'))
}

const FOUR_BYTE_DIGITS_BITS: u32 = 25;
const FOUR_BYTE_MAX_DIGITS: u32 = 8;
const EIGHT_BYTE_DIGITS_BITS: u32 = 55;
const EIGHT_BYTE_MAX_DIGITS: u32 = 16;

impl VariableEncoding for FourByteEncoding {
    type Var = i32;

    const MAGIC_NUMBER: [u8; 4] = protocol::FOUR_BYTE_ENCODING_MAGIC_NUMBER;
    const VALUE_TAG: u8 = protocol::VALUE_FOUR_BYTE_ENCODED_TEXT;
    const VAR_TAG: u8 = protocol::PAYLOAD_VAR_FOUR_BYTE_ENCODING;
    const NAME: &'static str = "four-byte";

    fn encode_int(token: &str) -> Option<i32> {
        if !is_canonical_int(token) {
            return None;
        }
        token.parse().ok()
    }

    fn encode_float(token: &str) -> Option<i32> {
        let parts = parse_float_token(token, FOUR_BYTE_MAX_DIGITS)?;
        if parts.digits >= 1 << FOUR_BYTE_DIGITS_BITS {
            return None;
        }
        let mut bits = u32::from(parts.negative) << 31;
        bits |= (parts.digits as u32) << 6;
        bits |= (parts.num_digits - 1) << 3;
        bits |= parts.decimal_point_pos - 1;
        Some(bits as i32)
    }

    fn decode_int(var: i32) -> String {
        var.to_string()
    }

    fn decode_float(var: i32) -> Result<String, EncodedTextError> {
        let bits = var as u32;
        let parts = FloatParts {
            negative: bits >> 31 == 1,
            digits: u64::from((bits >> 6) & ((1 << FOUR_BYTE_DIGITS_BITS) - 1)),
            num_digits: ((bits >> 3) & 0x07) + 1,
            decimal_point_pos: (bits & 0x07) + 1,
        };
        render_float(parts, i64::from(var))
    }

    fn write_var(var: i32, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&var.to_be_bytes());
    }

    fn read_var<R: Read>(reader: &mut R) -> io::Result<i32> {
        let mut bytes = [0u8; 4];
        reader.read_exact(&mut bytes)?;
        Ok(i32::from_be_bytes(bytes))
    }
}

impl VariableEncoding for EightByteEncoding {
    type Var = i64;

    const MAGIC_NUMBER: [u8; 4] = protocol::EIGHT_BYTE_ENCODING_MAGIC_NUMBER;
    const VALUE_TAG: u8 = protocol::VALUE_EIGHT_BYTE_ENCODED_TEXT;
    const VAR_TAG: u8 = protocol::PAYLOAD_VAR_EIGHT_BYTE_ENCODING;
    const NAME: &'static str = "eight-byte";

    fn encode_int(token: &str) -> Option<i64> {
        if !is_canonical_int(token) {
            return None;
        }
        token.parse().ok()
    }

    fn encode_float(token: &str) -> Option<i64> {
        let parts = parse_float_token(token, EIGHT_BYTE_MAX_DIGITS)?;
        if parts.digits >= 1 << EIGHT_BYTE_DIGITS_BITS {
            return None;
        }
        let mut bits = u64::from(parts.negative) << 63;
        bits |= parts.digits << 8;
        bits |= u64::from(parts.num_digits - 1) << 4;
        bits |= u64::from(parts.decimal_point_pos - 1);
        Some(bits as i64)
    }

    fn decode_int(var: i64) -> String {
        var.to_string()
    }

    fn decode_float(var: i64) -> Result<String, EncodedTextError> {
        let bits = var as u64;
        let parts = FloatParts {
            negative: bits >> 63 == 1,
            digits: (bits >> 8) & ((1 << EIGHT_BYTE_DIGITS_BITS) - 1),
            num_digits: ((bits >> 4) & 0x0F) as u32 + 1,
            decimal_point_pos: (bits & 0x0F) as u32 + 1,
        };
        render_float(parts, var)
    }

    fn write_var(var: i64, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&var.to_be_bytes());
    }

    fn read_var<R: Read>(reader: &mut R) -> io::Result<i64> {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes)?;
        Ok(i64::from_be_bytes(bytes))
    }
}

/// A variable as it appears in logtype order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AstVariable<'a, E: VariableEncoding> {
    Encoded(E::Var),
    Dictionary(&'a str),
}

/// Encoded text: logtype plus its dictionary and encoded variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTextAst<E: VariableEncoding> {
    logtype: String,
    dict_vars: Vec<String>,
    encoded_vars: Vec<E::Var>,
    _encoding: PhantomData<E>,
}

fn is_delimiter(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.' | '\\' | '_'))
}

/// Finds the next token at or after `from` that should be stored as a
/// variable. A token is a variable if it contains a digit, or if it directly
/// follows `=` and contains a letter.
fn next_variable_bounds(text: &str, from: usize) -> Option<(usize, usize)> {
    let mut pos = from;
    loop {
        let begin = text[pos..]
            .char_indices()
            .find(|(_, c)| !is_delimiter(*c))
            .map(|(i, _)| pos + i)?;
        let end = text[begin..]
            .char_indices()
            .find(|(_, c)| is_delimiter(*c))
            .map_or(text.len(), |(i, _)| begin + i);
        let token = &text[begin..end];
        let has_digit = token.bytes().any(|b| b.is_ascii_digit());
        let follows_equals = text[..begin].ends_with('=');
        if has_digit || (follows_equals && token.bytes().any(|b| b.is_ascii_alphabetic())) {
            return Some((begin, end));
        }
        pos = end;
    }
}

fn push_escaped_constant(logtype: &mut String, constant: &str) {
    for c in constant.chars() {
        if matches!(
            c,
            INTEGER_PLACEHOLDER | DICTIONARY_PLACEHOLDER | FLOAT_PLACEHOLDER | ESCAPE_CHAR
        ) {
            logtype.push(ESCAPE_CHAR);
        }
        logtype.push(c);
    }
}

impl<E: VariableEncoding> EncodedTextAst<E> {
    pub fn new(logtype: String, dict_vars: Vec<String>, encoded_vars: Vec<E::Var>) -> Self {
        Self {
            logtype,
            dict_vars,
            encoded_vars,
            _encoding: PhantomData,
        }
    }

    /// Encodes `text`. Never fails: a token that can't be packed into an
    /// encoded variable falls back to a dictionary variable.
    pub fn encode(text: &str) -> Self {
        let mut logtype = String::with_capacity(text.len());
        let mut dict_vars = Vec::new();
        let mut encoded_vars = Vec::new();
        let mut constant_begin = 0;

        while let Some((begin, end)) = next_variable_bounds(text, constant_begin) {
            push_escaped_constant(&mut logtype, &text[constant_begin..begin]);
            let token = &text[begin..end];
            if let Some(var) = E::encode_int(token) {
                logtype.push(INTEGER_PLACEHOLDER);
                encoded_vars.push(var);
            } else if let Some(var) = E::encode_float(token) {
                logtype.push(FLOAT_PLACEHOLDER);
                encoded_vars.push(var);
            } else {
                logtype.push(DICTIONARY_PLACEHOLDER);
                dict_vars.push(token.to_string());
            }
            constant_begin = end;
        }
        push_escaped_constant(&mut logtype, &text[constant_begin..]);

        Self::new(logtype, dict_vars, encoded_vars)
    }

    pub fn logtype(&self) -> &str {
        &self.logtype
    }

    pub fn dict_vars(&self) -> &[String] {
        &self.dict_vars
    }

    pub fn encoded_vars(&self) -> &[E::Var] {
        &self.encoded_vars
    }

    /// Lists variables in the order the logtype's placeholders reference them.
    pub fn variables_in_order(&self) -> Result<Vec<AstVariable<'_, E>>, EncodedTextError> {
        let mut dict_vars = self.dict_vars.iter();
        let mut encoded_vars = self.encoded_vars.iter();
        let mut vars = Vec::with_capacity(self.dict_vars.len() + self.encoded_vars.len());
        let mut chars = self.logtype.chars();
        while let Some(c) = chars.next() {
            match c {
                ESCAPE_CHAR => {
                    chars.next().ok_or(EncodedTextError::DanglingEscape)?;
                }
                INTEGER_PLACEHOLDER | FLOAT_PLACEHOLDER => {
                    let var = encoded_vars
                        .next()
                        .ok_or(EncodedTextError::MissingVariable)?;
                    vars.push(AstVariable::Encoded(*var));
                }
                DICTIONARY_PLACEHOLDER => {
                    let var = dict_vars.next().ok_or(EncodedTextError::MissingVariable)?;
                    vars.push(AstVariable::Dictionary(var));
                }
                _ => {}
            }
        }
        if dict_vars.next().is_some() || encoded_vars.next().is_some() {
            return Err(EncodedTextError::ExcessVariables);
        }
        Ok(vars)
    }

    /// Reconstructs the original text.
    pub fn decode_and_unparse(&self) -> Result<String, EncodedTextError> {
        let mut text = String::with_capacity(self.logtype.len() * 2);
        let mut dict_vars = self.dict_vars.iter();
        let mut encoded_vars = self.encoded_vars.iter();
        let mut chars = self.logtype.chars();
        while let Some(c) = chars.next() {
            match c {
                ESCAPE_CHAR => {
                    let escaped = chars.next().ok_or(EncodedTextError::DanglingEscape)?;
                    text.push(escaped);
                }
                INTEGER_PLACEHOLDER => {
                    let var = encoded_vars
                        .next()
                        .ok_or(EncodedTextError::MissingVariable)?;
                    text.push_str(&E::decode_int(*var));
                }
                FLOAT_PLACEHOLDER => {
                    let var = encoded_vars
                        .next()
                        .ok_or(EncodedTextError::MissingVariable)?;
                    text.push_str(&E::decode_float(*var)?);
                }
                DICTIONARY_PLACEHOLDER => {
                    let var = dict_vars.next().ok_or(EncodedTextError::MissingVariable)?;
                    text.push_str(var);
                }
                _ => text.push(c),
            }
        }
        if dict_vars.next().is_some() || encoded_vars.next().is_some() {
            return Err(EncodedTextError::ExcessVariables);
        }
        Ok(text)
    }
}
