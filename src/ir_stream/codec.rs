//! Big-endian primitives shared by the serializer and deserializer.
//!
//! Length prefixes always use the smallest tag that fits: an unsigned byte up
//! to 255, an unsigned short up to 65535, then a signed 32-bit length up to
//! `i32::MAX`. Node ids use the smallest signed width that holds them, with
//! auto-generated ids written as their bitwise complement so the sign bit
//! tells the two id spaces apart.

use std::io::Read;

use super::error::{IrError, ProtocolError, SerializeError};
use super::protocol;
use crate::encoded_text::{AstVariable, EncodedTextAst, VariableEncoding};
use crate::schema_tree::NodeId;
use crate::value::Value;

/// Tags selecting the width of a length prefix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LengthTags {
    pub ubyte: u8,
    pub ushort: u8,
    pub int: u8,
    pub what: &'static str,
}

pub(crate) const STRING_LENGTH_TAGS: LengthTags = LengthTags {
    ubyte: protocol::STR_LEN_UBYTE,
    ushort: protocol::STR_LEN_USHORT,
    int: protocol::STR_LEN_INT,
    what: "string",
};

pub(crate) const DICT_VAR_LENGTH_TAGS: LengthTags = LengthTags {
    ubyte: protocol::PAYLOAD_VAR_STR_LEN_UBYTE,
    ushort: protocol::PAYLOAD_VAR_STR_LEN_USHORT,
    int: protocol::PAYLOAD_VAR_STR_LEN_INT,
    what: "dictionary variable",
};

pub(crate) const LOGTYPE_LENGTH_TAGS: LengthTags = LengthTags {
    ubyte: protocol::PAYLOAD_LOGTYPE_STR_LEN_UBYTE,
    ushort: protocol::PAYLOAD_LOGTYPE_STR_LEN_USHORT,
    int: protocol::PAYLOAD_LOGTYPE_STR_LEN_INT,
    what: "logtype",
};

/// Tags selecting the width of an encoded node id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeIdTags {
    pub byte: u8,
    pub short: u8,
    pub int: u8,
}

pub(crate) const PARENT_ID_TAGS: NodeIdTags = NodeIdTags {
    byte: protocol::ENCODED_PARENT_ID_BYTE,
    short: protocol::ENCODED_PARENT_ID_SHORT,
    int: protocol::ENCODED_PARENT_ID_INT,
};

pub(crate) const KEY_ID_TAGS: NodeIdTags = NodeIdTags {
    byte: protocol::ENCODED_KEY_ID_BYTE,
    short: protocol::ENCODED_KEY_ID_SHORT,
    int: protocol::ENCODED_KEY_ID_INT,
};

// Readers

pub(crate) fn read_u8<R: Read>(reader: &mut R) -> Result<u8, IrError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

macro_rules! read_be {
    ($name:ident, $ty:ty) => {
        pub(crate) fn $name<R: Read>(reader: &mut R) -> Result<$ty, IrError> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            reader.read_exact(&mut buf)?;
            Ok(<$ty>::from_be_bytes(buf))
        }
    };
}

read_be!(read_i8, i8);
read_be!(read_u16, u16);
read_be!(read_i16, i16);
read_be!(read_i32, i32);
read_be!(read_i64, i64);
read_be!(read_u64, u64);

/// Reads a length prefix if `tag` is one of `tags`; returns `None` otherwise.
pub(crate) fn read_length<R: Read>(
    reader: &mut R,
    tag: u8,
    tags: LengthTags,
) -> Result<Option<usize>, IrError> {
    let len = if tag == tags.ubyte {
        usize::from(read_u8(reader)?)
    } else if tag == tags.ushort {
        usize::from(read_u16(reader)?)
    } else if tag == tags.int {
        let len = read_i32(reader)?;
        usize::try_from(len).map_err(|_| ProtocolError::InvalidLength(len))?
    } else {
        return Ok(None);
    };
    Ok(Some(len))
}

pub(crate) fn read_string<R: Read>(reader: &mut R, len: usize) -> Result<String, IrError> {
    let mut buf = Vec::new();
    // `take` bounds the allocation by what the reader actually has.
    reader.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(IrError::IncompleteStream);
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8.into())
}

/// Reads a tagged, length-prefixed string, failing on any other tag.
pub(crate) fn read_tagged_string<R: Read>(
    reader: &mut R,
    tags: LengthTags,
    context: &'static str,
) -> Result<String, IrError> {
    let tag = read_u8(reader)?;
    let len = read_length(reader, tag, tags)?
        .ok_or(ProtocolError::UnexpectedTag { tag, context })?;
    read_string(reader, len)
}

/// Decodes a node id led by `tag`. Returns `(is_auto_generated, id)`.
pub(crate) fn read_node_id<R: Read>(
    reader: &mut R,
    tag: u8,
    tags: NodeIdTags,
    context: &'static str,
) -> Result<(bool, NodeId), IrError> {
    let encoded = if tag == tags.byte {
        i64::from(read_i8(reader)?)
    } else if tag == tags.short {
        i64::from(read_i16(reader)?)
    } else if tag == tags.int {
        i64::from(read_i32(reader)?)
    } else {
        return Err(ProtocolError::UnexpectedTag { tag, context }.into());
    };
    // Both branches land in 0..=i32::MAX.
    if encoded < 0 {
        Ok((true, !encoded as NodeId))
    } else {
        Ok((false, encoded as NodeId))
    }
}

fn read_encoded_text<E: VariableEncoding, R: Read>(
    reader: &mut R,
) -> Result<EncodedTextAst<E>, IrError> {
    let mut dict_vars = Vec::new();
    let mut encoded_vars = Vec::new();
    let logtype = loop {
        let tag = read_u8(reader)?;
        if tag == E::VAR_TAG {
            encoded_vars.push(E::read_var(reader)?);
        } else if let Some(len) = read_length(reader, tag, DICT_VAR_LENGTH_TAGS)? {
            dict_vars.push(read_string(reader, len)?);
        } else if let Some(len) = read_length(reader, tag, LOGTYPE_LENGTH_TAGS)? {
            break read_string(reader, len)?;
        } else {
            return Err(ProtocolError::UnexpectedTag {
                tag,
                context: "encoded text",
            }
            .into());
        }
    };
    let ast = EncodedTextAst::new(logtype, dict_vars, encoded_vars);
    ast.variables_in_order().map_err(ProtocolError::from)?;
    Ok(ast)
}

/// Decodes the value led by `tag`. `Ok(None)` is the empty object.
pub(crate) fn read_value<R: Read>(reader: &mut R, tag: u8) -> Result<Option<Value>, IrError> {
    use crate::encoded_text::{EightByteEncoding, FourByteEncoding};

    let value = match tag {
        protocol::VALUE_INT8 => Value::Int(i64::from(read_i8(reader)?)),
        protocol::VALUE_INT16 => Value::Int(i64::from(read_i16(reader)?)),
        protocol::VALUE_INT32 => Value::Int(i64::from(read_i32(reader)?)),
        protocol::VALUE_INT64 => Value::Int(read_i64(reader)?),
        protocol::VALUE_FLOAT => Value::Float(f64::from_bits(read_u64(reader)?)),
        protocol::VALUE_TRUE => Value::Bool(true),
        protocol::VALUE_FALSE => Value::Bool(false),
        protocol::STR_LEN_UBYTE | protocol::STR_LEN_USHORT | protocol::STR_LEN_INT => {
            let len = read_length(reader, tag, STRING_LENGTH_TAGS)?
                .ok_or(ProtocolError::UnknownValueTag(tag))?;
            Value::Str(read_string(reader, len)?)
        }
        protocol::VALUE_FOUR_BYTE_ENCODED_TEXT => {
            Value::FourByteEncodedTextAst(read_encoded_text::<FourByteEncoding, _>(reader)?)
        }
        protocol::VALUE_EIGHT_BYTE_ENCODED_TEXT => {
            Value::EightByteEncodedTextAst(read_encoded_text::<EightByteEncoding, _>(reader)?)
        }
        protocol::VALUE_EMPTY => return Ok(None),
        protocol::VALUE_NULL => Value::Null,
        _ => return Err(ProtocolError::UnknownValueTag(tag).into()),
    };
    Ok(Some(value))
}

// Writers

pub(crate) fn write_length_prefixed(
    buf: &mut Vec<u8>,
    bytes: &[u8],
    tags: LengthTags,
) -> Result<(), SerializeError> {
    let len = bytes.len();
    if let Ok(len) = u8::try_from(len) {
        buf.push(tags.ubyte);
        buf.push(len);
    } else if let Ok(len) = u16::try_from(len) {
        buf.push(tags.ushort);
        buf.extend_from_slice(&len.to_be_bytes());
    } else if let Ok(len) = i32::try_from(len) {
        buf.push(tags.int);
        buf.extend_from_slice(&len.to_be_bytes());
    } else {
        return Err(SerializeError::TooLong {
            what: tags.what,
            len,
        });
    }
    buf.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn write_node_id(
    buf: &mut Vec<u8>,
    id: NodeId,
    is_auto_generated: bool,
    tags: NodeIdTags,
) -> Result<(), SerializeError> {
    let complement = |v: i64| if is_auto_generated { !v } else { v };
    let id = i64::from(id);
    if id <= i64::from(i8::MAX) {
        buf.push(tags.byte);
        buf.extend_from_slice(&(complement(id) as i8).to_be_bytes());
    } else if id <= i64::from(i16::MAX) {
        buf.push(tags.short);
        buf.extend_from_slice(&(complement(id) as i16).to_be_bytes());
    } else if id <= i64::from(i32::MAX) {
        buf.push(tags.int);
        buf.extend_from_slice(&(complement(id) as i32).to_be_bytes());
    } else {
        return Err(SerializeError::NodeIdTooLarge(id as NodeId));
    }
    Ok(())
}

pub(crate) fn write_int(buf: &mut Vec<u8>, value: i64) {
    if let Ok(v) = i8::try_from(value) {
        buf.push(protocol::VALUE_INT8);
        buf.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = i16::try_from(value) {
        buf.push(protocol::VALUE_INT16);
        buf.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = i32::try_from(value) {
        buf.push(protocol::VALUE_INT32);
        buf.extend_from_slice(&v.to_be_bytes());
    } else {
        buf.push(protocol::VALUE_INT64);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

pub(crate) fn write_encoded_text<E: VariableEncoding>(
    buf: &mut Vec<u8>,
    ast: &EncodedTextAst<E>,
) -> Result<(), SerializeError> {
    buf.push(E::VALUE_TAG);
    for var in ast.variables_in_order()? {
        match var {
            AstVariable::Encoded(var) => {
                buf.push(E::VAR_TAG);
                E::write_var(var, buf);
            }
            AstVariable::Dictionary(var) => {
                write_length_prefixed(buf, var.as_bytes(), DICT_VAR_LENGTH_TAGS)?;
            }
        }
    }
    write_length_prefixed(buf, ast.logtype().as_bytes(), LOGTYPE_LENGTH_TAGS)
}

/// Writes a value. `None` is written as the empty object.
pub(crate) fn write_value(buf: &mut Vec<u8>, value: Option<&Value>) -> Result<(), SerializeError> {
    let Some(value) = value else {
        buf.push(protocol::VALUE_EMPTY);
        return Ok(());
    };
    match value {
        Value::Int(v) => write_int(buf, *v),
        Value::Float(v) => {
            buf.push(protocol::VALUE_FLOAT);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Bool(true) => buf.push(protocol::VALUE_TRUE),
        Value::Bool(false) => buf.push(protocol::VALUE_FALSE),
        Value::Str(v) => write_length_prefixed(buf, v.as_bytes(), STRING_LENGTH_TAGS)?,
        Value::FourByteEncodedTextAst(ast) => write_encoded_text(buf, ast)?,
        Value::EightByteEncodedTextAst(ast) => write_encoded_text(buf, ast)?,
        Value::Null => buf.push(protocol::VALUE_NULL),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoded_text::EightByteEncoding;

    #[test]
    fn test_length_prefix_smallest_fit() {
        let mut buf = Vec::new();
        write_length_prefixed(&mut buf, &[b'x'; 255], STRING_LENGTH_TAGS).unwrap();
        assert_eq!(&buf[..2], &[protocol::STR_LEN_UBYTE, 255]);

        let mut buf = Vec::new();
        write_length_prefixed(&mut buf, &[b'x'; 256], STRING_LENGTH_TAGS).unwrap();
        assert_eq!(&buf[..3], &[protocol::STR_LEN_USHORT, 0x01, 0x00]);

        let mut buf = Vec::new();
        write_length_prefixed(&mut buf, &vec![b'x'; 65536], STRING_LENGTH_TAGS).unwrap();
        assert_eq!(&buf[..5], &[protocol::STR_LEN_INT, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(buf.len(), 5 + 65536);
    }

    #[test]
    fn test_int_widths() {
        let cases: [(i64, u8, usize); 5] = [
            (0, protocol::VALUE_INT8, 1),
            (-129, protocol::VALUE_INT16, 2),
            (40_000, protocol::VALUE_INT32, 4),
            (i64::from(i32::MIN) - 1, protocol::VALUE_INT64, 8),
            (i64::MAX, protocol::VALUE_INT64, 8),
        ];
        for (value, tag, width) in cases {
            let mut buf = Vec::new();
            write_int(&mut buf, value);
            assert_eq!(buf[0], tag);
            assert_eq!(buf.len(), 1 + width);
            let decoded = read_value(&mut &buf[1..], tag).unwrap();
            assert_eq!(decoded, Some(Value::Int(value)));
        }
    }

    #[test]
    fn test_node_id_spaces() {
        for (id, is_auto) in [(0, false), (0, true), (127, true), (128, false), (40_000, true)] {
            let mut buf = Vec::new();
            write_node_id(&mut buf, id, is_auto, KEY_ID_TAGS).unwrap();
            let (tag, rest) = buf.split_first().unwrap();
            let decoded = read_node_id(&mut &rest[..], *tag, KEY_ID_TAGS, "key id").unwrap();
            assert_eq!(decoded, (is_auto, id));
        }

        let mut buf = Vec::new();
        write_node_id(&mut buf, 127, true, KEY_ID_TAGS).unwrap();
        assert_eq!(buf, vec![protocol::ENCODED_KEY_ID_BYTE, 0x80]);

        let mut buf = Vec::new();
        assert!(matches!(
            write_node_id(&mut buf, u32::MAX, false, PARENT_ID_TAGS),
            Err(SerializeError::NodeIdTooLarge(_))
        ));
    }

    #[test]
    fn test_value_errors() {
        assert!(matches!(
            read_value(&mut &[0u8; 0][..], 0x55),
            Err(IrError::Protocol(ProtocolError::UnknownValueTag(0x55)))
        ));
        // String length says 4 bytes, only 2 follow.
        assert!(matches!(
            read_value(&mut &[4u8, b'a', b'b'][..], protocol::STR_LEN_UBYTE),
            Err(IrError::IncompleteStream)
        ));
        assert!(matches!(
            read_value(&mut &[2u8, 0xff, 0xfe][..], protocol::STR_LEN_UBYTE),
            Err(IrError::Protocol(ProtocolError::InvalidUtf8))
        ));
        assert!(matches!(
            read_value(&mut &[0xffu8, 0xff, 0xff, 0xff][..], protocol::STR_LEN_INT),
            Err(IrError::Protocol(ProtocolError::InvalidLength(-1)))
        ));
    }

    #[test]
    fn test_encoded_text_value() {
        let ast = EncodedTextAst::<EightByteEncoding>::encode("user=alice took 3.5 s");
        let value = Value::EightByteEncodedTextAst(ast);
        let mut buf = Vec::new();
        write_value(&mut buf, Some(&value)).unwrap();
        assert_eq!(buf[0], protocol::VALUE_EIGHT_BYTE_ENCODED_TEXT);
        let decoded = read_value(&mut &buf[1..], buf[0]).unwrap();
        assert_eq!(decoded, Some(value));
    }
}
