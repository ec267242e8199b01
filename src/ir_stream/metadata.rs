//! Stream preamble: magic number followed by JSON metadata.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::codec::{read_string, read_u16, read_u8};
use super::error::{IrError, ProtocolError, SerializeError};
use super::protocol::{self, metadata};

/// Which variable encoding a stream's encoded text uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableEncodingKind {
    FourByte,
    EightByte,
}

impl VariableEncodingKind {
    pub fn from_magic_number(magic: [u8; 4]) -> Option<Self> {
        match magic {
            protocol::FOUR_BYTE_ENCODING_MAGIC_NUMBER => Some(Self::FourByte),
            protocol::EIGHT_BYTE_ENCODING_MAGIC_NUMBER => Some(Self::EightByte),
            _ => None,
        }
    }

    pub fn magic_number(self) -> [u8; 4] {
        match self {
            Self::FourByte => protocol::FOUR_BYTE_ENCODING_MAGIC_NUMBER,
            Self::EightByte => protocol::EIGHT_BYTE_ENCODING_MAGIC_NUMBER,
        }
    }
}

impl fmt::Display for VariableEncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FourByte => f.write_str("four-byte"),
            Self::EightByte => f.write_str("eight-byte"),
        }
    }
}

/// Metadata carried in a stream's preamble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "VERSION")]
    pub version: String,
    #[serde(rename = "VARIABLES_SCHEMA_ID", default)]
    pub variables_schema_id: Option<String>,
    #[serde(rename = "VARIABLE_ENCODING_METHODS_ID", default)]
    pub variable_encoding_methods_id: Option<String>,
    #[serde(
        rename = "USER_DEFINED_METADATA",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_defined_metadata: Option<Map<String, JsonValue>>,
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self {
            version: metadata::VERSION_VALUE.to_string(),
            variables_schema_id: Some(metadata::VARIABLES_SCHEMA_ID.to_string()),
            variable_encoding_methods_id: Some(metadata::VARIABLE_ENCODING_METHODS_ID.to_string()),
            user_defined_metadata: None,
        }
    }
}

fn major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

impl StreamMetadata {
    pub fn with_user_defined_metadata(user_defined_metadata: Map<String, JsonValue>) -> Self {
        Self {
            user_defined_metadata: Some(user_defined_metadata),
            ..Self::default()
        }
    }

    /// True if a stream written with this metadata's version can be read.
    /// Only the major and minor components have to match.
    pub fn is_version_supported(&self) -> bool {
        match (major_minor(&self.version), major_minor(metadata::VERSION_VALUE)) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => false,
        }
    }
}

/// Appends the magic number and metadata for a new stream.
pub(crate) fn write_preamble(
    buf: &mut Vec<u8>,
    magic_number: [u8; 4],
    stream_metadata: &StreamMetadata,
) -> Result<(), SerializeError> {
    let json = serde_json::to_vec(stream_metadata)?;
    buf.extend_from_slice(&magic_number);
    buf.push(metadata::ENCODING_JSON);
    if let Ok(len) = u8::try_from(json.len()) {
        buf.push(metadata::LENGTH_UBYTE);
        buf.push(len);
    } else if let Ok(len) = u16::try_from(json.len()) {
        buf.push(metadata::LENGTH_USHORT);
        buf.extend_from_slice(&len.to_be_bytes());
    } else {
        return Err(SerializeError::TooLong {
            what: "stream metadata",
            len: json.len(),
        });
    }
    buf.extend_from_slice(&json);
    Ok(())
}

/// Reads and validates a stream's magic number and metadata.
pub(crate) fn read_preamble<R: Read>(
    reader: &mut R,
) -> Result<(VariableEncodingKind, StreamMetadata), IrError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    let encoding = VariableEncodingKind::from_magic_number(magic).ok_or_else(|| {
        IrError::UnsupportedFormat(format!("unknown magic number {magic:02X?}"))
    })?;

    let encoding_tag = read_u8(reader)?;
    if encoding_tag != metadata::ENCODING_JSON {
        return Err(IrError::UnsupportedFormat(format!(
            "unknown metadata encoding {encoding_tag:#04x}"
        )));
    }
    let len = match read_u8(reader)? {
        metadata::LENGTH_UBYTE => usize::from(read_u8(reader)?),
        metadata::LENGTH_USHORT => usize::from(read_u16(reader)?),
        tag => {
            return Err(ProtocolError::UnexpectedTag {
                tag,
                context: "metadata length",
            }
            .into())
        }
    };
    let json = read_string(reader, len)?;
    let stream_metadata: StreamMetadata = serde_json::from_str(&json)
        .map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))?;
    if !stream_metadata.is_version_supported() {
        return Err(IrError::UnsupportedFormat(format!(
            "stream version {} isn't compatible with {}",
            stream_metadata.version,
            metadata::VERSION_VALUE
        )));
    }
    Ok((encoding, stream_metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_preamble_round_trip() {
        let mut user = Map::new();
        user.insert("service".to_string(), json!("api"));
        let written = StreamMetadata::with_user_defined_metadata(user);

        let mut buf = Vec::new();
        write_preamble(
            &mut buf,
            VariableEncodingKind::FourByte.magic_number(),
            &written,
        )
        .unwrap();
        assert_eq!(&buf[..4], &protocol::FOUR_BYTE_ENCODING_MAGIC_NUMBER);
        assert_eq!(buf[4], metadata::ENCODING_JSON);

        let (encoding, read) = read_preamble(&mut buf.as_slice()).unwrap();
        assert_eq!(encoding, VariableEncodingKind::FourByte);
        assert_eq!(read, written);
    }

    #[test]
    fn test_metadata_json_keys() {
        let json = serde_json::to_value(StreamMetadata::default()).unwrap();
        assert_eq!(json["VERSION"], "0.1.0");
        assert_eq!(json["VARIABLES_SCHEMA_ID"], metadata::VARIABLES_SCHEMA_ID);
        assert!(json.get("USER_DEFINED_METADATA").is_none());
    }

    #[test]
    fn test_version_compatibility() {
        let mut stream_metadata = StreamMetadata::default();
        stream_metadata.version = "0.1.7".to_string();
        assert!(stream_metadata.is_version_supported());
        stream_metadata.version = "0.2.0".to_string();
        assert!(!stream_metadata.is_version_supported());
        stream_metadata.version = "garbage".to_string();
        assert!(!stream_metadata.is_version_supported());

        let mut buf = Vec::new();
        write_preamble(
            &mut buf,
            VariableEncodingKind::EightByte.magic_number(),
            &stream_metadata,
        )
        .unwrap();
        assert!(matches!(
            read_preamble(&mut buf.as_slice()),
            Err(IrError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_bad_preamble() {
        assert!(matches!(
            read_preamble(&mut &b"\x00\x01\x02\x03"[..]),
            Err(IrError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            read_preamble(&mut &protocol::EIGHT_BYTE_ENCODING_MAGIC_NUMBER[..]),
            Err(IrError::IncompleteStream)
        ));

        let mut buf = protocol::EIGHT_BYTE_ENCODING_MAGIC_NUMBER.to_vec();
        buf.extend_from_slice(&[metadata::ENCODING_JSON, metadata::LENGTH_UBYTE, 2, b'{', b'x']);
        assert!(matches!(
            read_preamble(&mut buf.as_slice()),
            Err(IrError::Protocol(ProtocolError::InvalidMetadata(_)))
        ));
    }
}
