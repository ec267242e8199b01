//! Common test utilities for kvir integration tests.

use serde_json::{Map, Value as JsonValue};

use kvir::ir_stream::{protocol, Serializer};
use kvir::VariableEncoding;

/// Unwraps a `json!({...})` literal into its map.
pub fn object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Serializes `(auto-generated, user-generated)` event pairs into a complete
/// stream, preamble and end-of-stream tag included.
pub fn encode_stream<E: VariableEncoding>(events: &[(JsonValue, JsonValue)]) -> Vec<u8> {
    let mut serializer = Serializer::<E>::create().expect("failed to create serializer");
    for (auto_gen, user_gen) in events {
        serializer
            .serialize_json_object(&object(auto_gen.clone()), &object(user_gen.clone()))
            .expect("failed to serialize event");
    }
    let mut stream = serializer.ir_buf_view().to_vec();
    stream.push(protocol::EOF);
    stream
}

/// Same as [`encode_stream`] with only user-generated keys.
#[allow(dead_code)]
pub fn encode_user_events<E: VariableEncoding>(events: &[JsonValue]) -> Vec<u8> {
    let pairs: Vec<(JsonValue, JsonValue)> = events
        .iter()
        .map(|event| (JsonValue::Object(Map::new()), event.clone()))
        .collect();
    encode_stream::<E>(&pairs)
}
