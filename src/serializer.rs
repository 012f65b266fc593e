//! Serializer contract: encode/decode between a message payload and bytes
//! (spec.md §4.2). JSON is the baseline implementation; transports resolve
//! a serializer by name from the header.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Encodes/decodes a message payload to/from bytes. Implementations must be
/// round-trip safe: `decode(encode(v))` reproduces `v`.
pub trait Serializer: Send + Sync {
    /// Name used in `Header::serializer` to select this implementation at
    /// receive time.
    fn name(&self) -> &'static str;

    /// Encode a serializable payload.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a payload of type `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Baseline JSON serializer, grounded on `serde_json`'s use throughout the
/// teacher's event payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Process-wide registry resolving a serializer name (from `Header::serializer`)
/// to an implementation, mirroring the transport registry's name-to-factory
/// shape (spec.md §4.6).
pub struct SerializerRegistry {
    json: JsonSerializer,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self {
            json: JsonSerializer,
        }
    }
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a serializer by name. Only `"json"` is built in; additional
    /// serializers (MessagePack, protobuf) can be added without touching
    /// the dispatcher by extending this registry.
    pub fn resolve(&self, name: &str) -> Result<&JsonSerializer> {
        match name {
            "json" => Ok(&self.json),
            other => Err(Error::Argument(format!("unknown serializer '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn json_round_trips() {
        let s = JsonSerializer;
        let value = Sample {
            a: 1,
            b: "hi".to_string(),
        };
        let bytes = s.encode(&value).unwrap();
        let decoded: Sample = s.decode(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn decode_invalid_bytes_errors() {
        let s = JsonSerializer;
        let result: Result<Sample> = s.decode(b"not json");
        assert!(result.is_err());
    }

    #[test]
    fn registry_resolves_json_by_name() {
        let reg = SerializerRegistry::new();
        assert!(reg.resolve("json").is_ok());
        assert!(reg.resolve("msgpack").is_err());
    }
}
