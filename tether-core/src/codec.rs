//! Serialization codecs.
//!
//! The channel pipeline only consumes this contract; concrete codecs
//! beyond the built-in JSON one are supplied by the embedding
//! application. A [`CodecRegistry`] resolves the serialization name
//! negotiated in the handshake to an instance.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::value::Value;

/// A payload serializer.
pub trait Codec: Send + Sync + 'static {
    /// Registry key, e.g. `"json"`.
    fn name(&self) -> &'static str;

    /// MIME-ish content type, e.g. `"application/json"`.
    fn content_type(&self) -> &'static str;

    /// Encode a value into frame payload bytes.
    fn serialize(&self, value: &Value) -> Result<Bytes>;

    /// Decode frame payload bytes into a value.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// UTF-8 JSON codec; the default for control channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| Error::serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Name → codec map.
///
/// Managers take a registry at construction; [`default_registry`] is a
/// process-wide convenience preloaded with JSON. Tests construct their
/// own registries to avoid hidden coupling.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    inner: Arc<RwLock<HashMap<&'static str, Arc<dyn Codec>>>>,
}

impl CodecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in JSON codec installed.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(JsonCodec));
        registry
    }

    /// Install a codec under its own name, replacing any previous one.
    pub fn register(&self, codec: Arc<dyn Codec>) {
        self.inner.write().insert(codec.name(), codec);
    }

    /// Resolve a serialization name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Codec>> {
        self.inner.read().get(name).cloned().ok_or_else(|| {
            Error::serialization(format!("no codec registered under {name:?}"))
        })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }
}

static DEFAULT_REGISTRY: Lazy<CodecRegistry> = Lazy::new(CodecRegistry::with_defaults);

/// The process-wide default registry (JSON preloaded).
#[must_use]
pub fn default_registry() -> CodecRegistry {
    DEFAULT_REGISTRY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let codec = JsonCodec;
        let value: Value = [("n".to_string(), Value::Int(42))].into_iter().collect();
        let bytes = codec.serialize(&value).unwrap();
        assert_eq!(codec.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn json_decode_garbage_fails() {
        let err = JsonCodec.deserialize(b"{not json").unwrap_err();
        assert_eq!(err.code(), "serialization");
    }

    #[test]
    fn registry_resolution() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.contains("json"));
        assert_eq!(registry.resolve("json").unwrap().name(), "json");
        assert!(registry.resolve("msgpack").is_err());
    }

    #[test]
    fn default_registry_is_shared() {
        let a = default_registry();
        let b = default_registry();
        assert!(a.contains("json"));
        assert!(b.contains("json"));
    }
}
