//! Stable cache keys for synthesis requests.
//!
//! The key covers every field that changes the rendered audio: text, voice,
//! model, container format, speed, instructions and content-affecting extra
//! options. Post-processing flags (chime, normalization) never reach this
//! module, so one cached utterance serves every presentation variant.

use crate::tts::SynthesisRequest;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

const KEY_VERSION: &str = "tts-relay/v1";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.short())
    }
}

/// Derives the cache key for `request`.
///
/// Callers should pass a request already resolved against defaults so that
/// an explicit default and an omitted field collide.
pub fn fingerprint(request: &SynthesisRequest) -> CacheKey {
    let mut extra = Map::new();
    let mut content: Vec<_> = request.options.extra.content_affecting().collect();
    content.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in content {
        extra.insert(key.to_owned(), canonicalize(value));
    }

    let fields: [(&str, Value); 7] = [
        ("extra", Value::Object(extra)),
        ("format", Value::from(request.format.as_str())),
        ("instructions", opt_string(request.options.instructions.as_deref())),
        ("model", opt_string(request.model.as_deref())),
        ("speed", request.options.speed.map(Value::from).unwrap_or(Value::Null)),
        ("text", Value::from(request.text.trim())),
        ("voice", opt_string(request.voice.as_deref())),
    ];
    let mut canonical = Map::new();
    for (key, value) in fields {
        canonical.insert(key.to_owned(), value);
    }

    let mut hasher = Sha256::new();
    hasher.update(KEY_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(Value::Object(canonical).to_string().as_bytes());
    CacheKey(hasher.finalize().into())
}

fn opt_string(value: Option<&str>) -> Value {
    value.map(|v| Value::from(v.trim())).unwrap_or(Value::Null)
}

/// Rebuilds `value` with object keys inserted in sorted order at every depth,
/// so serialization is independent of the map's iteration order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
