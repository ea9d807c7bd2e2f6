//! Cache key derivation
//!
//! Keys are `:`-separated segments. Operation parameters are folded into a
//! key as the hex SHA-256 of their canonical JSON form: objects are
//! serialized with sorted field names, so two parameter values that compare
//! equal as JSON always map to the same key.

use crate::error::{CacheError, CacheResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Write};

/// Hex SHA-256 of the canonical JSON encoding of `params`.
pub fn params_digest<P: Serialize + ?Sized>(params: &P) -> CacheResult<String> {
    // Round-tripping through `Value` sorts object keys
    let canonical = serde_json::to_value(params)
        .and_then(|value| serde_json::to_vec(&value))
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Default key for a wrapped operation: `name:<params digest>`.
pub fn derive_key<P: Serialize + ?Sized>(name: &str, params: &P) -> CacheResult<String> {
    KeyBuilder::new(name).digest(params).map(KeyBuilder::build)
}

/// Builds `:`-separated keys without intermediate allocations per segment.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    buffer: String,
}

impl KeyBuilder {
    pub fn new(prefix: &str) -> Self {
        let mut buffer = String::with_capacity(prefix.len() + 72); // prefix + ':' + digest
        buffer.push_str(prefix);
        Self { buffer }
    }

    /// Append a plain segment.
    #[must_use]
    pub fn push(mut self, segment: impl Display) -> Self {
        self.buffer.push(':');
        // Writing to a String cannot fail
        let _ = write!(self.buffer, "{segment}");
        self
    }

    /// Append the parameter digest as a segment.
    pub fn digest<P: Serialize + ?Sized>(self, params: &P) -> CacheResult<Self> {
        Ok(self.push(params_digest(params)?))
    }

    pub fn build(self) -> String {
        self.buffer
    }
}

impl fmt::Display for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buffer)
    }
}
