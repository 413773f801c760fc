//! Pluggable argument (de)serialization for handler arguments and return
//! values.
//!
//! The concrete wire format is an external collaborator per the framework's
//! contract; this module defines the trait handlers are decoded/encoded
//! through, plus a JSON reference implementation used by the demo codec and
//! the test harness.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Failure (de)serializing a handler argument or return value.
#[derive(Debug, Error)]
#[error("serialization error: {0}")]
pub struct SerializerError(pub String);

/// Converts between wire bytes and typed handler arguments/returns.
///
/// Implementations must be stateless and safe to share across every lane
/// worker.
pub trait Serializer: Send + Sync + 'static {
    /// Serializes `value` to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError`] when `value` cannot be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    /// Deserializes `bytes` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError`] when `bytes` do not decode into `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError>;
}

/// JSON reference [`Serializer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError(e.to_string()))
    }
}
