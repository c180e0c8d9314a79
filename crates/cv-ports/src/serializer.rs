//! Byte-level serializer port

use cv_domain::MediatorError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializer errors
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("serialize failed: {message}")]
    Serialize { message: String },

    #[error("deserialize failed: {message}")]
    Deserialize { message: String },
}

impl From<SerializerError> for MediatorError {
    fn from(e: SerializerError) -> Self {
        MediatorError::fatal(e.to_string())
    }
}

/// Byte round-trip for any serde value shape.
///
/// Implementations must round-trip scalars, ordered sequences, keyed maps,
/// and nested records, and preserve 64-bit integer precision. Decimal
/// amounts travel as strings by convention.
pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError>;
}
