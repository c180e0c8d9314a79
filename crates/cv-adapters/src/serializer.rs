//! JSON serializer adapter

use cv_ports::{Serializer, SerializerError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON byte serializer.
///
/// serde_json keeps full i64/u64 precision and arbitrary nesting; decimal
/// amounts travel as strings by caller convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError::Serialize {
            message: e.to_string(),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Deserialize {
            message: e.to_string(),
        })
    }
}
