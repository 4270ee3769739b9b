//! JSON codec using `serde_json`.

use bytes::Bytes;

use crate::error::Result;

/// JSON codec for structured payloads.
///
/// Marker struct with static methods, so the codec is picked at compile time.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Command {
        name: String,
        args: Vec<String>,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Command {
            name: "install".to_string(),
            args: vec!["vim".to_string()],
        };
        let encoded = JsonCodec::encode(&original).unwrap();
        assert_eq!(&encoded[..], br#"{"name":"install","args":["vim"]}"#);

        let decoded: Command = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_wrong_shape() {
        let result: Result<Command> = JsonCodec::decode(br#"{"name": 5}"#);
        assert!(matches!(result, Err(WorkerError::Json(_))));
    }

    #[test]
    fn test_empty_payload_is_error() {
        let result: Result<Command> = JsonCodec::decode(b"");
        assert!(result.is_err());
    }
}
