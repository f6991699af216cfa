//! Envelope serialization.

use serde::{Serialize, de::DeserializeOwned};

/// Encodes request/response envelopes and rows.
///
/// Each codec declares its own error types; the transport only ever sees the
/// resulting bytes.
pub trait Codec {
    /// Error type returned by encode operations.
    type EncodeError: std::error::Error;

    /// Error type returned by decode operations.
    type DecodeError: std::error::Error;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Postcard codec: compact, deterministic binary encoding.
///
/// No schema evolution: both sides must be built from the same protocol types.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use crate::value::{Column, ColumnType, Value};

    #[test]
    fn postcard_request() {
        let request = Request::ExecuteQuery {
            transaction: 3,
            sql: "SELECT * FROM t".into(),
        };
        let encoded = PostcardCodec::encode(&request).unwrap();
        let decoded: Request = PostcardCodec::decode(&encoded).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn postcard_query_head() {
        let response = Response::QueryHead {
            result_set: "1-rs-0".into(),
            columns: vec![Column::new("id", ColumnType::Int8)],
        };
        let encoded = PostcardCodec::encode(&response).unwrap();
        let decoded: Response = PostcardCodec::decode(&encoded).unwrap();
        assert_eq!(response, decoded);
    }

    #[test]
    fn postcard_row_is_compact() {
        let row = vec![Value::Int4(1), Value::Null];
        let encoded = PostcardCodec::encode(&row).unwrap();
        // length varint, then tag + varint, then a bare tag
        assert_eq!(encoded.len(), 4);
    }

    #[test]
    fn postcard_invalid_data() {
        let result: Result<Request, _> = PostcardCodec::decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
