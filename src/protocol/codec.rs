//! Wire codec for frames crossing the execution context boundary.

use thiserror::Error;

use super::message::{Request, Response};

#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("Failed to encode frame: {0}")]
    Encode(String),

    #[error("Failed to decode frame: {0}")]
    Decode(String),
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(request).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode_request(frame: &[u8]) -> Result<Request, CodecError> {
    bincode::deserialize(frame).map_err(|e| CodecError::Decode(e.to_string()))
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(response).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode_response(frame: &[u8]) -> Result<Response, CodecError> {
    bincode::deserialize(frame).map_err(|e| CodecError::Decode(e.to_string()))
}
