//! Binary pixel payloads exchanged with execution contexts.
//!
//! Buffers are raw interleaved pixel data at 4 bytes per pixel. Channel order is never
//! interpreted here; only the byte length and the declared dimensions are checked.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per pixel of every input buffer.
pub const BYTES_PER_PIXEL: usize = 4;

/// Errors raised when a task input is malformed. These are caught before dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Image dimensions must be non-zero (got {width}x{height})")]
    ZeroDimensions { width: u32, height: u32 },

    #[error("Image dimensions overflow ({width}x{height})")]
    DimensionOverflow { width: u32, height: u32 },

    #[error("Input buffer length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("{operation}: {reason}")]
    InvalidParameter {
        operation: &'static str,
        reason: String,
    },
}

/// Byte length of a `width` x `height` buffer at 4 bytes per pixel.
pub fn checked_len(width: u32, height: u32) -> Result<usize, ValidationError> {
    checked_pixels(width, height)?
        .checked_mul(BYTES_PER_PIXEL)
        .ok_or(ValidationError::DimensionOverflow { width, height })
}

/// Pixel count of a `width` x `height` image.
pub fn checked_pixels(width: u32, height: u32) -> Result<usize, ValidationError> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or(ValidationError::DimensionOverflow { width, height })
}

/// An image buffer plus its declared dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl ImagePayload {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
        }
    }

    /// Checks the declared dimensions against the buffer length.
    pub fn validate(&self) -> Result<usize, ValidationError> {
        if self.width == 0 || self.height == 0 {
            return Err(ValidationError::ZeroDimensions {
                width: self.width,
                height: self.height,
            });
        }

        let expected = checked_len(self.width, self.height)?;
        if self.data.len() != expected {
            return Err(ValidationError::LengthMismatch {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(expected)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result buffer returned by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData {
    pub data: Bytes,
    /// Width of the produced image or mask
    pub width: u32,
    /// Height of the produced image or mask
    pub height: u32,
    /// Quality picked by compress-to-size
    pub quality: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_exact_length() {
        let payload = ImagePayload::new(vec![0u8; 2 * 3 * 4], 2, 3);
        assert_eq!(payload.validate(), Ok(24));
    }

    #[test]
    fn test_validate_rejects_zero_dimensions() {
        let payload = ImagePayload::new(Vec::new(), 0, 10);
        assert!(matches!(
            payload.validate(),
            Err(ValidationError::ZeroDimensions { width: 0, height: 10 })
        ));
    }

    #[test]
    fn test_validate_rejects_short_buffer() {
        let payload = ImagePayload::new(vec![0u8; 7], 1, 2);
        assert_eq!(
            payload.validate(),
            Err(ValidationError::LengthMismatch {
                expected: 8,
                actual: 7
            })
        );
    }
}
