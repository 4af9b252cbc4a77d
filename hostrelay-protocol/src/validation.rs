//! Frame validation for decoded peer input

use crate::constants::{MAX_CORRELATION_LEN, MAX_FRAME_SIZE};
use crate::frame::Frame;

/// Validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Stream id 0 is reserved")]
    ReservedStreamId,

    #[error("Stream {stream_id} has the wrong parity for a peer-opened stream")]
    WrongParity { stream_id: u32 },

    #[error("Correlation id too long: {len} bytes exceeds limit of {limit} bytes")]
    CorrelationTooLong { len: usize, limit: usize },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Validation limits
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_correlation_len: usize,
    pub max_payload_bytes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_correlation_len: MAX_CORRELATION_LEN,
            max_payload_bytes: MAX_FRAME_SIZE as usize,
        }
    }
}

/// Validate a decoded frame against limits.
///
/// `peer_parity` is the remainder (mod 2) of stream ids the peer is allowed
/// to open.
pub fn validate_frame(
    frame: &Frame,
    peer_parity: u32,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if frame.stream_id() == Some(0) {
        return Err(ValidationError::ReservedStreamId);
    }
    match frame {
        Frame::OpenStream {
            stream_id,
            correlation,
        } => {
            if stream_id % 2 != peer_parity {
                return Err(ValidationError::WrongParity {
                    stream_id: *stream_id,
                });
            }
            if let Some(id) = correlation {
                if id.len() > limits.max_correlation_len {
                    return Err(ValidationError::CorrelationTooLong {
                        len: id.len(),
                        limit: limits.max_correlation_len,
                    });
                }
            }
        }
        Frame::Data { data, .. } => {
            if data.len() > limits.max_payload_bytes {
                return Err(ValidationError::PayloadTooLarge {
                    size: data.len(),
                    limit: limits.max_payload_bytes,
                });
            }
        }
        _ => {}
    }
    Ok(())
}
