//! Identifier validation and handshake token comparison

use hostrelay_common::TunnelError;
use subtle::ConstantTimeEq;

/// Constant-time comparison of two byte slices
///
/// Only the length is observable through timing.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Validate the identifier a client presents on the upgrade request
pub fn validate_identifier(identifier: &str, max_len: usize) -> Result<(), IdentifierError> {
    if identifier.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if identifier.len() > max_len {
        return Err(IdentifierError::TooLong {
            len: identifier.len(),
            max: max_len,
        });
    }
    if !identifier.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(IdentifierError::InvalidCharacters);
    }
    Ok(())
}

/// Identifier validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier too long: {len} bytes exceeds maximum of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("identifier contains invalid characters")]
    InvalidCharacters,
}

impl From<IdentifierError> for TunnelError {
    fn from(err: IdentifierError) -> Self {
        TunnelError::Handshake(err.to_string())
    }
}
