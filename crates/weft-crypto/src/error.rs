//! Crypto error types

use thiserror::Error;

/// Errors from the session primitives
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material has the wrong size
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Negotiated MAC truncation is out of range
    #[error("invalid MAC length {0} (expected 1..=32)")]
    InvalidMacLength(usize),

    /// Ciphertext failed to decrypt (corrupt data or bad padding)
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
