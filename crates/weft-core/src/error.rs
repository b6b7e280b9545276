//! Core error types

use thiserror::Error;

/// Datapath errors.
///
/// These surface from setup paths (session installation, codec
/// initialization, configuration). Per-packet failures never propagate:
/// the pipelines log and drop.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Crypto error from session material
    #[error("crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),

    /// Compressor failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Compression level outside the negotiable range
    #[error("invalid compression level {0} (expected 0..=11)")]
    InvalidCompressionLevel(u8),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for datapath operations
pub type CoreResult<T> = Result<T, CoreError>;
