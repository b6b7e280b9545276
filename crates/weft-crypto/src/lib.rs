//! Weft Cryptographic Session Primitives
//!
//! This crate provides the per-peer packet protection used by the weft
//! datapath:
//! - Legacy packet cipher (AES-256-CBC, session-fixed IV)
//! - Truncated packet MAC (HMAC-SHA256)
//!
//! The datapath applies encryption before the MAC on the way out and
//! verifies the MAC before decrypting on the way in.

pub mod error;
pub mod session;

pub use error::{CryptoError, CryptoResult};
pub use session::{CipherKey, DigestKey, PacketCipher, PacketDigest, SessionCipher};

/// Protocol constants
pub mod constants {
    /// AES-256 key size
    pub const CIPHER_KEY_SIZE: usize = 32;

    /// CBC initialization vector size
    pub const CIPHER_IV_SIZE: usize = 16;

    /// AES block size (worst-case ciphertext growth per packet)
    pub const CIPHER_BLOCK_SIZE: usize = 16;

    /// HMAC-SHA256 key size
    pub const DIGEST_KEY_SIZE: usize = 32;

    /// Full HMAC-SHA256 output size; negotiated MAC lengths truncate this
    pub const MAX_MAC_LENGTH: usize = 32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_session_flow() {
        let cipher = SessionCipher::Aes256(PacketCipher::new(CipherKey::generate()));
        let digest = PacketDigest::new(&DigestKey::generate(), 16).unwrap();

        let frame = b"an ethernet frame travelling between two peers";

        // Outbound: encrypt, then authenticate the ciphertext.
        let mut wire = cipher.encrypt(frame);
        let tag = digest.tag(&wire);
        wire.extend_from_slice(&tag);

        // Inbound: verify first, only then decrypt.
        let (body, tag) = wire.split_at(wire.len() - digest.length());
        assert!(digest.verify(body, tag));
        let plain = cipher.decrypt(body).unwrap();
        assert_eq!(plain, frame);
    }
}
