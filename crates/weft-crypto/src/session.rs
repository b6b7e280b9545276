//! Packet Session Primitives
//!
//! A peer session protects packets with a legacy cipher (AES-256-CBC with a
//! session-fixed IV) and a truncated HMAC-SHA256 MAC. The CBC state restarts
//! on every packet, so each datagram decrypts independently of delivery
//! order; the sequence number lives inside the encrypted range.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{
    CIPHER_BLOCK_SIZE, CIPHER_IV_SIZE, CIPHER_KEY_SIZE, DIGEST_KEY_SIZE, MAX_MAC_LENGTH,
};
use crate::error::{CryptoError, CryptoResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES-256 key plus the session-fixed CBC IV for one direction
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    key: [u8; CIPHER_KEY_SIZE],
    iv: [u8; CIPHER_IV_SIZE],
}

impl CipherKey {
    /// Create from raw key and IV bytes
    pub fn from_bytes(key: [u8; CIPHER_KEY_SIZE], iv: [u8; CIPHER_IV_SIZE]) -> Self {
        Self { key, iv }
    }

    /// Try to create from a key-then-IV slice (48 bytes)
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != CIPHER_KEY_SIZE + CIPHER_IV_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: CIPHER_KEY_SIZE + CIPHER_IV_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; CIPHER_KEY_SIZE];
        let mut iv = [0u8; CIPHER_IV_SIZE];
        key.copy_from_slice(&slice[..CIPHER_KEY_SIZE]);
        iv.copy_from_slice(&slice[CIPHER_KEY_SIZE..]);
        Ok(Self { key, iv })
    }

    /// Generate random key material
    pub fn generate() -> Self {
        let mut key = [0u8; CIPHER_KEY_SIZE];
        let mut iv = [0u8; CIPHER_IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }
}

/// A 256-bit MAC key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DigestKey {
    bytes: [u8; DIGEST_KEY_SIZE],
}

impl DigestKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; DIGEST_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != DIGEST_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: DIGEST_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; DIGEST_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; DIGEST_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }
}

/// Per-direction packet cipher (AES-256-CBC)
pub struct PacketCipher {
    key: CipherKey,
}

impl PacketCipher {
    /// Create a cipher for one direction of a session
    pub fn new(key: CipherKey) -> Self {
        Self { key }
    }

    /// Encrypt one packet; output grows by PKCS#7 padding
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.key.into(), &self.key.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Decrypt one packet
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        Aes256CbcDec::new(&self.key.key.into(), &self.key.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// A peer's negotiated packet cipher.
///
/// `Null` passes data through unchanged (a negotiated "none" cipher). A peer
/// with no session at all holds no `SessionCipher`; that is the inactive
/// state which gates both ingress and egress.
pub enum SessionCipher {
    /// Identity transform
    Null,
    /// AES-256-CBC
    Aes256(PacketCipher),
}

impl SessionCipher {
    /// Encrypt one packet
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        match self {
            SessionCipher::Null => plaintext.to_vec(),
            SessionCipher::Aes256(cipher) => cipher.encrypt(plaintext),
        }
    }

    /// Decrypt one packet
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        match self {
            SessionCipher::Null => Ok(ciphertext.to_vec()),
            SessionCipher::Aes256(cipher) => cipher.decrypt(ciphertext),
        }
    }

    /// Worst-case ciphertext growth per packet
    pub fn overhead(&self) -> usize {
        match self {
            SessionCipher::Null => 0,
            SessionCipher::Aes256(_) => CIPHER_BLOCK_SIZE,
        }
    }
}

/// Truncated HMAC-SHA256 over the wire image of a packet
#[derive(Clone)]
pub struct PacketDigest {
    mac: HmacSha256,
    maclength: usize,
}

impl PacketDigest {
    /// Create a digest truncated to `maclength` bytes (1..=32)
    pub fn new(key: &DigestKey, maclength: usize) -> CryptoResult<Self> {
        if maclength == 0 || maclength > MAX_MAC_LENGTH {
            return Err(CryptoError::InvalidMacLength(maclength));
        }
        let mac = HmacSha256::new_from_slice(&key.bytes).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: DIGEST_KEY_SIZE,
                actual: key.bytes.len(),
            }
        })?;
        Ok(Self { mac, maclength })
    }

    /// Number of MAC bytes carried on the wire per packet
    pub fn length(&self) -> usize {
        self.maclength
    }

    /// Truncated tag over `data`
    pub fn tag(&self, data: &[u8]) -> Vec<u8> {
        let full = self.mac.clone().chain_update(data).finalize().into_bytes();
        full[..self.maclength].to_vec()
    }

    /// Verify a truncated tag in constant time
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        if tag.len() != self.maclength {
            return false;
        }
        self.mac
            .clone()
            .chain_update(data)
            .verify_truncated_left(tag)
            .is_ok()
    }
}
