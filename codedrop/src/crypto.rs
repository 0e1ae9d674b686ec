//! Chunk encryption and end-to-end integrity.
//!
//! Chunk payloads are sealed with AES-256-GCM. The 12-byte nonce of a chunk
//! is derived from its sequence number (high 8 bytes zero, low 4 bytes the
//! big-endian sequence), so retransmissions are stateless and the nonce never
//! travels on the wire. This is sound only because a fresh key is negotiated
//! for every transfer and sequence numbers are never reused within one; both
//! are enforced by the session layer and the [`Seq`] type.
//!
//! Control-plane values (the file digest, key material) use fresh random
//! nonces carried alongside the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use bytes::Bytes;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::seq::Seq;

/// AEAD key length in bytes.
pub const KEY_LEN: usize = 32;

/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// A cryptographic operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CryptoError {
    /// AEAD open failed: the ciphertext was tampered with or the key is wrong.
    Aead,
    /// A sealed value carried a nonce of the wrong length.
    BadNonce,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Aead => write!(f, "authenticated decryption failed"),
            Self::BadNonce => write!(f, "invalid nonce length"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Derives the deterministic nonce of a chunk from its sequence number.
fn chunk_nonce(seq: Seq) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[8..].copy_from_slice(&u32::from(seq).to_be_bytes());
    nonce
}

/// AEAD cipher bound to the shared key of one transfer.
pub struct TransferCipher {
    aead: Aes256Gcm,
}

impl fmt::Debug for TransferCipher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransferCipher").finish_non_exhaustive()
    }
}

impl TransferCipher {
    /// Creates the cipher from the 256-bit key yielded by the external key agreement.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self { aead: Aes256Gcm::new(key.into()) }
    }

    /// Encrypts a chunk payload under its sequence-derived nonce.
    pub fn encrypt_chunk(&self, seq: Seq, plain: &[u8]) -> Bytes {
        let nonce = chunk_nonce(seq);
        let cipher = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), Payload::from(plain))
            .expect("AES-GCM encryption is infallible for in-memory buffers");
        cipher.into()
    }

    /// Decrypts a chunk payload, reconstructing the nonce from the sequence number.
    pub fn decrypt_chunk(&self, seq: Seq, cipher: &[u8]) -> Result<Bytes, CryptoError> {
        let nonce = chunk_nonce(seq);
        self.aead
            .decrypt(Nonce::from_slice(&nonce), Payload::from(cipher))
            .map(Bytes::from)
            .map_err(|_| CryptoError::Aead)
    }

    /// Seals a control-plane value under a fresh random nonce.
    pub fn seal(&self, plain: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), Payload::from(plain))
            .expect("AES-GCM encryption is infallible for in-memory buffers");
        (nonce.to_vec(), cipher)
    }

    /// Opens a control-plane value sealed by [`seal`](Self::seal).
    pub fn open(&self, nonce: &[u8], cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::BadNonce);
        }
        self.aead
            .decrypt(Nonce::from_slice(nonce), Payload::from(cipher))
            .map_err(|_| CryptoError::Aead)
    }
}

/// Streaming SHA-256 over the plaintext file.
///
/// The sender feeds chunks in sequence order as they are produced; the
/// receiver feeds the assembled bytes. Both finalize to the digest compared
/// at the end of the transfer.
#[derive(Clone)]
pub struct FileDigest {
    hasher: Sha256,
}

impl fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileDigest").finish_non_exhaustive()
    }
}

impl Default for FileDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl FileDigest {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    /// Absorbs the next plaintext bytes.
    pub fn update(&mut self, plain: &[u8]) {
        self.hasher.update(plain);
    }

    /// Finalizes the digest.
    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

/// Convenience one-shot digest of a complete buffer.
pub fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TransferCipher {
        TransferCipher::new(&[0x42; KEY_LEN])
    }

    #[test]
    fn chunk_roundtrip() {
        let c = cipher();
        let plain = b"the quick brown fox";
        let sealed = c.encrypt_chunk(Seq(7), plain);
        assert_eq!(sealed.len(), plain.len() + TAG_LEN);
        let opened = c.decrypt_chunk(Seq(7), &sealed).unwrap();
        assert_eq!(&opened[..], plain);
    }

    #[test]
    fn wrong_seq_fails_to_open() {
        let c = cipher();
        let sealed = c.encrypt_chunk(Seq(1), b"payload");
        assert_eq!(c.decrypt_chunk(Seq(2), &sealed), Err(CryptoError::Aead));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let c = cipher();
        let mut sealed = c.encrypt_chunk(Seq(1), b"payload").to_vec();
        sealed[3] ^= 0x80;
        assert_eq!(c.decrypt_chunk(Seq(1), &sealed), Err(CryptoError::Aead));
    }

    #[test]
    fn nonce_derivation_is_deterministic() {
        let c = cipher();
        // Same seq, same key, same plaintext: identical ciphertext, which is
        // what makes stateless retransmission possible.
        assert_eq!(c.encrypt_chunk(Seq(9), b"x"), c.encrypt_chunk(Seq(9), b"x"));
        // Different seqs must differ.
        assert_ne!(c.encrypt_chunk(Seq(9), b"x"), c.encrypt_chunk(Seq(10), b"x"));
    }

    #[test]
    fn seal_uses_fresh_nonces() {
        let c = cipher();
        let (n1, c1) = c.seal(b"digest");
        let (n2, c2) = c.seal(b"digest");
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
        assert_eq!(c.open(&n1, &c1).unwrap(), b"digest");
        assert_eq!(c.open(&[0u8; 3], &c1), Err(CryptoError::BadNonce));
    }

    #[test]
    fn streaming_digest_matches_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut acc = FileDigest::new();
        for part in data.chunks(7_001) {
            acc.update(part);
        }
        assert_eq!(acc.finalize(), digest(&data));
    }
}
