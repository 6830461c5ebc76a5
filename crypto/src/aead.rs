//! AES-256-GCM encryption of challenge responses.
//!
//! The service expects a 16-byte IV, so the cipher is instantiated with a
//! 16-byte nonce (the GCM counter block is then derived through GHASH, which
//! is what OpenSSL-backed peers do for non-96-bit IVs). Wire layout:
//! `IV (16) || ciphertext || tag (16)`, base64 for transport.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};

use crate::error::CryptoError;

pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_IV_LEN: usize = 16;
pub const AEAD_TAG_LEN: usize = 16;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub iv: [u8; AEAD_IV_LEN],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; AEAD_TAG_LEN],
}

impl EncryptedEnvelope {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AEAD_IV_LEN + self.ciphertext.len() + AEAD_TAG_LEN);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.auth_tag);
        out
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_wire())
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < AEAD_IV_LEN + AEAD_TAG_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "envelope is {} bytes, need at least {}",
                bytes.len(),
                AEAD_IV_LEN + AEAD_TAG_LEN
            )));
        }
        let (iv, rest) = bytes.split_at(AEAD_IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - AEAD_TAG_LEN);
        let mut iv_arr = [0u8; AEAD_IV_LEN];
        iv_arr.copy_from_slice(iv);
        let mut tag_arr = [0u8; AEAD_TAG_LEN];
        tag_arr.copy_from_slice(tag);
        Ok(Self {
            iv: iv_arr,
            ciphertext: ciphertext.to_vec(),
            auth_tag: tag_arr,
        })
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| CryptoError::InvalidEnvelope(err.to_string()))?;
        Self::from_wire(&bytes)
    }
}

/// Seals challenge-response payloads under a 256-bit key taken from the
/// KEM shared secret.
pub struct ChallengeCipher {
    cipher: Aes256Gcm16,
}

impl ChallengeCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != AEAD_KEY_LEN {
            return Err(CryptoError::InvalidLength {
                expected: AEAD_KEY_LEN,
                actual: key.len(),
            });
        }
        let cipher = Aes256Gcm16::new_from_slice(key).map_err(|_| CryptoError::InvalidLength {
            expected: AEAD_KEY_LEN,
            actual: key.len(),
        })?;
        Ok(Self { cipher })
    }

    /// Keys the cipher with the first 32 bytes of a KEM shared secret.
    pub fn from_shared_secret(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        crate::ml_kem::ensure_shared_secret_len(shared_secret)?;
        Self::new(&shared_secret[..AEAD_KEY_LEN])
    }

    /// Encrypts under a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
        let mut iv = [0u8; AEAD_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        self.encrypt_with_iv(iv, plaintext)
    }

    /// Encrypts under a caller-chosen IV. Reusing an IV under the same key
    /// breaks GCM; outside of fixed test vectors use [`Self::encrypt`].
    pub fn encrypt_with_iv(
        &self,
        iv: [u8; AEAD_IV_LEN],
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope, CryptoError> {
        let nonce = Nonce::<U16>::from_slice(&iv);
        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let tag_start = sealed.len() - AEAD_TAG_LEN;
        let mut auth_tag = [0u8; AEAD_TAG_LEN];
        auth_tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);
        Ok(EncryptedEnvelope {
            iv,
            ciphertext: sealed,
            auth_tag,
        })
    }

    /// Verifies the tag and only then returns the plaintext.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::<U16>::from_slice(&envelope.iv);
        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + AEAD_TAG_LEN);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.auth_tag);
        self.cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| CryptoError::AuthenticationTagMismatch)
    }
}
