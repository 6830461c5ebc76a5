//! ML-KEM-1024 (FIPS 203) key exchange.
//!
//! The remote service encapsulates against the public key we register and
//! hands back a ciphertext; this side only ever generates key pairs and
//! decapsulates.

use core::fmt;

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem1024};
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::traits::{KemKeyPair, KemPublicKey};

pub const ML_KEM_PUBLIC_KEY_LEN: usize = 1568;
pub const ML_KEM_SECRET_KEY_LEN: usize = 3168;
pub const ML_KEM_CIPHERTEXT_LEN: usize = 1568;
pub const ML_KEM_SHARED_SECRET_LEN: usize = 32;

/// Minimum shared secret length needed to key AES-256.
pub const MIN_SHARED_SECRET_LEN: usize = 32;

// dk = dk_pke (384 * k) || ek || H(ek) || z, with k = 4
const EMBEDDED_PUBLIC_KEY_OFFSET: usize = 384 * 4;

type DecapsulationKey = <MlKem1024 as KemCore>::DecapsulationKey;
type EncapsulationKey = <MlKem1024 as KemCore>::EncapsulationKey;

#[derive(Clone, PartialEq, Eq)]
pub struct MlKemCiphertext {
    inner: Ciphertext<MlKem1024>,
}

impl MlKemCiphertext {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let inner: Ciphertext<MlKem1024> =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: ML_KEM_CIPHERTEXT_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self { inner })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl fmt::Debug for MlKemCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlKemCiphertext")
            .field("len", &self.inner.len())
            .finish()
    }
}

/// Shared secret recovered from a KEM exchange. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct MlKemSharedSecret {
    bytes: [u8; ML_KEM_SHARED_SECRET_LEN],
}

impl MlKemSharedSecret {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ML_KEM_SHARED_SECRET_LEN {
            return Err(CryptoError::InvalidLength {
                expected: ML_KEM_SHARED_SECRET_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ML_KEM_SHARED_SECRET_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_vec(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.bytes.to_vec())
    }
}

impl Drop for MlKemSharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for MlKemSharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MlKemSharedSecret(<redacted>)")
    }
}

#[derive(Clone, PartialEq)]
pub struct MlKemPublicKey {
    inner: EncapsulationKey,
}

impl fmt::Debug for MlKemPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.inner.as_bytes();
        f.debug_struct("MlKemPublicKey")
            .field("prefix", &hex::encode(&bytes[..8]))
            .finish()
    }
}

impl KemPublicKey for MlKemPublicKey {
    type Ciphertext = MlKemCiphertext;
    type SharedSecret = MlKemSharedSecret;

    fn encapsulate<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(Self::Ciphertext, Self::SharedSecret), CryptoError> {
        let (ct, ss) = self
            .inner
            .encapsulate(rng)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let shared = MlKemSharedSecret::from_bytes(ss.as_slice())?;
        Ok((MlKemCiphertext { inner: ct }, shared))
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.inner.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let encoded: Encoded<EncapsulationKey> =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: ML_KEM_PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self {
            inner: EncapsulationKey::from_bytes(&encoded),
        })
    }
}

pub struct MlKemKeyPair {
    secret: DecapsulationKey,
    public: MlKemPublicKey,
}

impl MlKemKeyPair {
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_bytes()
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.as_bytes().to_vec())
    }
}

impl fmt::Debug for MlKemKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlKemKeyPair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl KemKeyPair for MlKemKeyPair {
    type PublicKey = MlKemPublicKey;
    type Ciphertext = MlKemCiphertext;
    type SharedSecret = MlKemSharedSecret;

    fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let (secret, public) = MlKem1024::generate(rng);
        Self {
            secret,
            public: MlKemPublicKey { inner: public },
        }
    }

    fn decapsulate(
        &self,
        ciphertext: &Self::Ciphertext,
    ) -> Result<Self::SharedSecret, CryptoError> {
        let ss = self
            .secret
            .decapsulate(&ciphertext.inner)
            .map_err(|_| CryptoError::DecapsulationFailed)?;
        MlKemSharedSecret::from_bytes(ss.as_slice())
    }

    fn public_key(&self) -> Self::PublicKey {
        self.public.clone()
    }

    /// Rebuilds a key pair from its persisted encodings. The public key is
    /// also embedded in the decapsulation key; both copies must agree.
    fn from_parts(public_key: &[u8], private_key: &[u8]) -> Result<Self, CryptoError> {
        let secret = decapsulation_key(private_key)?;
        let public = MlKemPublicKey::from_bytes(public_key)?;
        let embedded = &private_key
            [EMBEDDED_PUBLIC_KEY_OFFSET..EMBEDDED_PUBLIC_KEY_OFFSET + ML_KEM_PUBLIC_KEY_LEN];
        if !bool::from(embedded.ct_eq(public_key)) {
            return Err(CryptoError::InvalidKey(
                "public key does not match private key",
            ));
        }
        Ok(Self { secret, public })
    }
}

fn decapsulation_key(private_key: &[u8]) -> Result<DecapsulationKey, CryptoError> {
    let encoded = Encoded::<DecapsulationKey>::try_from(private_key).map_err(|_| {
        CryptoError::InvalidLength {
            expected: ML_KEM_SECRET_KEY_LEN,
            actual: private_key.len(),
        }
    })?;
    Ok(DecapsulationKey::from_bytes(&encoded))
}

/// KEM operations the login handshake needs, over raw byte encodings.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyExchangeEngine;

impl KeyExchangeEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_key_pair(&self) -> MlKemKeyPair {
        MlKemKeyPair::generate(&mut rand::rngs::OsRng)
    }

    /// Recovers the shared secret the peer derived when it encapsulated to our
    /// public key. ML-KEM uses implicit rejection, so a well-formed but wrong
    /// ciphertext yields an unrelated secret rather than an error; the
    /// mismatch then shows up as a rejected challenge response.
    pub fn decapsulate(
        &self,
        ciphertext: &[u8],
        private_key: &[u8],
    ) -> Result<MlKemSharedSecret, CryptoError> {
        if ciphertext.len() != ML_KEM_CIPHERTEXT_LEN {
            return Err(CryptoError::DecapsulationFailed);
        }
        let ct = MlKemCiphertext::from_bytes(ciphertext)?;
        let secret = decapsulation_key(private_key)?;
        let ss = secret
            .decapsulate(&ct.inner)
            .map_err(|_| CryptoError::DecapsulationFailed)?;
        let shared = MlKemSharedSecret::from_bytes(ss.as_slice())?;
        ensure_shared_secret_len(shared.as_bytes())?;
        Ok(shared)
    }
}

pub fn ensure_shared_secret_len(secret: &[u8]) -> Result<(), CryptoError> {
    if secret.len() < MIN_SHARED_SECRET_LEN {
        return Err(CryptoError::SharedSecretTooShort {
            minimum: MIN_SHARED_SECRET_LEN,
            actual: secret.len(),
        });
    }
    Ok(())
}
