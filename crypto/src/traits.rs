use rand::{CryptoRng, RngCore};

use crate::error::CryptoError;

/// Recipient-side view of a KEM public key. Encapsulation is what the remote
/// service does with the key we register; keeping it here lets callers model
/// the peer (tests, loopback gateways) without reaching for the raw crate.
pub trait KemPublicKey: Sized + Clone {
    type Ciphertext: Sized + Clone;
    type SharedSecret: Sized + Clone;

    fn encapsulate<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(Self::Ciphertext, Self::SharedSecret), CryptoError>;
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError>;
}

pub trait KemKeyPair: Sized {
    type PublicKey: KemPublicKey<Ciphertext = Self::Ciphertext, SharedSecret = Self::SharedSecret>;
    type Ciphertext: Sized + Clone;
    type SharedSecret: Sized + Clone;

    fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self;
    fn decapsulate(&self, ciphertext: &Self::Ciphertext)
        -> Result<Self::SharedSecret, CryptoError>;
    fn public_key(&self) -> Self::PublicKey;
    fn from_parts(public_key: &[u8], private_key: &[u8]) -> Result<Self, CryptoError>;
}
