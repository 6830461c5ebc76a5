pub mod aead;
pub mod error;
pub mod hashes;
pub mod ml_kem;
pub mod traits;

pub use aead::{ChallengeCipher, EncryptedEnvelope};
pub use error::CryptoError;
pub use ml_kem::{KeyExchangeEngine, MlKemKeyPair, MlKemSharedSecret};
