use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid length: expected {expected} bytes, found {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("shared secret too short: need at least {minimum} bytes, found {actual}")]
    SharedSecretTooShort { minimum: usize, actual: usize },

    #[error("decapsulation failed")]
    DecapsulationFailed,

    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("authentication tag mismatch")]
    AuthenticationTagMismatch,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}
