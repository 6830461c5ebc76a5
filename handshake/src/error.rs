//! Error types for the login handshake

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the persisted session store
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// No session has been recorded yet
    #[error("no persisted session")]
    NotFound,

    /// Persisted state exists but cannot be trusted
    #[error("corrupted session state: {0}")]
    Corrupted(String),

    /// A session record is already committed; records are never rewritten
    #[error("session record already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Another process holds the store lock
    #[error("session store {} is locked by another process", .0.display())]
    Locked(PathBuf),

    /// I/O error while reading or committing state
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the remote gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The service answered with a SOAP fault
    #[error("remote fault: {fault_string}")]
    Fault { fault_string: String },

    /// Connection, HTTP status or body read failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// The call did not complete within the configured bound
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The response was readable but missing required content
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The service description could not be loaded
    #[error("service description unavailable: {0}")]
    ServiceDescription(String),
}

/// Bound that stopped a proof-of-work search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowLimit {
    Iterations(u64),
    Elapsed(Duration),
}

impl fmt::Display for PowLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowLimit::Iterations(n) => write!(f, "{n} nonces tried"),
            PowLimit::Elapsed(d) => write!(f, "{d:?} elapsed"),
        }
    }
}

/// Errors that end a handshake attempt
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Required setup is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Remote gateway failure
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The remote call succeeded but reported a non-OK status
    #[error("{operation} returned status {status:?}")]
    Protocol {
        operation: &'static str,
        status: String,
    },

    /// KEM or AEAD failure
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Session store failure
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Mining hit its configured bound
    #[error("proof-of-work timed out ({0})")]
    ProofOfWorkTimeout(PowLimit),

    /// The attempt was cancelled by the caller
    #[error("cancelled")]
    Cancelled,
}

/// Coarse classification of a handshake failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Crypto,
    Persistence,
    ProofOfWorkTimeout,
    Cancelled,
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Configuration(_) => ErrorKind::Configuration,
            HandshakeError::Gateway(GatewayError::Malformed(_)) => ErrorKind::Protocol,
            HandshakeError::Gateway(_) => ErrorKind::Transport,
            HandshakeError::Protocol { .. } => ErrorKind::Protocol,
            HandshakeError::Crypto(_) => ErrorKind::Crypto,
            HandshakeError::Persistence(_) => ErrorKind::Persistence,
            HandshakeError::ProofOfWorkTimeout(_) => ErrorKind::ProofOfWorkTimeout,
            HandshakeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True when the persisted session exists but cannot be used.
    pub fn is_corrupted_state(&self) -> bool {
        matches!(
            self,
            HandshakeError::Persistence(PersistenceError::Corrupted(_))
        )
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        HandshakeError::Configuration(msg.into())
    }
}

/// Stage of the handshake an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    CheckSession,
    Reanimate,
    Register,
    RespondToChallenge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Init => "configuration",
            Stage::CheckSession => "session check",
            Stage::Reanimate => "reanimation",
            Stage::Register => "registration",
            Stage::RespondToChallenge => "challenge response",
        };
        f.write_str(label)
    }
}

/// Terminal `Failed` state: the stage that failed and why
#[derive(Debug, Error)]
#[error("{stage}: {error}")]
pub struct HandshakeFailure {
    pub stage: Stage,
    #[source]
    pub error: HandshakeError,
}

impl HandshakeFailure {
    pub fn new(stage: Stage, error: HandshakeError) -> Self {
        Self { stage, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Result type for handshake operations
pub type Result<T> = std::result::Result<T, HandshakeError>;
