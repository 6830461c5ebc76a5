//! Type definitions for the login handshake

use std::fmt;

use crypto::hashes::fingerprint;
use crypto::MlKemKeyPair;
use zeroize::Zeroizing;

/// SOAP service the handshake talks to
pub const SERVICE_NAME: &str = "LepagoService";

/// Port (binding) within [`SERVICE_NAME`]
pub const PORT_NAME: &str = "LepagoPort";

/// Status string the service uses for success
pub const STATUS_OK: &str = "OK";

/// Alias identifying the client to the remote service
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encoded ML-KEM-1024 key pair as persisted and sent over the wire
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Zeroizing<Vec<u8>>,
}

impl KeyPair {
    pub fn from_ml_kem(keys: &MlKemKeyPair) -> Self {
        Self {
            public_key: keys.public_key_bytes(),
            private_key: keys.secret_key_bytes(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &fingerprint(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// The durable unit of resumable state
#[derive(Clone)]
pub struct SessionRecord {
    pub alias: Identity,
    /// Server-issued identifier, opaque to the client
    pub idc: String,
    pub shared_secret: Zeroizing<Vec<u8>>,
    pub key_pair: KeyPair,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("alias", &self.alias)
            .field("idc", &self.idc)
            .field("shared_secret", &"<redacted>")
            .field("key_pair", &self.key_pair)
            .finish()
    }
}

/// A nonce whose digest satisfies the difficulty predicate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofOfWorkSolution {
    pub nonce: u64,
    pub hash: [u8; 32],
}

impl ProofOfWorkSolution {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Handshake state machine positions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    CheckSession,
    Reanimate,
    Register,
    RespondToChallenge,
    Authenticated,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Authenticated | HandshakeState::Failed)
    }
}

/// Which branch produced the session used for the challenge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPath {
    Reanimated,
    Registered,
}

/// Successful terminal state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authenticated {
    pub path: SessionPath,
    pub alias: Identity,
    pub idc: String,
    pub nonce: u64,
}
