//! Post-quantum login handshake
//!
//! The client establishes a shared secret with the login service through
//! ML-KEM-1024, proves work on a server challenge, and answers it with the
//! proof digest sealed under AES-256-GCM. The resulting session is persisted
//! so later runs reanimate it instead of registering again.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Login Handshake                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Register    │ loginReg(alias, pk) -> idc, ct, challenge     │
//! │              │ ss = ML-KEM.Decaps(ct, sk), commit session    │
//! │  Reanimate   │ loginReq(alias, idc) -> status, challenge     │
//! │  Respond     │ SHA-256 PoW, AES-256-GCM(ss[..32], digest)    │
//! │              │ challengeResp(idc, iv || ct || tag) -> OK     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lepago_handshake::{HandshakeConfig, HandshakeOrchestrator, SessionStore, SoapGateway};
//!
//! let config = HandshakeConfig::builder()
//!     .service_description("http://gateway.local/lepago?wsdl")
//!     .endpoint("http://gateway.local/lepago")
//!     .alias("cosapi")
//!     .build()?;
//! let store = SessionStore::open(&config.state_dir)?;
//! let gateway = SoapGateway::connect(
//!     &config.service_description,
//!     &config.endpoint,
//!     config.call_timeout,
//! )
//! .await?;
//! let done = HandshakeOrchestrator::new(config, Arc::new(gateway), store)
//!     .run()
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod pow;
pub mod soap;
pub mod store;
pub mod types;

pub use config::{HandshakeConfig, HandshakeConfigBuilder};
pub use error::{
    ErrorKind, GatewayError, HandshakeError, HandshakeFailure, PersistenceError, Stage,
};
pub use gateway::{ChallengeAck, Gateway, LoginChallenge, Registration};
pub use orchestrator::HandshakeOrchestrator;
pub use pow::ProofOfWorkMiner;
pub use soap::SoapGateway;
pub use store::{SessionPresence, SessionStore};
pub use types::{
    Authenticated, HandshakeState, Identity, KeyPair, ProofOfWorkSolution, SessionPath,
    SessionRecord,
};
