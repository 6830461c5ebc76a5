//! Handshake state machine
//!
//! ```text
//! Init -> CheckSession -> Reanimate ---+-> RespondToChallenge -> Authenticated
//!                      \-> Register ---/                      \-> Failed
//! ```
//!
//! Reanimate always wins when a complete session is persisted. A corrupted
//! session fails the attempt instead of falling through to Register, since
//! the server may still associate the old keys with the persisted idc.
//! Registration commits the new session before any proof-of-work runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto::hashes::fingerprint;
use crypto::{ChallengeCipher, KeyExchangeEngine};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HandshakeConfig;
use crate::error::{
    GatewayError, HandshakeError, HandshakeFailure, PersistenceError, Result, Stage,
};
use crate::gateway::Gateway;
use crate::pow::ProofOfWorkMiner;
use crate::store::{SessionPresence, SessionStore};
use crate::types::{
    Authenticated, HandshakeState, KeyPair, SessionPath, SessionRecord, STATUS_OK,
};

pub struct HandshakeOrchestrator {
    config: HandshakeConfig,
    gateway: Arc<dyn Gateway>,
    store: SessionStore,
    kem: KeyExchangeEngine,
    miner: ProofOfWorkMiner,
    cancel: CancellationToken,
    state: HandshakeState,
}

impl HandshakeOrchestrator {
    pub fn new(config: HandshakeConfig, gateway: Arc<dyn Gateway>, store: SessionStore) -> Self {
        let miner = ProofOfWorkMiner::new(config.difficulty)
            .with_max_iterations(config.pow_max_iterations);
        Self {
            config,
            gateway,
            store,
            kem: KeyExchangeEngine::new(),
            miner,
            cancel: CancellationToken::new(),
            state: HandshakeState::Init,
        }
    }

    /// Share a cancellation token with the caller (shutdown signal, etc).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn into_store(self) -> SessionStore {
        self.store
    }

    /// Run one handshake attempt to a terminal state.
    pub async fn run(&mut self) -> std::result::Result<Authenticated, HandshakeFailure> {
        let started = Instant::now();
        let outcome = self.drive().await;
        match &outcome {
            Ok(done) => {
                self.enter(HandshakeState::Authenticated);
                info!(
                    alias = %done.alias,
                    idc = %done.idc,
                    path = ?done.path,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "authenticated"
                );
            }
            Err(failure) => {
                self.enter(HandshakeState::Failed);
                error!(
                    stage = %failure.stage,
                    kind = ?failure.kind(),
                    error = %failure.error,
                    "handshake failed"
                );
            }
        }
        outcome
    }

    async fn drive(&mut self) -> std::result::Result<Authenticated, HandshakeFailure> {
        self.enter(HandshakeState::Init);
        self.config
            .validate()
            .map_err(|err| HandshakeFailure::new(Stage::Init, err))?;

        self.enter(HandshakeState::CheckSession);
        self.check_cancelled(Stage::CheckSession)?;
        let (session, challenge, path) = match self.store.probe() {
            SessionPresence::Corrupted(reason) => {
                return Err(HandshakeFailure::new(
                    Stage::CheckSession,
                    PersistenceError::Corrupted(reason).into(),
                ));
            }
            SessionPresence::Present => {
                self.enter(HandshakeState::Reanimate);
                self.check_cancelled(Stage::Reanimate)?;
                let (session, challenge) = self
                    .reanimate()
                    .await
                    .map_err(|err| HandshakeFailure::new(Stage::Reanimate, err))?;
                (session, challenge, SessionPath::Reanimated)
            }
            SessionPresence::Absent => {
                self.enter(HandshakeState::Register);
                self.check_cancelled(Stage::Register)?;
                let (session, challenge) = self
                    .register()
                    .await
                    .map_err(|err| HandshakeFailure::new(Stage::Register, err))?;
                (session, challenge, SessionPath::Registered)
            }
        };

        self.enter(HandshakeState::RespondToChallenge);
        self.check_cancelled(Stage::RespondToChallenge)?;
        let nonce = self
            .respond(&session, &challenge)
            .await
            .map_err(|err| HandshakeFailure::new(Stage::RespondToChallenge, err))?;

        Ok(Authenticated {
            path,
            alias: session.alias.clone(),
            idc: session.idc.clone(),
            nonce,
        })
    }

    async fn reanimate(&self) -> Result<(SessionRecord, String)> {
        let session = self.store.load()?;
        if session.alias != self.config.alias {
            warn!(
                persisted = %session.alias,
                configured = %self.config.alias,
                "configured alias differs from the persisted session, using the persisted one"
            );
        }
        info!(alias = %session.alias, idc = %session.idc, "reanimating persisted session");

        let reply = self
            .remote(
                "loginReq",
                self.gateway.login_req(session.alias.as_str(), &session.idc),
            )
            .await?;
        if reply.status != STATUS_OK {
            return Err(HandshakeError::Protocol {
                operation: "loginReq",
                status: reply.status,
            });
        }
        Ok((session, reply.challenge))
    }

    async fn register(&self) -> Result<(SessionRecord, String)> {
        let keys = self.kem.generate_key_pair();
        let key_pair = KeyPair::from_ml_kem(&keys);
        drop(keys);
        let public_key = STANDARD.encode(&key_pair.public_key);
        info!(
            alias = %self.config.alias,
            public_key = %fingerprint(&key_pair.public_key),
            "registering new ML-KEM-1024 key pair"
        );

        let reply = self
            .remote(
                "loginReg",
                self.gateway
                    .login_reg(self.config.alias.as_str(), &public_key),
            )
            .await?;
        if let Some(status) = reply.status.as_deref() {
            if status != STATUS_OK {
                return Err(HandshakeError::Protocol {
                    operation: "loginReg",
                    status: status.to_string(),
                });
            }
        }
        if reply.idc.trim().is_empty() {
            return Err(GatewayError::Malformed("loginReg returned an empty idc".into()).into());
        }

        let ciphertext = STANDARD.decode(reply.ciphertext.trim()).map_err(|err| {
            GatewayError::Malformed(format!("loginReg ciphertext is not base64: {err}"))
        })?;
        let shared_secret = self.kem.decapsulate(&ciphertext, &key_pair.private_key)?;
        debug!(idc = %reply.idc, "decapsulated registration ciphertext");

        let session = SessionRecord {
            alias: self.config.alias.clone(),
            idc: reply.idc,
            shared_secret: shared_secret.to_vec(),
            key_pair,
        };
        self.store.save(&session)?;
        Ok((session, reply.challenge))
    }

    async fn respond(&self, session: &SessionRecord, challenge: &str) -> Result<u64> {
        debug!(
            difficulty = self.miner.difficulty(),
            challenge_len = challenge.len(),
            "mining proof-of-work"
        );
        let solution = self
            .miner
            .mine_offloaded(
                challenge.as_bytes().to_vec(),
                self.config.pow_timeout,
                &self.cancel,
            )
            .await?;

        let cipher = ChallengeCipher::from_shared_secret(&session.shared_secret)?;
        let crypted_hash = cipher.encrypt(&solution.hash)?.to_base64();

        let ack = self
            .remote(
                "challengeResp",
                self.gateway.challenge_resp(&session.idc, &crypted_hash),
            )
            .await?;
        if ack.status != STATUS_OK {
            return Err(HandshakeError::Protocol {
                operation: "challengeResp",
                status: ack.status,
            });
        }
        Ok(solution.nonce)
    }

    /// One remote call, bounded by the call timeout and the cancel token.
    async fn remote<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, GatewayError>>,
    {
        let started = Instant::now();
        debug!(operation, "remote call");
        let bounded = tokio::select! {
            _ = self.cancel.cancelled() => return Err(HandshakeError::Cancelled),
            bounded = tokio::time::timeout(self.config.call_timeout, call) => bounded,
        };
        let reply = bounded.map_err(|_| GatewayError::Timeout(self.config.call_timeout))??;
        debug!(
            operation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote call completed"
        );
        Ok(reply)
    }

    fn check_cancelled(&self, stage: Stage) -> std::result::Result<(), HandshakeFailure> {
        if self.cancel.is_cancelled() {
            return Err(HandshakeFailure::new(stage, HandshakeError::Cancelled));
        }
        Ok(())
    }

    fn enter(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "handshake transition");
        self.state = next;
    }
}
