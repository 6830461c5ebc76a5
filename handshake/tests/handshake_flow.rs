use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto::ml_kem::MlKemPublicKey;
use crypto::traits::KemPublicKey;
use crypto::{ChallengeCipher, EncryptedEnvelope};
use lepago_handshake::{
    ChallengeAck, ErrorKind, Gateway, GatewayError, HandshakeConfig, HandshakeError,
    HandshakeOrchestrator, HandshakeState, LoginChallenge, ProofOfWorkMiner, Registration,
    SessionPath, SessionPresence, SessionStore, Stage,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    LoginReq { alias: String, idc: String },
    LoginReg { alias: String },
    ChallengeResp { idc: String },
}

#[derive(Default)]
struct ServiceState {
    secrets: HashMap<String, Vec<u8>>,
    challenges: HashMap<String, String>,
    issued: u32,
    calls: Vec<Call>,
    challenge_status: Option<String>,
    login_status: Option<String>,
    registration_status: Option<String>,
    registration_fault: Option<String>,
    bogus_ciphertext: bool,
}

/// In-memory stand-in for the login service: encapsulates to registered
/// keys and checks challenge responses the way the real service would.
struct LoopbackService {
    difficulty: u32,
    state: Mutex<ServiceState>,
}

impl LoopbackService {
    fn new(difficulty: u32) -> Arc<Self> {
        Arc::new(Self {
            difficulty,
            state: Mutex::new(ServiceState::default()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ServiceState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn issue_challenge(state: &mut ServiceState, idc: &str) -> String {
        state.issued += 1;
        let challenge = format!("challenge-{}-{idc}", state.issued);
        state.challenges.insert(idc.to_string(), challenge.clone());
        challenge
    }
}

#[async_trait]
impl Gateway for LoopbackService {
    async fn login_req(
        &self,
        login_name: &str,
        idc: &str,
    ) -> Result<LoginChallenge, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::LoginReq {
            alias: login_name.into(),
            idc: idc.into(),
        });
        if let Some(status) = state.login_status.clone() {
            return Ok(LoginChallenge {
                status,
                challenge: String::new(),
            });
        }
        if !state.secrets.contains_key(idc) {
            return Err(GatewayError::Fault {
                fault_string: format!("unknown idc {idc}"),
            });
        }
        let challenge = Self::issue_challenge(&mut state, idc);
        Ok(LoginChallenge {
            status: "OK".into(),
            challenge,
        })
    }

    async fn login_reg(
        &self,
        login_name: &str,
        public_key: &str,
    ) -> Result<Registration, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::LoginReg {
            alias: login_name.into(),
        });
        if let Some(fault_string) = state.registration_fault.clone() {
            return Err(GatewayError::Fault { fault_string });
        }
        if let Some(status) = state.registration_status.clone() {
            return Ok(Registration {
                status: Some(status),
                idc: String::new(),
                ciphertext: String::new(),
                challenge: String::new(),
            });
        }
        let pk_bytes = STANDARD
            .decode(public_key)
            .map_err(|err| GatewayError::Malformed(err.to_string()))?;
        let pk = MlKemPublicKey::from_bytes(&pk_bytes)
            .map_err(|err| GatewayError::Malformed(err.to_string()))?;
        let (ct, ss) = pk
            .encapsulate(&mut rand::thread_rng())
            .map_err(|err| GatewayError::Malformed(err.to_string()))?;

        let idc = format!("idc-{login_name}-{}", state.secrets.len() + 1);
        state.secrets.insert(idc.clone(), ss.as_bytes().to_vec());
        let challenge = Self::issue_challenge(&mut state, &idc);
        let ciphertext = if state.bogus_ciphertext {
            STANDARD.encode([0u8; 1088])
        } else {
            STANDARD.encode(ct.as_bytes())
        };
        Ok(Registration {
            status: None,
            idc,
            ciphertext,
            challenge,
        })
    }

    async fn challenge_resp(
        &self,
        idc: &str,
        crypted_hash: &str,
    ) -> Result<ChallengeAck, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ChallengeResp { idc: idc.into() });
        if let Some(status) = state.challenge_status.clone() {
            return Ok(ChallengeAck { status });
        }
        let (Some(secret), Some(challenge)) = (state.secrets.get(idc), state.challenges.get(idc))
        else {
            return Ok(ChallengeAck {
                status: "UNKNOWN_IDC".into(),
            });
        };
        let envelope = EncryptedEnvelope::from_base64(crypted_hash)
            .map_err(|err| GatewayError::Malformed(err.to_string()))?;
        let digest = match ChallengeCipher::from_shared_secret(secret)
            .and_then(|cipher| cipher.decrypt(&envelope))
        {
            Ok(digest) => digest,
            Err(_) => {
                return Ok(ChallengeAck {
                    status: "BAD_TAG".into(),
                })
            }
        };
        let expected = ProofOfWorkMiner::new(self.difficulty)
            .mine(challenge.as_bytes(), &CancellationToken::new())
            .map_err(|err| GatewayError::Malformed(err.to_string()))?;
        let status = if digest == expected.hash { "OK" } else { "BAD_POW" };
        Ok(ChallengeAck {
            status: status.into(),
        })
    }
}

/// Never answers.
struct Stalled;

#[async_trait]
impl Gateway for Stalled {
    async fn login_req(&self, _: &str, _: &str) -> Result<LoginChallenge, GatewayError> {
        std::future::pending().await
    }

    async fn login_reg(&self, _: &str, _: &str) -> Result<Registration, GatewayError> {
        std::future::pending().await
    }

    async fn challenge_resp(&self, _: &str, _: &str) -> Result<ChallengeAck, GatewayError> {
        std::future::pending().await
    }
}

fn config(dir: &Path) -> HandshakeConfig {
    HandshakeConfig::builder()
        .service_description("http://gateway.test/lepago?wsdl")
        .endpoint("http://gateway.test/lepago")
        .alias("cosapi")
        .state_dir(dir)
        .call_timeout(Duration::from_secs(5))
        .build()
        .expect("config")
}

fn orchestrator(config: HandshakeConfig, gateway: Arc<dyn Gateway>) -> HandshakeOrchestrator {
    let store = SessionStore::open(&config.state_dir).expect("store");
    HandshakeOrchestrator::new(config, gateway, store)
}

#[tokio::test]
async fn fresh_state_registers_and_persists() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    let mut handshake = orchestrator(config(dir.path()), service.clone());
    assert!(!handshake.store().exists());

    let done = handshake.run().await.expect("authenticated");
    assert_eq!(done.path, SessionPath::Registered);
    assert_eq!(done.alias.as_str(), "cosapi");
    assert_eq!(handshake.state(), HandshakeState::Authenticated);
    assert!(handshake.store().exists());
    assert_eq!(handshake.store().load().unwrap().idc, done.idc);

    assert_eq!(
        service.calls(),
        vec![
            Call::LoginReg {
                alias: "cosapi".into()
            },
            Call::ChallengeResp {
                idc: done.idc.clone()
            },
        ]
    );
}

#[tokio::test]
async fn reanimation_reuses_keys_and_idc() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    let registered = {
        let mut handshake = orchestrator(config(dir.path()), service.clone());
        handshake.run().await.expect("register")
    };
    let public_key = {
        let store = SessionStore::open(dir.path()).unwrap();
        store.load().unwrap().key_pair.public_key
    };

    for _ in 0..2 {
        let mut handshake = orchestrator(config(dir.path()), service.clone());
        let done = handshake.run().await.expect("reanimate");
        assert_eq!(done.path, SessionPath::Reanimated);
        assert_eq!(done.idc, registered.idc);
        let persisted = handshake.store().load().unwrap();
        assert_eq!(persisted.key_pair.public_key, public_key);
    }

    let calls = service.calls();
    let registrations = calls
        .iter()
        .filter(|c| matches!(c, Call::LoginReg { .. }))
        .count();
    assert_eq!(registrations, 1);
    let logins: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Call::LoginReq { idc, .. } => Some(idc.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(logins, vec![registered.idc.clone(), registered.idc]);
}

#[tokio::test]
async fn persisted_alias_wins_over_configuration() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    orchestrator(config(dir.path()), service.clone())
        .run()
        .await
        .expect("register");

    let mut renamed = config(dir.path());
    renamed.alias = lepago_handshake::Identity::new("someone-else");
    let done = orchestrator(renamed, service.clone())
        .run()
        .await
        .expect("reanimate");
    assert_eq!(done.alias.as_str(), "cosapi");
    assert!(service.calls().contains(&Call::LoginReq {
        alias: "cosapi".into(),
        idc: done.idc
    }));
}

#[tokio::test]
async fn rejected_challenge_keeps_the_registration() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    service.with(|s| s.challenge_status = Some("FAILED".into()));

    let mut handshake = orchestrator(config(dir.path()), service.clone());
    let failure = handshake.run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::RespondToChallenge);
    assert_eq!(failure.kind(), ErrorKind::Protocol);
    assert_eq!(handshake.state(), HandshakeState::Failed);
    assert!(handshake.store().exists());
    drop(handshake);

    service.with(|s| s.challenge_status = None);
    let done = orchestrator(config(dir.path()), service.clone())
        .run()
        .await
        .expect("retry without re-registering");
    assert_eq!(done.path, SessionPath::Reanimated);
}

#[tokio::test]
async fn partial_legacy_state_is_corrupted_not_absent() {
    let dir = tempdir().unwrap();
    for name in ["idc.txt", "publicKey.txt", "privateKey.txt", "decryptedSharedSecret.txt"] {
        fs::write(dir.path().join(name), "AAAA").unwrap();
    }
    let service = LoopbackService::new(4);
    let mut handshake = orchestrator(config(dir.path()), service.clone());
    assert!(matches!(
        handshake.store().probe(),
        SessionPresence::Corrupted(_)
    ));

    let failure = handshake.run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::CheckSession);
    assert!(failure.error.is_corrupted_state());
    assert!(service.calls().is_empty());
    assert!(dir.path().join("privateKey.txt").exists());
}

#[tokio::test]
async fn registration_fault_text_is_surfaced() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    service.with(|s| s.registration_fault = Some("alias already registered".into()));

    let mut handshake = orchestrator(config(dir.path()), service.clone());
    let failure = handshake.run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::Register);
    assert_eq!(failure.kind(), ErrorKind::Transport);
    assert!(failure.to_string().contains("alias already registered"));
    assert!(!handshake.store().exists());
}

#[tokio::test]
async fn non_ok_registration_persists_nothing() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    service.with(|s| s.registration_status = Some("DENIED".into()));

    let mut handshake = orchestrator(config(dir.path()), service.clone());
    let failure = handshake.run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::Register);
    assert!(matches!(
        failure.error,
        HandshakeError::Protocol {
            operation: "loginReg",
            ..
        }
    ));
    assert_eq!(handshake.store().probe(), SessionPresence::Absent);
}

#[tokio::test]
async fn wrong_size_ciphertext_fails_decapsulation() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    service.with(|s| s.bogus_ciphertext = true);

    let mut handshake = orchestrator(config(dir.path()), service.clone());
    let failure = handshake.run().await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Crypto);
    assert_eq!(
        failure.to_string(),
        "registration: crypto error: decapsulation failed"
    );
    assert!(!handshake.store().exists());
}

#[tokio::test]
async fn non_ok_login_fails_reanimation() {
    let dir = tempdir().unwrap();
    let service = LoopbackService::new(4);
    orchestrator(config(dir.path()), service.clone())
        .run()
        .await
        .expect("register");

    service.with(|s| s.login_status = Some("LOCKED".into()));
    let failure = orchestrator(config(dir.path()), service.clone())
        .run()
        .await
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Reanimate);
    assert_eq!(failure.kind(), ErrorKind::Protocol);
    assert!(failure.to_string().contains("LOCKED"));
}

#[tokio::test]
async fn missing_gateway_location_fails_before_any_call() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.service_description = String::new();
    let service = LoopbackService::new(4);

    let failure = orchestrator(cfg, service.clone())
        .run()
        .await
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Init);
    assert_eq!(failure.kind(), ErrorKind::Configuration);
    assert!(service.calls().is_empty());
}

#[tokio::test]
async fn stalled_call_times_out_as_transport_error() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.call_timeout = Duration::from_millis(100);

    let failure = orchestrator(cfg, Arc::new(Stalled))
        .run()
        .await
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Register);
    assert_eq!(failure.kind(), ErrorKind::Transport);
    assert!(matches!(
        failure.error,
        HandshakeError::Gateway(GatewayError::Timeout(_))
    ));
}

#[tokio::test]
async fn cancellation_interrupts_a_pending_call() {
    let dir = tempdir().unwrap();
    let cancel = CancellationToken::new();
    let mut handshake =
        orchestrator(config(dir.path()), Arc::new(Stalled)).with_cancellation(cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let failure = handshake.run().await.unwrap_err();
    trigger.await.unwrap();
    assert_eq!(failure.kind(), ErrorKind::Cancelled);
    assert!(!handshake.store().exists());
}

#[tokio::test]
async fn mining_cap_is_a_proof_of_work_timeout() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.difficulty = 64;
    cfg.pow_max_iterations = Some(10_000);
    let service = LoopbackService::new(64);

    let mut handshake = orchestrator(cfg, service.clone());
    let failure = handshake.run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::RespondToChallenge);
    assert_eq!(failure.kind(), ErrorKind::ProofOfWorkTimeout);
    assert!(handshake.store().exists());
    assert!(!service
        .calls()
        .iter()
        .any(|c| matches!(c, Call::ChallengeResp { .. })));
}
