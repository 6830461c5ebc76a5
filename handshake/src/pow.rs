//! Proof-of-work over server-issued challenges
//!
//! A solution is the smallest nonce `n` such that
//! `SHA-256(challenge || decimal(n))` starts with `difficulty` zero hex
//! digits. The search walks nonces upward from zero, so the first hit is
//! also the minimal one. The digest itself (32 raw bytes) is what gets
//! encrypted and sent back.
//!
//! Mining is CPU-bound; [`ProofOfWorkMiner::mine_offloaded`] moves it onto
//! the blocking pool so the runtime stays free to service I/O, and both
//! variants poll a [`CancellationToken`] between batches of nonces.

use std::time::{Duration, Instant};

use crypto::hashes::leading_zero_nibbles;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{HandshakeError, PowLimit, Result};
use crate::types::ProofOfWorkSolution;

/// Leading zero hex digits required by the service
pub const DEFAULT_DIFFICULTY: u32 = 4;

/// A SHA-256 digest has 64 hex digits
pub const MAX_DIFFICULTY: u32 = 64;

/// Nonces hashed between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofOfWorkMiner {
    difficulty: u32,
    max_iterations: Option<u64>,
}

impl ProofOfWorkMiner {
    /// Difficulties above [`MAX_DIFFICULTY`] are clamped to it: no digest can
    /// have more leading zero nibbles than that. Configuration built through
    /// [`HandshakeConfig`](crate::HandshakeConfig) rejects such values instead.
    pub fn new(difficulty: u32) -> Self {
        Self {
            difficulty: difficulty.min(MAX_DIFFICULTY),
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, cap: Option<u64>) -> Self {
        self.max_iterations = cap;
        self
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Digest for a single candidate nonce.
    pub fn digest(challenge: &[u8], nonce: u64) -> [u8; 32] {
        let mut buf = [0u8; 20];
        let mut hasher = Sha256::new();
        hasher.update(challenge);
        hasher.update(decimal(nonce, &mut buf));
        hasher.finalize().into()
    }

    /// Check a solution without searching.
    pub fn verify(&self, challenge: &[u8], solution: &ProofOfWorkSolution) -> bool {
        let digest = Self::digest(challenge, solution.nonce);
        digest == solution.hash && leading_zero_nibbles(&digest) >= self.difficulty
    }

    /// Search synchronously on the calling thread.
    pub fn mine(
        &self,
        challenge: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ProofOfWorkSolution> {
        let started = Instant::now();
        let prefix = Sha256::new_with_prefix(challenge);
        let mut buf = [0u8; 20];
        let mut nonce: u64 = 0;
        loop {
            if let Some(cap) = self.max_iterations {
                if nonce >= cap {
                    debug!(cap, "proof-of-work iteration cap reached");
                    return Err(HandshakeError::ProofOfWorkTimeout(PowLimit::Iterations(
                        cap,
                    )));
                }
            }
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(HandshakeError::Cancelled);
            }

            let mut hasher = prefix.clone();
            hasher.update(decimal(nonce, &mut buf));
            let hash: [u8; 32] = hasher.finalize().into();
            if leading_zero_nibbles(&hash) >= self.difficulty {
                let elapsed = started.elapsed();
                info!(
                    nonce,
                    difficulty = self.difficulty,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "proof-of-work solved"
                );
                return Ok(ProofOfWorkSolution { nonce, hash });
            }

            nonce = match nonce.checked_add(1) {
                Some(next) => next,
                None => {
                    return Err(HandshakeError::ProofOfWorkTimeout(PowLimit::Iterations(
                        u64::MAX,
                    )))
                }
            };
        }
    }

    /// Search on the blocking pool, bounded by `timeout` and `cancel`.
    ///
    /// On timeout the worker is told to stop through a child token, so the
    /// thread winds down within one cancellation interval.
    pub async fn mine_offloaded(
        &self,
        challenge: Vec<u8>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ProofOfWorkSolution> {
        let worker_cancel = cancel.child_token();
        let miner = *self;
        let token = worker_cancel.clone();
        let handle = tokio::task::spawn_blocking(move || miner.mine(&challenge, &token));

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    worker_cancel.cancel();
                    debug!(?limit, "proof-of-work timed out");
                    return Err(HandshakeError::ProofOfWorkTimeout(PowLimit::Elapsed(limit)));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(HandshakeError::Cancelled),
        }
    }
}

impl Default for ProofOfWorkMiner {
    fn default() -> Self {
        Self::new(DEFAULT_DIFFICULTY)
    }
}

/// ASCII decimal rendering of `n` without allocating.
fn decimal(mut n: u64, buf: &mut [u8; 20]) -> &[u8] {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[pos..]
}
