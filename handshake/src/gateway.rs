//! Remote gateway operations consumed by the handshake

use async_trait::async_trait;

use crate::error::GatewayError;

/// Reply to `loginReq`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginChallenge {
    pub status: String,
    pub challenge: String,
}

/// Reply to `loginReg`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    /// Not every deployment sends a status on registration
    pub status: Option<String>,
    pub idc: String,
    /// Base64 ML-KEM ciphertext encapsulated to the registered public key
    pub ciphertext: String,
    pub challenge: String,
}

/// Reply to `challengeResp`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeAck {
    pub status: String,
}

/// The three operations the login service exposes.
///
/// Implementations report faults with the server's own fault text. Bounding
/// and cancelling calls is the caller's job; implementations may add their
/// own transport-level timeouts on top.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn login_req(&self, login_name: &str, idc: &str)
        -> Result<LoginChallenge, GatewayError>;

    async fn login_reg(
        &self,
        login_name: &str,
        public_key: &str,
    ) -> Result<Registration, GatewayError>;

    async fn challenge_resp(
        &self,
        idc: &str,
        crypted_hash: &str,
    ) -> Result<ChallengeAck, GatewayError>;
}
