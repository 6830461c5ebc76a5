//! Configuration for the login handshake

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{HandshakeError, Result};
use crate::pow::{DEFAULT_DIFFICULTY, MAX_DIFFICULTY};
use crate::types::Identity;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POW_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_POW_MAX_ITERATIONS: u64 = 100_000_000;

/// Everything the orchestrator needs, built once and passed in
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Location of the WSDL service description (URL or file path)
    pub service_description: String,

    /// Endpoint the SOAP calls are posted to
    pub endpoint: String,

    /// Alias used when registering
    pub alias: Identity,

    /// Directory holding the persisted session
    pub state_dir: PathBuf,

    /// Required leading zero hex nibbles of the proof-of-work digest
    pub difficulty: u32,

    /// Upper bound on nonces tried before giving up
    pub pow_max_iterations: Option<u64>,

    /// Wall-clock bound on mining
    pub pow_timeout: Option<Duration>,

    /// Bound on each remote call
    pub call_timeout: Duration,
}

impl HandshakeConfig {
    pub fn builder() -> HandshakeConfigBuilder {
        HandshakeConfigBuilder::new()
    }

    /// Fail fast before any network activity.
    pub fn validate(&self) -> Result<()> {
        if self.service_description.trim().is_empty() {
            return Err(HandshakeError::config(
                "gateway service description location is not set",
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(HandshakeError::config("gateway endpoint is not set"));
        }
        let endpoint = Url::parse(self.endpoint.trim())
            .map_err(|err| HandshakeError::config(format!("invalid endpoint URL: {err}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(HandshakeError::config(format!(
                "endpoint must be http or https, got {}",
                endpoint.scheme()
            )));
        }
        if self.alias.as_str().trim().is_empty() {
            return Err(HandshakeError::config("alias is not set"));
        }
        if self.difficulty > MAX_DIFFICULTY {
            return Err(HandshakeError::config(format!(
                "difficulty {} exceeds the {MAX_DIFFICULTY} nibbles of a SHA-256 digest",
                self.difficulty
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(HandshakeError::config("call timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for HandshakeConfig
pub struct HandshakeConfigBuilder {
    service_description: Option<String>,
    endpoint: Option<String>,
    alias: Option<Identity>,
    state_dir: PathBuf,
    difficulty: u32,
    pow_max_iterations: Option<u64>,
    pow_timeout: Option<Duration>,
    call_timeout: Duration,
}

impl Default for HandshakeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeConfigBuilder {
    pub fn new() -> Self {
        Self {
            service_description: None,
            endpoint: None,
            alias: None,
            state_dir: PathBuf::from("."),
            difficulty: DEFAULT_DIFFICULTY,
            pow_max_iterations: Some(DEFAULT_POW_MAX_ITERATIONS),
            pow_timeout: Some(DEFAULT_POW_TIMEOUT),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn service_description(mut self, location: impl Into<String>) -> Self {
        self.service_description = Some(location.into());
        self
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(Identity::new(alias));
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// `None` removes the iteration cap; the wall-clock bound still applies.
    pub fn pow_max_iterations(mut self, cap: Option<u64>) -> Self {
        self.pow_max_iterations = cap;
        self
    }

    pub fn pow_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pow_timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<HandshakeConfig> {
        let config = HandshakeConfig {
            service_description: self.service_description.unwrap_or_default(),
            endpoint: self.endpoint.unwrap_or_default(),
            alias: self.alias.unwrap_or_else(|| Identity::new("")),
            state_dir: self.state_dir,
            difficulty: self.difficulty,
            pow_max_iterations: self.pow_max_iterations,
            pow_timeout: self.pow_timeout,
            call_timeout: self.call_timeout,
        };
        config.validate()?;
        Ok(config)
    }
}
