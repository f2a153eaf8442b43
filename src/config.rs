//! Bridge configuration
//!
//! Both sides of the protocol derive the names of the shared region and the
//! four semaphores from a single instance prefix, so a server and its client
//! only need to agree on that one string. Serde support lets deployments
//! keep the configuration in a JSON file next to the worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Default instance prefix; yields the same object names across restarts.
pub const DEFAULT_PREFIX: &str = "llamabridge";

/// Default cap on generated tokens per request. Zero means unlimited.
pub const DEFAULT_MAX_TOKENS: usize = 4096;

/// Configuration shared by server and client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Instance prefix for all named objects. Two bridge instances with
    /// different prefixes can coexist on one machine.
    pub prefix: String,
    /// Per-request generation cap; 0 disables the cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Bound on every protocol wait. `None` (the default) blocks forever,
    /// faithful to the single-trusted-peer design; set it to surface a
    /// dead peer as an error instead of hanging.
    #[serde(default)]
    pub wait_timeout: Option<Duration>,
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            wait_timeout: None,
        }
    }
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, BridgeError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| BridgeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    /// Write the configuration to a JSON file.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<(), BridgeError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    // POSIX object names must start with '/' and contain no other slash.

    pub fn shm_name(&self) -> String {
        format!("/{}_shm", self.prefix)
    }

    pub fn sem_ready_name(&self) -> String {
        format!("/{}_sem_ready", self.prefix)
    }

    pub fn sem_prompt_written_name(&self) -> String {
        format!("/{}_sem_prompt_written", self.prefix)
    }

    pub fn sem_response_written_name(&self) -> String {
        format!("/{}_sem_response_written", self.prefix)
    }

    pub fn sem_chunk_ready_name(&self) -> String {
        format!("/{}_sem_chunk_ready", self.prefix)
    }
}

/// Builder for [`BridgeConfig`].
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

impl Default for BridgeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
