//! Runtime configuration.
//!
//! Every section has sensible defaults; a JSON document only needs to name the values it
//! overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::{OffloadError, Result};

/// Request/response settings shared by every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Window a request may stay unanswered before it fails with a timeout
    pub default_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

impl RpcConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Execution context settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// How long a collaborator may take to initialize
    pub init_timeout_ms: u64,
    /// Handles created per operation family by the context registry
    pub contexts_per_family: usize,
    /// Prefix of context thread names
    pub thread_name_prefix: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 10_000,
            contexts_per_family: num_cpus::get(),
            thread_name_prefix: "offload".to_string(),
        }
    }
}

impl ContextConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_contexts_per_family(mut self, count: usize) -> Self {
        self.contexts_per_family = count;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub rpc: RpcConfig,
    pub context: ContextConfig,
    pub batch: BatchConfig,
}

impl OffloadConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: OffloadConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc.default_timeout_ms == 0 {
            return Err(OffloadError::Config(
                "rpc.default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.context.init_timeout_ms == 0 {
            return Err(OffloadError::Config(
                "context.init_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.context.contexts_per_family == 0 {
            return Err(OffloadError::Config(
                "context.contexts_per_family must be at least 1".to_string(),
            ));
        }
        if self.batch.concurrency == 0 {
            return Err(OffloadError::Config(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
