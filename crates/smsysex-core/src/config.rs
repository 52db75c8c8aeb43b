//! Configuration for the smSysex engine.
//!
//! All tunables live in one nested [`EngineConfig`] that deserializes from
//! TOML with every field optional; anything absent falls back to the
//! defaults below. The embedded GUI is expected to load a config file once
//! and hand the parsed value to the engine.
//!
//! ## Example
//!
//! ```rust
//! use smsysex_core::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(
//!     r#"
//!     [transfer]
//!     max_concurrent = 2
//!     chunk_size = 256
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.transfer.max_concurrent, 2);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session negotiation and request correlation settings
    pub session: SessionConfig,
    /// Fragment reassembly bounds
    pub reassembly: ReassemblyConfig,
    /// File transfer settings
    pub transfer: TransferConfig,
    /// Backoff policy for retryable device errors
    pub retry: RetryPolicy,
}

/// Session and correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Client tag sent in the negotiation request
    pub tag: String,
    /// Negotiation reply window, in milliseconds
    pub negotiation_timeout_ms: u64,
    /// Per-request reply window, in milliseconds
    pub response_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tag: "rust".to_string(),
            negotiation_timeout_ms: 10_000,
            response_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// Negotiation reply window as a [`Duration`].
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Per-request reply window as a [`Duration`].
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Fragment reassembly bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Whether reassembly runs at all; disabled means every fragment is
    /// treated as a complete message (low-latency/debug passthrough)
    pub enabled: bool,
    /// Force-flush ceiling per message buffer, in bytes
    pub max_buffer_bytes: usize,
    /// Idle window after which a buffer is force-flushed, in milliseconds
    pub idle_flush_ms: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_buffer_bytes: 64 * 1024,
            idle_flush_ms: 40,
        }
    }
}

impl ReassemblyConfig {
    /// Idle flush window as a [`Duration`].
    #[must_use]
    pub const fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }
}

/// File transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum bytes per `write`/`read` block (device limit)
    pub chunk_size: usize,
    /// Transfer items processed concurrently per batch
    pub max_concurrent: usize,
    /// Pause between chunk sends, in milliseconds
    pub chunk_delay_ms: u64,
    /// Minimum interval between progress updates to observers, in
    /// milliseconds
    pub progress_interval_ms: u64,
    /// Directory entries requested per `dir` page
    pub dir_lines: u32,
    /// Attempts for a failing directory listing before the empty fallback
    pub dir_retries: u32,
    /// Pause between directory listing retries, in milliseconds
    pub dir_retry_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            max_concurrent: 3,
            chunk_delay_ms: 2,
            progress_interval_ms: 120,
            dir_lines: 64,
            dir_retries: 3,
            dir_retry_delay_ms: 250,
        }
    }
}

impl TransferConfig {
    /// Inter-chunk pause as a [`Duration`].
    #[must_use]
    pub const fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Progress throttle as a [`Duration`].
    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Directory retry pause as a [`Duration`].
    #[must_use]
    pub const fn dir_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dir_retry_delay_ms)
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serialize the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values the protocol cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(Error::Config("transfer.chunk_size must be > 0".to_string()));
        }
        if self.transfer.max_concurrent == 0 {
            return Err(Error::Config(
                "transfer.max_concurrent must be > 0".to_string(),
            ));
        }
        if self.transfer.dir_lines == 0 {
            return Err(Error::Config("transfer.dir_lines must be > 0".to_string()));
        }
        if self.reassembly.max_buffer_bytes == 0 {
            return Err(Error::Config(
                "reassembly.max_buffer_bytes must be > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be > 0".to_string()));
        }
        Ok(())
    }
}
