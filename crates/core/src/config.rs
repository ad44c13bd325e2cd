//! Engine configuration
//!
//! Loaded from `config.toml` in the platform config directory, or built in
//! code. Every field has a default so partial files are fine:
//!
//! ```toml
//! request_timeout_ms = 10000
//! chat_chunk_size = 4096
//!
//! [pool]
//! audio = 2
//! video = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::chunk::{DEFAULT_ATTACHMENT_CHUNK_SIZE, DEFAULT_CHAT_CHUNK_SIZE};
use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.toml";

/// Receive-only transceivers created up front at join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub audio: usize,
    pub video: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { audio: 1, video: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Handshake deadline for `connect`
    pub connect_timeout_ms: u64,
    /// Deadline for a correlated reply; 0 waits forever
    pub request_timeout_ms: u64,
    /// Deadline for each media engine step inside negotiation; 0 waits forever
    pub negotiation_timeout_ms: u64,
    pub chat_chunk_size: usize,
    pub attachment_chunk_size: usize,
    /// Pause between consecutive chunks of one payload
    pub chunk_pacing_ms: u64,
    /// Unfinished inbound chat messages kept per room
    pub max_pending_chat_groups: usize,
    pub pool: PoolConfig,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            negotiation_timeout_ms: 15_000,
            chat_chunk_size: DEFAULT_CHAT_CHUNK_SIZE,
            attachment_chunk_size: DEFAULT_ATTACHMENT_CHUNK_SIZE,
            chunk_pacing_ms: 0,
            max_pending_chat_groups: 64,
            pool: PoolConfig::default(),
            event_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Parse from TOML content
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        tracing::info!(path = %path.display(), "Loading engine config");
        Self::load(&path)
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "convene", "convene").ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            ))
        })?;
        Ok(dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        if self.chat_chunk_size == 0 {
            return Err(Error::Config("chat_chunk_size must be positive".into()));
        }
        if self.attachment_chunk_size == 0 {
            return Err(Error::Config("attachment_chunk_size must be positive".into()));
        }
        if self.max_pending_chat_groups == 0 {
            return Err(Error::Config("max_pending_chat_groups must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config("event_channel_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero(self.request_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        non_zero(self.negotiation_timeout_ms)
    }

    pub fn chunk_pacing(&self) -> Option<Duration> {
        non_zero(self.chunk_pacing_ms)
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    pub fn with_pool(mut self, audio: usize, video: usize) -> Self {
        self.pool = PoolConfig { audio, video };
        self
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
