//! TOML configuration surface.
//!
//! Everything is optional: a missing or empty file yields the defaults, and
//! [`crate::build`] warns about (and substitutes) any unset field it needs.

use crate::scheduler::PollPolicy;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest config file we will read.
const MAX_FILE_SIZE: u64 = 1_048_576;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config file too large ({size} bytes, max {max})")]
    TooLarge { size: u64, max: u64 },
}

/// Subscriber configuration.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Externally reachable authority for callback URLs, e.g.
    /// `http://push.example.com`.
    pub host: Option<String>,
    /// Path prefix the listener is mounted under, starting with `/`.
    pub prefix: Option<String>,
    /// Shared secret for the default path/token codecs. Must be identical
    /// across a load-balanced deployment.
    pub secret: Option<SecretString>,
    pub poll: PollSettings,
}

// Manual Debug so the secret never reaches logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("prefix", &self.prefix)
            .field(
                "secret",
                &self.secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("poll", &self.poll)
            .finish()
    }
}

/// Defaults for the polling scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub base_interval_secs: u64,
    pub backoff_multiplier: u32,
    pub backoff_limit: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            base_interval_secs: 600,
            backoff_multiplier: 2,
            backoff_limit: 8,
        }
    }
}

impl PollSettings {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            base_interval: Duration::from_secs(self.base_interval_secs),
            backoff_multiplier: self.backoff_multiplier,
            backoff_limit: self.backoff_limit,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error; it yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() > MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                size: metadata.len(),
                max: MAX_FILE_SIZE,
            });
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            // Deleted between the metadata check and the read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Config::default());
        }

        warn_unknown_keys(&raw);
        Ok(toml::from_str(&raw)?)
    }
}

fn warn_unknown_keys(raw: &str) {
    let known = ["host", "prefix", "secret", "poll"];
    let Ok(value) = raw.parse::<toml::Table>() else {
        return;
    };
    for key in value.keys() {
        if !known.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown config key ignored");
        }
    }
}
