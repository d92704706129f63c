//! Configuration for a single xic connection.

use eyre::{ensure, WrapErr as _};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use tracing::debug;

/// Max message body size in bytes.
///
/// Applies to Quest, Answer, and Check bodies. The 8-byte header does not count towards this
/// value.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// The configuration for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Deadline for a twoway call, measured from the moment the call is issued.
    ///
    /// `None` means callers wait until the answer arrives or the connection closes.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Maximum time the read loop waits for the next message header.
    ///
    /// Expiry is treated as a fatal condition and the connection is force-closed.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Number of incoming quests that may be dispatched in parallel.
    ///
    /// With a value of 0 or 1, quests run in arrival order on the read loop itself. A slow
    /// servant then stalls every later message on the connection, answers included.
    pub concurrency: usize,
    /// The maximum body size (bytes) accepted or produced for a single message.
    pub max_message_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            idle_timeout: None,
            concurrency: 1,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Set the twoway call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the read loop idle deadline.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Set the number of quests dispatched in parallel.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the maximum message body size.
    pub fn with_max_message_size(mut self, max_message_size: u32) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Whether incoming quests are dispatched on their own tasks.
    pub fn is_concurrent(&self) -> bool {
        self.concurrency > 1
    }

    /// Check values that would make a connection unusable.
    pub fn validate(&self) -> eyre::Result<()> {
        ensure!(self.max_message_size > 0, "max_message_size must be greater than 0");
        ensure!(
            self.max_message_size <= DEFAULT_MAX_MESSAGE_SIZE,
            "max_message_size {} exceeds protocol limit {}",
            self.max_message_size,
            DEFAULT_MAX_MESSAGE_SIZE
        );
        if let Some(timeout) = self.timeout {
            ensure!(!timeout.is_zero(), "timeout must be non-zero when set");
        }
        if let Some(idle) = self.idle_timeout {
            ensure!(!idle.is_zero(), "idle_timeout must be non-zero when set");
        }
        Ok(())
    }

    /// Load and validate a YAML config file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let path = path.as_ref();
        debug!(target: "xic::config", ?path, "loading connection config");

        let contents = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Write this config to a YAML file.
    pub fn store_path<P: AsRef<Path>>(&self, path: P) -> eyre::Result<()> {
        let path = path.as_ref();
        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents)
            .wrap_err_with(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}
