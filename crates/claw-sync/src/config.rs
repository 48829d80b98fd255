//! Sync client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::poll::PollPolicy;

/// Serde adapter storing a [`Duration`] as whole seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Configuration for the sync engine and its HTTP backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backend base URL (scheme and authority).
    pub host: String,
    /// Poll interval tiers.
    pub poll: PollPolicy,
    /// How often the whole cache is reloaded regardless of deltas.
    #[serde(with = "secs")]
    pub full_sync_interval: Duration,
    /// Directory for the persisted error log. `None` keeps it in memory.
    pub error_log_dir: Option<PathBuf>,
    /// Oldest error-log entries are dropped beyond this many.
    pub max_error_entries: usize,
    /// Accept self-signed TLS certificates.
    pub accept_invalid_certs: bool,
    /// Basic-auth user name.
    pub username: Option<String>,
    /// Basic-auth password.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host: "https://localhost".to_string(),
            poll: PollPolicy::default(),
            full_sync_interval: Duration::from_secs(180),
            error_log_dir: None,
            max_error_entries: 500,
            accept_invalid_certs: false,
            username: None,
            password: None,
        }
    }
}

impl SyncConfig {
    /// Create a configuration for the given backend host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(content: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| SyncError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the engine misbehave.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.host.starts_with("http://") && !self.host.starts_with("https://") {
            return Err(SyncError::Config(format!(
                "host {} must start with http:// or https://",
                self.host
            )));
        }
        if self.poll.default_rate.is_zero()
            || self.poll.reduced_rate.is_zero()
            || self.poll.further_reduced_rate.is_zero()
        {
            return Err(SyncError::Config("poll rates must be greater than 0".to_string()));
        }
        if self.full_sync_interval.is_zero() {
            return Err(SyncError::Config(
                "full_sync_interval must be greater than 0".to_string(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(SyncError::Config("password given without username".to_string()));
        }
        Ok(())
    }

    /// Set the poll policy.
    #[must_use]
    pub const fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Set the full resync interval.
    #[must_use]
    pub const fn with_full_sync_interval(mut self, interval: Duration) -> Self {
        self.full_sync_interval = interval;
        self
    }

    /// Persist the error log under `dir`.
    #[must_use]
    pub fn with_error_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.error_log_dir = Some(dir.into());
        self
    }

    /// Accept self-signed certificates.
    #[must_use]
    pub const fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Use HTTP basic auth.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}
