use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::SyncError;

/// Resubscribe backoff tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter (0.0 disables).
    pub jitter_ratio: f64,
    /// Consecutive failures before the subscription reports `failed`.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            max_delay_ms: DEFAULT_BACKOFF_MAX_MS,
            jitter_ratio: DEFAULT_BACKOFF_JITTER_RATIO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceConfig {
    pub online_window_secs: u64,
    pub away_window_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_window_secs: DEFAULT_ONLINE_WINDOW_SECS,
            away_window_secs: DEFAULT_AWAY_WINDOW_SECS,
        }
    }
}

impl PresenceConfig {
    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_secs)
    }

    pub fn away_window(&self) -> Duration {
        Duration::from_secs(self.away_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowConfig {
    /// Maximum number of maximized windows; overflow is minimized.
    pub max_open_windows: usize,
    /// Maximum number of minimized windows; overflow is closed.
    pub max_minimized_windows: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_open_windows: DEFAULT_MAX_OPEN_WINDOWS,
            max_minimized_windows: DEFAULT_MAX_MINIMIZED_WINDOWS,
        }
    }
}

/// Complete runtime configuration. Every field has a default so partial JSON
/// files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub backoff: BackoffConfig,
    pub presence: PresenceConfig,
    pub windows: WindowConfig,
    pub attach_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub history_limit: usize,
    pub event_queue_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            presence: PresenceConfig::default(),
            windows: WindowConfig::default(),
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl CoreConfig {
    /// `<config dir>/chatsync.json`, or `None` when the platform has no config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }

    /// Load and validate a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SyncError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CoreConfig =
            serde_json::from_str(&raw).map_err(|source| SyncError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.backoff.base_delay_ms == 0 {
            return Err(SyncError::InvalidConfig("backoff.baseDelayMs must be > 0".into()));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(SyncError::InvalidConfig(
                "backoff.maxDelayMs must be >= backoff.baseDelayMs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_ratio) {
            return Err(SyncError::InvalidConfig(
                "backoff.jitterRatio must be within 0.0..=1.0".into(),
            ));
        }
        if self.windows.max_open_windows == 0 {
            return Err(SyncError::InvalidConfig("windows.maxOpenWindows must be > 0".into()));
        }
        if self.windows.max_minimized_windows == 0 {
            return Err(SyncError::InvalidConfig(
                "windows.maxMinimizedWindows must be > 0".into(),
            ));
        }
        if self.presence.away_window_secs < self.presence.online_window_secs {
            return Err(SyncError::InvalidConfig(
                "presence.awayWindowSecs must be >= presence.onlineWindowSecs".into(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(SyncError::InvalidConfig("eventQueueCapacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chatsync.json");
        std::fs::write(&path, r#"{"windows": {"maxOpenWindows": 2}, "sendTimeoutMs": 5000}"#)
            .unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.windows.max_open_windows, 2);
        assert_eq!(config.windows.max_minimized_windows, DEFAULT_MAX_MINIMIZED_WINDOWS);
        assert_eq!(config.send_timeout_ms, 5000);
        assert_eq!(config.backoff, BackoffConfig::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = CoreConfig::load(&path).unwrap_err();
        assert_eq!(err.code(), "config_parse");
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_validate_rejects_inverted_presence_windows() {
        let mut config = CoreConfig::default();
        config.presence.online_window_secs = 600;
        config.presence.away_window_secs = 60;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_window_capacity() {
        let mut config = CoreConfig::default();
        config.windows.max_open_windows = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.windows.max_minimized_windows = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_config");
        assert!(err.to_string().contains("maxMinimizedWindows"));
    }
}
