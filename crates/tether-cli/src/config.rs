//! Configuration system for the Tether CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::LinkConfig;

/// Tether configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Session, dispatch and rate-limit tunables
    #[serde(default)]
    pub link: LinkSection,
    /// Credential storage
    #[serde(default)]
    pub credentials: CredentialsSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[link]` table; durations in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSection {
    /// Per-operator dispatch cooldown
    #[serde(default = "default_cooldown_window_ms")]
    pub cooldown_window_ms: u64,
    /// Retryable closes tolerated before the session fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pairing-code wait bound
    #[serde(default = "default_pairing_timeout_ms")]
    pub pairing_timeout_ms: u64,
    /// Pairing-code lifetime
    #[serde(default = "default_pairing_code_validity_ms")]
    pub pairing_code_validity_ms: u64,
    /// Delay before a reconnect
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Rate-limit sweep period
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Rate-limit entry eviction age
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Attempts per job when a request does not say
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,
    /// Delay between attempts of one job
    #[serde(default = "default_attempt_delay_ms")]
    pub attempt_delay_ms: u64,
    /// Attempt cap per job
    #[serde(default = "default_max_attempts_per_job")]
    pub max_attempts_per_job: u32,
}

/// `[credentials]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsSection {
    /// Directory holding the credential files
    #[serde(default = "default_credentials_dir")]
    pub dir: PathBuf,
}

/// `[logging]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_cooldown_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_pairing_timeout_ms() -> u64 {
    15_000
}

fn default_pairing_code_validity_ms() -> u64 {
    120_000
}

fn default_reconnect_backoff_ms() -> u64 {
    3_000
}

fn default_sweep_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_stale_after_ms() -> u64 {
    60 * 60 * 1000
}

fn default_attempts() -> u32 {
    1
}

fn default_attempt_delay_ms() -> u64 {
    1_000
}

fn default_max_attempts_per_job() -> u32 {
    10
}

fn default_credentials_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tether/auth")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            cooldown_window_ms: default_cooldown_window_ms(),
            max_retries: default_max_retries(),
            pairing_timeout_ms: default_pairing_timeout_ms(),
            pairing_code_validity_ms: default_pairing_code_validity_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            default_attempts: default_attempts(),
            attempt_delay_ms: default_attempt_delay_ms(),
            max_attempts_per_job: default_max_attempts_per_job(),
        }
    }
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            dir: default_credentials_dir(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tether/config.toml")
    }

    /// Load `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Core configuration
    #[must_use]
    pub fn to_link_config(&self) -> LinkConfig {
        let link = &self.link;
        LinkConfig {
            cooldown_window: Duration::from_millis(link.cooldown_window_ms),
            max_retries: link.max_retries,
            pairing_timeout: Duration::from_millis(link.pairing_timeout_ms),
            pairing_code_validity: Duration::from_millis(link.pairing_code_validity_ms),
            reconnect_backoff: Duration::from_millis(link.reconnect_backoff_ms),
            sweep_interval: Duration::from_millis(link.sweep_interval_ms),
            stale_after: Duration::from_millis(link.stale_after_ms),
            default_attempts: link.default_attempts,
            attempt_delay: Duration::from_millis(link.attempt_delay_ms),
            max_attempts_per_job: link.max_attempts_per_job,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.to_link_config().validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.credentials.dir.as_os_str().is_empty() {
            anyhow::bail!("Credential directory must not be empty");
        }

        Ok(())
    }
}
