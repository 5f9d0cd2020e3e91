//! Configuration loading and validation.
//!
//! Loads `config.toml` from `$SCANGUARD_CONFIG_PATH` or `~/.scanguard/`.
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level control plane configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared state database.
    pub store: StoreConfig,
    /// Emergency stop behaviour.
    pub emergency: EmergencyConfig,
    /// Session pulse monitor.
    pub pulse: PulseConfig,
    /// Session lease settings.
    pub sessions: SessionsConfig,
    /// Audit trail signing.
    pub audit: AuditConfig,
    /// Log filtering.
    pub logging: LoggingConfig,
}

/// Shared SQLite store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. Defaults to `~/.scanguard/control.db`.
    pub db_path: Option<PathBuf>,
    /// Maximum pooled connections per process.
    pub max_connections: u32,
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Longest emergency stop an activation may request: 365 days.
pub const MAX_STOP_MINUTES: u32 = 525_600;

/// Emergency stop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Stop duration used when an activation does not specify one.
    pub default_duration_minutes: u32,
    /// Whether the non-blocking request check lets traffic through when the
    /// flag cannot be read. Admission never fails open regardless.
    pub fail_open_on_status_error: bool,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            default_duration_minutes: default_stop_minutes(),
            fail_open_on_status_error: true,
        }
    }
}

/// Session pulse monitor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Run the monitor inside `scanguard start`.
    pub enabled: bool,
    /// Seconds between pulse ticks.
    pub interval_secs: u64,
    /// Base URL of the external authority. The monitor is disabled without it.
    pub authority_url: Option<String>,
    /// Per-probe HTTP timeout.
    pub request_timeout_secs: u64,
    /// Probe attempts per session before the authority counts as unreachable.
    pub max_attempts: u32,
    /// First retry delay.
    pub initial_backoff_ms: u64,
    /// Retry delay ceiling.
    pub max_backoff_ms: u64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_pulse_interval_secs(),
            authority_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl PulseConfig {
    /// Tick interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-probe timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Session lease settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Lease granted at login, in minutes.
    pub lease_minutes: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            lease_minutes: default_lease_minutes(),
        }
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Environment variable holding the HMAC signing key.
    pub signing_key_env: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            signing_key_env: default_signing_key_env(),
        }
    }
}

/// Log filtering used when `RUST_LOG` is unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

// Default value functions for serde

fn default_max_connections() -> u32 {
    8
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_stop_minutes() -> u32 {
    60
}
fn default_pulse_interval_secs() -> u64 {
    300
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_lease_minutes() -> u32 {
    480
}
fn default_signing_key_env() -> String {
    "SCANGUARD_AUDIT_KEY".to_owned()
}

/// Filesystem locations under `~/.scanguard/`.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root directory.
    pub root: PathBuf,
    /// Default config file.
    pub config_toml: PathBuf,
    /// Optional `.env` file with secrets.
    pub env_file: PathBuf,
    /// Default database file.
    pub db_file: PathBuf,
    /// Rotated JSON logs.
    pub logs_dir: PathBuf,
}

/// Resolve the default config directory (`~/.scanguard/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".scanguard"))
}

/// Resolve all runtime paths.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    let root = config_dir()?;
    Ok(RuntimePaths {
        config_toml: root.join("config.toml"),
        env_file: root.join(".env"),
        db_file: root.join("control.db"),
        logs_dir: root.join("logs"),
        root,
    })
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// A missing config file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the merged configuration fails validation.
    pub fn load() -> anyhow::Result<Self> {
        let path = match std::env::var("SCANGUARD_CONFIG_PATH") {
            Ok(p) => PathBuf::from(p),
            Err(_) => runtime_paths()?.config_toml,
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file only, without env overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests do not have to mutate the process
    /// environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SCANGUARD_DB_PATH") {
            self.store.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SCANGUARD_AUTHORITY_URL") {
            self.pulse.authority_url = Some(v);
        }
        if let Some(v) = env("SCANGUARD_PULSE_INTERVAL_SECS") {
            match v.parse() {
                Ok(n) => self.pulse.interval_secs = n,
                Err(_) => tracing::warn!(
                    var = "SCANGUARD_PULSE_INTERVAL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("SCANGUARD_EMERGENCY_FAIL_OPEN") {
            match v.parse() {
                Ok(b) => self.emergency.fail_open_on_status_error = b,
                Err(_) => tracing::warn!(
                    var = "SCANGUARD_EMERGENCY_FAIL_OPEN",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("SCANGUARD_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Validate value ranges.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.store.max_connections >= 1,
            "store.max_connections must be >= 1"
        );
        anyhow::ensure!(
            (1..=MAX_STOP_MINUTES).contains(&self.emergency.default_duration_minutes),
            "emergency.default_duration_minutes must be between 1 and {MAX_STOP_MINUTES}"
        );
        anyhow::ensure!(
            self.pulse.interval_secs >= 1,
            "pulse.interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.pulse.max_attempts >= 1,
            "pulse.max_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.pulse.initial_backoff_ms <= self.pulse.max_backoff_ms,
            "pulse.initial_backoff_ms must not exceed pulse.max_backoff_ms"
        );
        anyhow::ensure!(
            self.sessions.lease_minutes >= 1,
            "sessions.lease_minutes must be >= 1"
        );
        if let Some(ref raw) = self.pulse.authority_url {
            let parsed = url::Url::parse(raw)
                .with_context(|| format!("pulse.authority_url is not a valid URL: {raw}"))?;
            anyhow::ensure!(
                parsed.scheme() == "https" || parsed.scheme() == "http",
                "pulse.authority_url must use http or https"
            );
        }
        Ok(())
    }

    /// Resolved database path: explicit setting or the runtime default.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the home directory
    /// cannot be determined.
    pub fn db_path(&self) -> anyhow::Result<PathBuf> {
        match self.store.db_path {
            Some(ref p) => Ok(p.clone()),
            None => Ok(runtime_paths()?.db_file),
        }
    }
}
