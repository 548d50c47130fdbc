//! Configuration management.
//!
//! Configuration is layered: built-in defaults, then an optional
//! `config.toml` under the data home, then `PORTUNIX_*` environment
//! variables. `PORTUNIX_DATA_HOME` and `PORTUNIX_INSTALL_ROOT` override
//! the two directory roots directly.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Filesystem roots
    #[serde(default)]
    pub paths: PathsConfig,

    /// Plugin supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Self-update configuration
    #[serde(default)]
    pub update: UpdateConfig,

    /// Package installer configuration
    #[serde(default)]
    pub installer: InstallerConfig,

    /// Provider abstraction configuration
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: crate::telemetry::LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Persistent registry and plugin-data directory
    #[serde(default = "default_data_home")]
    pub data_home: PathBuf,

    /// Directory holding the main and helper binaries. Defaults to the
    /// directory of the running executable; self-update and the plugin
    /// supervisor both resolve against it.
    #[serde(default)]
    pub install_root: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_home: default_data_home(),
            install_root: None,
        }
    }
}

impl PathsConfig {
    /// The plugin registry file.
    pub fn registry_file(&self) -> PathBuf {
        self.data_home.join("registry").join("plugins.json")
    }

    /// Install root for a plugin id: `<data>/plugins/<id>`.
    pub fn plugin_dir(&self, id: &str) -> PathBuf {
        self.data_home.join("plugins").join(id)
    }

    /// Transient staging directory for a self-update session.
    pub fn update_staging_dir(&self, version: &semver::Version) -> PathBuf {
        self.data_home.join("update").join(format!("staged-{}", version))
    }

    /// Timestamped backup directory for a self-update session.
    pub fn update_backup_dir(&self, timestamp: &str) -> PathBuf {
        self.data_home.join("update").join(format!("backup-{}", timestamp))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Deadline for a plugin to open its gRPC server after spawn
    #[serde(with = "humantime_serde", default = "default_handshake_deadline")]
    pub handshake_deadline: Duration,

    /// Cadence of HealthCheck polls
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_interval: Duration,

    /// Consecutive failed polls before an instance is marked Unhealthy
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,

    /// First restart backoff step (doubles per attempt)
    #[serde(with = "humantime_serde", default = "default_restart_backoff_base")]
    pub restart_backoff_base: Duration,

    /// Restart backoff cap
    #[serde(with = "humantime_serde", default = "default_restart_backoff_cap")]
    pub restart_backoff_cap: Duration,

    /// Failed restarts within the quarantine window before quarantine
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,

    /// Sliding window for counting failed restarts
    #[serde(with = "humantime_serde", default = "default_quarantine_window")]
    pub quarantine_window: Duration,

    /// Grace budget for Shutdown RPC before signalling
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    /// Host API version offered during Initialize
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_deadline: default_handshake_deadline(),
            health_interval: default_health_interval(),
            health_failure_threshold: default_health_failure_threshold(),
            restart_backoff_base: default_restart_backoff_base(),
            restart_backoff_cap: default_restart_backoff_cap(),
            quarantine_threshold: default_quarantine_threshold(),
            quarantine_window: default_quarantine_window(),
            shutdown_grace: default_shutdown_grace(),
            api_version: default_api_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    /// Release descriptor URL
    #[serde(default = "default_update_source")]
    pub source: String,

    /// Per-download timeout
    #[serde(with = "humantime_serde", default = "default_download_timeout")]
    pub download_timeout: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            source: default_update_source(),
            download_timeout: default_download_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallerConfig {
    /// Package catalog file. Relative paths resolve against the data home.
    #[serde(default = "default_catalog_file")]
    pub catalog: PathBuf,

    /// Per-step timeout for installation methods
    #[serde(with = "humantime_serde", default = "default_step_timeout")]
    pub step_timeout: Duration,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            catalog: default_catalog_file(),
            step_timeout: default_step_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    /// Concurrent operations allowed per provider
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Grace budget for stopEnvironment before force
    #[serde(with = "humantime_serde", default = "default_stop_grace")]
    pub stop_grace: Duration,

    /// Retry budget for transient provider errors
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First retry backoff step (doubles per attempt)
    #[serde(with = "humantime_serde", default = "default_retry_backoff_base")]
    pub retry_backoff_base: Duration,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            stop_grace: default_stop_grace(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_base: default_retry_backoff_base(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════════════════════════

impl Config {
    /// Load configuration from defaults, the optional `config.toml`
    /// under the data home, and `PORTUNIX_*` environment variables.
    pub fn load() -> Result<Self> {
        let data_home = env_data_home().unwrap_or_else(default_data_home);
        let config_file = data_home.join("config.toml");

        let builder = config::Config::builder()
            .add_source(config::File::from(config_file).required(false))
            .add_source(
                config::Environment::with_prefix("PORTUNIX")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: Self = builder.build()?.try_deserialize()?;

        // The two directory roots have dedicated, documented variables
        // that take precedence over the layered sources.
        if let Some(home) = env_data_home() {
            cfg.paths.data_home = home;
        }
        if let Some(root) = std::env::var_os("PORTUNIX_INSTALL_ROOT") {
            cfg.paths.install_root = Some(PathBuf::from(root));
        }

        Ok(cfg)
    }
}

fn env_data_home() -> Option<PathBuf> {
    std::env::var_os("PORTUNIX_DATA_HOME").map(PathBuf::from)
}

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

fn default_data_home() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portunix")
}

fn default_handshake_deadline() -> Duration {
    Duration::from_secs(5)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_failure_threshold() -> u32 {
    3
}

fn default_restart_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_restart_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_quarantine_threshold() -> u32 {
    5
}

fn default_quarantine_window() -> Duration {
    Duration::from_secs(300)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_api_version() -> String {
    "1.0".to_string()
}

fn default_update_source() -> String {
    "https://get.portunix.dev/releases/latest.json".to_string()
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_catalog_file() -> PathBuf {
    PathBuf::from("install-packages.json")
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(1800)
}

fn default_pool_size() -> usize {
    4
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_base() -> Duration {
    Duration::from_millis(500)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_specified_cadences() {
        let cfg = Config::default();
        assert_eq!(cfg.supervisor.handshake_deadline, Duration::from_secs(5));
        assert_eq!(cfg.supervisor.health_interval, Duration::from_secs(10));
        assert_eq!(cfg.supervisor.health_failure_threshold, 3);
        assert_eq!(cfg.supervisor.restart_backoff_cap, Duration::from_secs(30));
        assert_eq!(cfg.supervisor.quarantine_threshold, 5);
        assert_eq!(cfg.providers.pool_size, 4);
    }

    #[test]
    fn test_state_layout_paths() {
        let cfg = PathsConfig {
            data_home: PathBuf::from("/data"),
            install_root: None,
        };
        assert_eq!(
            cfg.registry_file(),
            PathBuf::from("/data/registry/plugins.json")
        );
        assert_eq!(cfg.plugin_dir("p1"), PathBuf::from("/data/plugins/p1"));
        let v: semver::Version = "1.7.5".parse().unwrap();
        assert_eq!(
            cfg.update_staging_dir(&v),
            PathBuf::from("/data/update/staged-1.7.5")
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let toml = r#"
[supervisor]
handshake_deadline = "2s"
health_interval = "1s"

[providers]
pool_size = 8
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.supervisor.handshake_deadline, Duration::from_secs(2));
        assert_eq!(cfg.providers.pool_size, 8);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.supervisor.quarantine_threshold, 5);
    }
}
