//! Configuration management for the `kherimoya` tool.
//!
//! Settings are read from a TOML file. A missing file is replaced by the
//! defaults, which are written back so they can be edited.

use kherimoya_core::{LauncherSettings, PollSettings, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub registry: RegistrySettings,
    pub launcher: LauncherConfig,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

/// Where servers live and how the registry treats them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Directory holding `servers/`
    pub root: PathBuf,
    /// Require unique names as well as unique identifiers
    pub strict_names: bool,
    /// Installation timeout in seconds, 0 waits forever
    pub install_timeout_secs: u64,
    /// Refuse to stop servers that are not recorded as running
    pub require_running_to_stop: bool,
    /// Pause after installation before the server is stopped again
    pub settle_delay_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            strict_names: true,
            install_timeout_secs: 300,
            require_running_to_stop: true,
            settle_delay_ms: 1000,
        }
    }
}

/// The server launcher invoked inside each session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub program: String,
    pub args: Vec<String>,
    pub directory_flag: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let launcher = LauncherSettings::default();
        Self {
            program: launcher.program,
            args: launcher.args,
            directory_flag: launcher.directory_flag,
        }
    }
}

/// Polling behavior while installing and stopping servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// tmux executable
    pub tmux_program: String,
    pub install_initial_delay_ms: u64,
    pub install_backoff_factor: f64,
    pub install_max_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub shutdown_poll_interval_ms: u64,
    /// Pane lines searched for failure markers
    pub capture_lines: usize,
    /// Launcher output that marks a failed installation
    pub failure_markers: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let polling = PollSettings::default();
        Self {
            tmux_program: "tmux".to_string(),
            install_initial_delay_ms: duration_ms(polling.install_initial_delay),
            install_backoff_factor: polling.install_backoff_factor,
            install_max_delay_ms: duration_ms(polling.install_max_delay),
            shutdown_timeout_secs: polling.shutdown_timeout.as_secs(),
            shutdown_poll_interval_ms: duration_ms(polling.shutdown_poll_interval),
            capture_lines: polling.capture_lines,
            failure_markers: polling.failure_markers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks values that would otherwise fail deep inside an operation.
    pub fn validate(&self) -> Result<(), String> {
        if self.registry.root.as_os_str().is_empty() {
            return Err("Registry root cannot be empty".to_string());
        }

        if self.launcher.program.trim().is_empty() {
            return Err("Launcher program cannot be empty".to_string());
        }
        if self.session.tmux_program.trim().is_empty() {
            return Err("tmux program cannot be empty".to_string());
        }

        let factor = self.session.install_backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(format!(
                "Install backoff factor must be a finite number of at least 1.0, got {factor}"
            ));
        }
        if self.session.install_initial_delay_ms == 0 {
            return Err("Install initial delay must be positive".to_string());
        }
        if self.session.install_initial_delay_ms > self.session.install_max_delay_ms {
            return Err("Install initial delay cannot exceed the maximum delay".to_string());
        }
        if self.session.shutdown_poll_interval_ms == 0 {
            return Err("Shutdown poll interval must be positive".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Converts the file settings into the registry's configuration.
    pub fn to_registry_config(&self) -> RegistryConfig {
        let install_timeout = match self.registry.install_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        RegistryConfig {
            strict_names: self.registry.strict_names,
            install_timeout,
            settle_delay: Duration::from_millis(self.registry.settle_delay_ms),
            require_running_to_stop: self.registry.require_running_to_stop,
            launcher: LauncherSettings {
                program: self.launcher.program.clone(),
                args: self.launcher.args.clone(),
                directory_flag: self.launcher.directory_flag.clone(),
            },
            polling: PollSettings {
                install_initial_delay: Duration::from_millis(
                    self.session.install_initial_delay_ms,
                ),
                install_backoff_factor: self.session.install_backoff_factor,
                install_max_delay: Duration::from_millis(self.session.install_max_delay_ms),
                shutdown_timeout: Duration::from_secs(self.session.shutdown_timeout_secs),
                shutdown_poll_interval: Duration::from_millis(
                    self.session.shutdown_poll_interval_ms,
                ),
                capture_lines: self.session.capture_lines,
                failure_markers: self.session.failure_markers.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.registry.root, PathBuf::from("."));
        assert!(config.registry.strict_names);
        assert_eq!(config.registry.install_timeout_secs, 300);
        assert_eq!(config.launcher.program, "endstone");
        assert_eq!(config.launcher.args, vec!["-y".to_string()]);
        assert_eq!(config.session.install_initial_delay_ms, 500);
        assert_eq!(config.session.install_max_delay_ms, 2000);
        assert_eq!(config.session.shutdown_timeout_secs, 60);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kherimoya.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();

        assert!(path.exists());
        assert_eq!(config.registry.install_timeout_secs, 300);

        // The written defaults load back unchanged
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.session.failure_markers, config.session.failure_markers);
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kherimoya.toml");
        let toml_content = r#"
[registry]
root = "/srv/kherimoya"
strict_names = false
install_timeout_secs = 0

[logging]
level = "debug"
"#;
        tokio::fs::write(&path, toml_content).await.unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();

        assert_eq!(config.registry.root, PathBuf::from("/srv/kherimoya"));
        assert!(!config.registry.strict_names);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.launcher.program, "endstone");

        let registry = config.to_registry_config();
        assert_eq!(registry.install_timeout, None);
        assert!(!registry.strict_names);
    }

    #[tokio::test]
    async fn test_non_finite_backoff_from_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kherimoya.toml");
        tokio::fs::write(&path, "[session]\ninstall_backoff_factor = inf\n")
            .await
            .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(config.session.install_backoff_factor.is_infinite());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kherimoya.toml");
        tokio::fs::write(&path, "[registry\nroot = ").await.unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_to_registry_config() {
        let config = AppConfig::default().to_registry_config();

        assert_eq!(config.install_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert_eq!(config.launcher, LauncherSettings::default());
        assert_eq!(config.polling, PollSettings::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.install_backoff_factor = 0.5;
        assert!(config.validate().is_err());

        for factor in [f64::INFINITY, f64::NAN] {
            let mut config = AppConfig::default();
            config.session.install_backoff_factor = factor;
            assert!(config.validate().is_err(), "factor {factor}");
        }

        let mut config = AppConfig::default();
        config.launcher.program = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.install_initial_delay_ms = 5000;
        assert!(config.validate().is_err());
    }
}
