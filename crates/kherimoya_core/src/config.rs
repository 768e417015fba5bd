//! Registry, launcher and polling settings.

use std::path::Path;
use std::time::Duration;

use crate::session::shell_quote;

/// Behavior switches for [`ServerRegistry`](crate::ServerRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Require names to be unique in addition to identifiers
    pub strict_names: bool,
    /// Default installation timeout for creation, `None` waits forever
    pub install_timeout: Option<Duration>,
    /// Pause between a finished installation and the stop request
    pub settle_delay: Duration,
    /// Refuse to stop a server whose last known state is not running
    pub require_running_to_stop: bool,
    pub launcher: LauncherSettings,
    pub polling: PollSettings,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strict_names: true,
            install_timeout: Some(Duration::from_secs(300)),
            settle_delay: Duration::from_secs(1),
            require_running_to_stop: true,
            launcher: LauncherSettings::default(),
            polling: PollSettings::default(),
        }
    }
}

/// How the game server launcher is invoked inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSettings {
    /// Executable name or path
    pub program: String,
    /// Arguments placed before the directory flag, e.g. the non-interactive switch
    pub args: Vec<String>,
    /// Flag that introduces the working directory
    pub directory_flag: String,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            program: "endstone".to_string(),
            args: vec!["-y".to_string()],
            directory_flag: "-s".to_string(),
        }
    }
}

impl LauncherSettings {
    /// Shell command line that starts the launcher against `working_dir`.
    pub fn command_line(&self, working_dir: &Path) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 3);
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.push(shell_quote(&self.directory_flag));
        parts.push(shell_quote(&working_dir.to_string_lossy()));
        parts.join(" ")
    }
}

/// Timing of the installation and shutdown polling loops.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    /// First delay between installation checks
    pub install_initial_delay: Duration,
    /// Growth factor applied after every installation check
    pub install_backoff_factor: f64,
    /// Ceiling for the installation check delay
    pub install_max_delay: Duration,
    /// How long to wait for a session to exit after `stop`
    pub shutdown_timeout: Duration,
    /// Delay between session presence checks during shutdown
    pub shutdown_poll_interval: Duration,
    /// Pane lines inspected for failure markers
    pub capture_lines: usize,
    /// Output fragments that mean the launcher failed
    pub failure_markers: Vec<String>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            install_initial_delay: Duration::from_millis(500),
            install_backoff_factor: 1.5,
            install_max_delay: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(60),
            shutdown_poll_interval: Duration::from_millis(500),
            capture_lines: 50,
            failure_markers: vec![
                "Traceback (most recent call last):".to_string(),
                "[CRITICAL]".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert!(config.strict_names);
        assert_eq!(config.install_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.polling.install_initial_delay, Duration::from_millis(500));
        assert_eq!(config.polling.install_max_delay, Duration::from_secs(2));
        assert_eq!(config.polling.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_command_line() {
        let launcher = LauncherSettings::default();
        let line = launcher.command_line(&PathBuf::from("/srv/kh/servers/Alpha@ab12/server"));
        assert_eq!(line, "endstone -y -s /srv/kh/servers/Alpha@ab12/server");

        let line = launcher.command_line(&PathBuf::from("/srv/my servers/Bob's@ab12/server"));
        assert_eq!(line, "endstone -y -s '/srv/my servers/Bob'\\''s@ab12/server'");
    }
}
