//! `tmux` session backend.

use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

use super::SessionBackend;
use crate::error::{SessionError, SessionResult};

/// Drives sessions through the `tmux` command line client.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    program: String,
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxBackend {
    pub fn new() -> Self {
        Self {
            program: "tmux".to_string(),
        }
    }

    /// Use a different tmux binary, e.g. an absolute path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> SessionResult<Output> {
        debug!("Running {} {}", self.program, args.join(" "));
        Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SessionError::Spawn(self.program.clone(), e))
    }

    async fn run_checked(&self, args: &[&str]) -> SessionResult<Output> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(SessionError::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// tmux silently rewrites `.` and `:` in session names; apply the same
/// mapping up front so lookups match what tmux created.
pub fn tmux_session_name(name: &str) -> String {
    name.replace(['.', ':'], "_")
}

/// Exact-match target for a session.
fn session_target(name: &str) -> String {
    format!("={}", tmux_session_name(name))
}

/// First pane of the session's current window. Sessions are created with a
/// single window and pane, so this is the pane the launcher runs in.
fn pane_target(name: &str) -> String {
    format!("={}:", tmux_session_name(name))
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    async fn has_session(&self, name: &str) -> SessionResult<bool> {
        // Exits non-zero both for a missing session and for no tmux server.
        let output = self.run(&["has-session", "-t", &session_target(name)]).await?;
        Ok(output.status.success())
    }

    async fn new_session(&self, name: &str, start_dir: &Path) -> SessionResult<()> {
        let session = tmux_session_name(name);
        let start_dir = start_dir.to_string_lossy();
        self.run_checked(&["new-session", "-d", "-s", &session, "-c", &start_dir])
            .await
            .map(|_| ())
    }

    async fn kill_session(&self, name: &str) -> SessionResult<()> {
        self.run_checked(&["kill-session", "-t", &session_target(name)])
            .await
            .map(|_| ())
    }

    async fn send_line(&self, name: &str, line: &str) -> SessionResult<()> {
        let target = pane_target(name);
        self.run_checked(&["send-keys", "-t", &target, "-l", line])
            .await?;
        self.run_checked(&["send-keys", "-t", &target, "Enter"])
            .await
            .map(|_| ())
    }

    async fn capture_pane(&self, name: &str, lines: usize) -> SessionResult<String> {
        let start = format!("-{lines}");
        let output = self
            .run_checked(&["capture-pane", "-p", "-t", &pane_target(name), "-S", &start])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_mapping() {
        assert_eq!(tmux_session_name("Alpha@ab12"), "Alpha@ab12");
        assert_eq!(tmux_session_name("v1.2@ab12"), "v1_2@ab12");
        assert_eq!(session_target("Alpha@ab12"), "=Alpha@ab12");
        assert_eq!(pane_target("Alpha@ab12"), "=Alpha@ab12:");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let backend = TmuxBackend::with_program("kherimoya-no-such-tmux-binary");
        let err = backend.has_session("Alpha@ab12").await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(..)));
    }
}
