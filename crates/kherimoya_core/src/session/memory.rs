//! In-memory session backend.
//!
//! Simulates a multiplexer plus a well-behaved (or misbehaving) launcher so the
//! registry can be exercised without tmux. Any line other than `stop` is taken
//! to be the launcher command and triggers the configured [`InstallBehavior`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use super::SessionBackend;
use crate::constants::{INSTALL_MARKER_DIR, STOP_COMMAND};
use crate::error::{SessionError, SessionResult};

/// What the simulated launcher does when started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallBehavior {
    /// Create the install marker right away
    CreateMarker,
    /// Never finish installing
    Hang,
    /// Print the given text and keep running
    Fail(String),
    /// Exit immediately, taking the session with it
    Exit,
    /// Create the install marker, then exit
    CreateMarkerAndExit,
}

/// What the simulated launcher does when told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    /// Exit, ending the session
    Exit,
    /// Keep running; the session can still be killed
    Ignore,
    /// Keep running and refuse to be killed
    Stuck,
    /// The `stop` keystrokes never reach the session
    Reject,
}

#[derive(Debug, Default)]
struct FakeSession {
    start_dir: PathBuf,
    output: String,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, FakeSession>,
    history: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
pub struct InMemorySessions {
    state: Mutex<State>,
    install: InstallBehavior,
    stop: StopBehavior,
    fail_new_session: bool,
    unreachable: AtomicBool,
}

impl Default for InMemorySessions {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            install: InstallBehavior::CreateMarker,
            stop: StopBehavior::Exit,
            fail_new_session: false,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn with_install(mut self, behavior: InstallBehavior) -> Self {
        self.install = behavior;
        self
    }

    pub fn with_stop(mut self, behavior: StopBehavior) -> Self {
        self.stop = behavior;
        self
    }

    /// Make every session creation fail, as if the multiplexer were missing.
    pub fn failing_new_session(mut self) -> Self {
        self.fail_new_session = true;
        self
    }

    /// While set, every call fails as if the multiplexer could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> SessionResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SessionError::Backend("multiplexer unreachable".to_string()));
        }
        Ok(())
    }

    /// Names of live sessions, sorted.
    pub async fn session_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every line ever sent to sessions with this name, oldest first.
    pub async fn sent_lines(&self, name: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state.history.get(name).cloned().unwrap_or_default()
    }

    pub async fn start_dir(&self, name: &str) -> Option<PathBuf> {
        let state = self.state.lock().await;
        state.sessions.get(name).map(|s| s.start_dir.clone())
    }
}

#[async_trait]
impl SessionBackend for InMemorySessions {
    async fn has_session(&self, name: &str) -> SessionResult<bool> {
        self.check_reachable()?;
        Ok(self.state.lock().await.sessions.contains_key(name))
    }

    async fn new_session(&self, name: &str, start_dir: &Path) -> SessionResult<()> {
        self.check_reachable()?;
        if self.fail_new_session {
            return Err(SessionError::Backend("session creation disabled".to_string()));
        }

        let mut state = self.state.lock().await;
        if state.sessions.contains_key(name) {
            return Err(SessionError::CommandFailed {
                command: format!("new-session -s {name}"),
                status: "exit status: 1".to_string(),
                stderr: format!("duplicate session: {name}"),
            });
        }
        state.sessions.insert(
            name.to_string(),
            FakeSession {
                start_dir: start_dir.to_path_buf(),
                output: String::new(),
            },
        );
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> SessionResult<()> {
        self.check_reachable()?;
        if self.stop == StopBehavior::Stuck {
            return Err(SessionError::Backend(format!("session {name} refused to die")));
        }

        let mut state = self.state.lock().await;
        state
            .sessions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SessionError::SessionNotFound(name.to_string()))
    }

    async fn send_line(&self, name: &str, line: &str) -> SessionResult<()> {
        self.check_reachable()?;
        if line == STOP_COMMAND && self.stop == StopBehavior::Reject {
            return Err(SessionError::Backend(format!("could not type into {name}")));
        }

        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(name) else {
            return Err(SessionError::SessionNotFound(name.to_string()));
        };

        let mut ended = false;
        if line == STOP_COMMAND {
            ended = self.stop == StopBehavior::Exit;
        } else {
            match &self.install {
                InstallBehavior::CreateMarker | InstallBehavior::CreateMarkerAndExit => {
                    let marker = session.start_dir.join(INSTALL_MARKER_DIR);
                    std::fs::create_dir_all(&marker)
                        .map_err(|e| SessionError::Spawn(line.to_string(), e))?;
                    ended = self.install == InstallBehavior::CreateMarkerAndExit;
                }
                InstallBehavior::Hang => {}
                InstallBehavior::Fail(text) => {
                    session.output.push_str(text);
                    session.output.push('\n');
                }
                InstallBehavior::Exit => ended = true,
            }
        }

        if ended {
            debug!("Simulated launcher in {} exited", name);
            state.sessions.remove(name);
        }
        state
            .history
            .entry(name.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn capture_pane(&self, name: &str, lines: usize) -> SessionResult<String> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        let session = state
            .sessions
            .get(name)
            .ok_or_else(|| SessionError::SessionNotFound(name.to_string()))?;

        let all: Vec<&str> = session.output.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let sessions = InMemorySessions::new();
        sessions.new_session("a@b", Path::new("/tmp")).await.unwrap();
        assert!(sessions.new_session("a@b", Path::new("/tmp")).await.is_err());
    }

    #[tokio::test]
    async fn test_capture_returns_tail() {
        let sessions = InMemorySessions::new().with_install(InstallBehavior::Fail(
            "one\ntwo\nthree".to_string(),
        ));
        sessions.new_session("a@b", Path::new("/tmp")).await.unwrap();
        sessions.send_line("a@b", "launch").await.unwrap();

        assert_eq!(sessions.capture_pane("a@b", 2).await.unwrap(), "two\nthree");
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_call() {
        let sessions = InMemorySessions::new();
        sessions.new_session("a@b", Path::new("/tmp")).await.unwrap();

        sessions.set_unreachable(true);
        assert!(sessions.has_session("a@b").await.is_err());
        assert!(sessions.send_line("a@b", "stop").await.is_err());

        sessions.set_unreachable(false);
        assert!(sessions.has_session("a@b").await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_session_survives_kill() {
        let sessions = InMemorySessions::new().with_stop(StopBehavior::Stuck);
        sessions.new_session("a@b", Path::new("/tmp")).await.unwrap();
        sessions.send_line("a@b", "stop").await.unwrap();

        assert!(sessions.kill_session("a@b").await.is_err());
        assert!(sessions.has_session("a@b").await.unwrap());
        assert_eq!(sessions.sent_lines("a@b").await, vec!["stop".to_string()]);
    }
}
