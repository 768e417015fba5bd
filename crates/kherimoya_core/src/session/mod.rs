//! Process control through detached terminal sessions.
//!
//! Every server runs inside its own detached multiplexer session named
//! `<name>@<identifier>`. [`SessionController`] drives those sessions through a
//! [`SessionBackend`], which is `tmux` in production and an in-memory fake in
//! tests.
//!
//! Two error tiers apply here. Lookups and kills done as cleanup are best
//! effort: they log and never fail the caller. Creating a session, injecting
//! commands and the installation wait are authoritative and return errors.

pub mod memory;
pub mod tmux;

pub use memory::{InMemorySessions, InstallBehavior, StopBehavior};
pub use tmux::TmuxBackend;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::{LauncherSettings, PollSettings};
use crate::constants::STOP_COMMAND;
use crate::entity::ServerEntity;
use crate::error::{Result, ServerError, SessionResult};

/// Minimal multiplexer surface needed to run servers
#[async_trait]
pub trait SessionBackend: Send + Sync + std::fmt::Debug {
    /// Whether a session with exactly this name exists
    async fn has_session(&self, name: &str) -> SessionResult<bool>;

    /// Create a detached session whose shell starts in `start_dir`
    async fn new_session(&self, name: &str, start_dir: &Path) -> SessionResult<()>;

    /// Kill a session
    async fn kill_session(&self, name: &str) -> SessionResult<()>;

    /// Type `line` into the first pane of the first window and press enter
    async fn send_line(&self, name: &str, line: &str) -> SessionResult<()>;

    /// The last `lines` lines of the first pane
    async fn capture_pane(&self, name: &str, lines: usize) -> SessionResult<String>;
}

/// Geometric backoff with a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    factor: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            factor,
            max,
        }
    }

    /// Returns the delay to wait now and advances the schedule. A factor that
    /// overflows or is not a number pins the delay to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

/// Starts, stops and watches server processes.
#[derive(Debug, Clone)]
pub struct SessionController {
    backend: Arc<dyn SessionBackend>,
    launcher: LauncherSettings,
    polling: PollSettings,
    require_running_to_stop: bool,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        launcher: LauncherSettings,
        polling: PollSettings,
    ) -> Self {
        Self {
            backend,
            launcher,
            polling,
            require_running_to_stop: true,
        }
    }

    /// Sets whether [`terminate`](Self::terminate) insists on a running server.
    pub fn with_require_running_to_stop(mut self, require: bool) -> Self {
        self.require_running_to_stop = require;
        self
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    pub fn polling(&self) -> &PollSettings {
        &self.polling
    }

    /// Starts the launcher for `entity` in a fresh detached session.
    #[instrument(skip(self, entity), fields(server = %entity))]
    pub async fn launch(&self, entity: &ServerEntity) -> Result<()> {
        let session = require_session(entity, "Attempted to start a server which does not exist")?;

        self.kill_quietly(&session).await;

        let working_dir = entity.working_dir();
        self.backend
            .new_session(&session, &working_dir)
            .await
            .map_err(|e| ServerError::Start(session.clone(), e))?;

        let command = self.launcher.command_line(&working_dir);
        self.backend
            .send_line(&session, &command)
            .await
            .map_err(|e| ServerError::Start(session.clone(), e))?;

        info!("Launched {} in session {}", entity, session);
        Ok(())
    }

    /// Asks the server to shut down by typing `stop` into its session.
    ///
    /// A missing session is not an error; there is nothing to stop.
    #[instrument(skip(self, entity), fields(server = %entity))]
    pub async fn terminate(&self, entity: &ServerEntity) -> Result<()> {
        let session = require_session(entity, "Attempted to stop a server which does not exist")?;

        if self.require_running_to_stop && !entity.running() {
            return Err(ServerError::NotRunning(session));
        }

        self.send_stop(&session).await.map(|_| ())
    }

    /// Sends `stop` if the session exists. Returns whether it did.
    ///
    /// A failed lookup is a transport failure, not an absent session.
    pub(crate) async fn send_stop(&self, session: &str) -> Result<bool> {
        let present = self
            .backend
            .has_session(session)
            .await
            .map_err(|e| ServerError::Stop(session.to_string(), e))?;
        if !present {
            debug!("Session {} is not running, nothing to stop", session);
            return Ok(false);
        }

        self.backend
            .send_line(session, STOP_COMMAND)
            .await
            .map_err(|e| ServerError::Stop(session.to_string(), e))?;

        info!("Sent stop to session {}", session);
        Ok(true)
    }

    /// Live check of whether the server's session exists.
    pub async fn is_running(&self, entity: &ServerEntity) -> bool {
        match entity.session_name() {
            Some(session) if entity.exists() => self.session_present(&session).await,
            _ => false,
        }
    }

    /// Waits for the launcher to finish its first-run installation.
    ///
    /// Completion is signalled by the install marker directory. Pane output is
    /// checked for failure markers on every round, and the session vanishing
    /// before the marker appears is a failure. On timeout or failure the
    /// session is killed before the error is returned. `None` waits forever.
    #[instrument(skip(self, entity), fields(server = %entity))]
    pub async fn await_installation(
        &self,
        entity: &ServerEntity,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let session = require_session(entity, "Cannot wait for a server which does not exist")?;
        let marker = entity.install_marker();
        let started = Instant::now();
        let mut backoff = Backoff::new(
            self.polling.install_initial_delay,
            self.polling.install_backoff_factor,
            self.polling.install_max_delay,
        );

        loop {
            if marker.is_dir() {
                info!(
                    "Installation of {} finished after {:?}",
                    entity,
                    started.elapsed()
                );
                return Ok(());
            }

            if let Err(e) = self.check_install_progress(&session, &marker).await {
                self.kill_quietly(&session).await;
                return Err(ServerError::creation(&entity.to_string(), e));
            }

            if let Some(limit) = timeout {
                if started.elapsed() > limit {
                    warn!("Installation of {} timed out after {:?}", entity, limit);
                    self.kill_quietly(&session).await;
                    return Err(ServerError::Timeout {
                        operation: "Server installation",
                        timeout: limit,
                    });
                }
            }

            let delay = backoff.next_delay();
            debug!("Install marker not present yet, checking again in {:?}", delay);
            sleep(delay).await;
        }
    }

    /// Returns a failure reason if the installing session died or reported an error.
    async fn check_install_progress(
        &self,
        session: &str,
        marker: &Path,
    ) -> std::result::Result<(), String> {
        match self.backend.has_session(session).await {
            // The launcher may finish and exit between the marker check and now.
            Ok(false) if !marker.is_dir() => {
                return Err(format!("session {session} exited before installation finished"));
            }
            Ok(_) => {}
            Err(e) => debug!("Session lookup for {} failed: {}", session, e),
        }

        match self.backend.capture_pane(session, self.polling.capture_lines).await {
            Ok(output) => {
                if let Some(found) = self
                    .polling
                    .failure_markers
                    .iter()
                    .find(|m| output.contains(m.as_str()))
                {
                    return Err(format!("launcher reported a failure ({found})"));
                }
            }
            Err(e) => debug!("Could not capture output of {}: {}", session, e),
        }

        Ok(())
    }

    /// Polls until the server's session is gone. Returns `false` if it is still
    /// present once `timeout` has elapsed.
    #[instrument(skip(self, entity), fields(server = %entity))]
    pub async fn await_graceful_shutdown(
        &self,
        entity: &ServerEntity,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let Some(session) = entity.session_name() else {
            return true;
        };
        let started = Instant::now();

        loop {
            if !self.session_present(&session).await {
                info!("Session {} exited after {:?}", session, started.elapsed());
                return true;
            }
            if started.elapsed() >= timeout {
                warn!("Session {} still present after {:?}", session, timeout);
                return false;
            }
            sleep(poll_interval).await;
        }
    }

    /// Kills the session if it exists, ignoring every failure.
    pub async fn kill_quietly(&self, session: &str) {
        match self.backend.has_session(session).await {
            Ok(true) => {
                if let Err(e) = self.backend.kill_session(session).await {
                    debug!("Ignoring failure to kill session {}: {}", session, e);
                } else {
                    debug!("Killed session {}", session);
                }
            }
            Ok(false) => {}
            Err(e) => debug!("Ignoring failed lookup of session {}: {}", session, e),
        }
    }

    /// Session presence where lookup failures read as absent.
    pub(crate) async fn session_present(&self, session: &str) -> bool {
        match self.backend.has_session(session).await {
            Ok(present) => present,
            Err(e) => {
                debug!("Session lookup for {} failed: {}", session, e);
                false
            }
        }
    }
}

fn require_session(entity: &ServerEntity, reason: &str) -> Result<String> {
    match entity.session_name() {
        Some(session) if entity.exists() => Ok(session),
        _ => {
            debug!("{}: {}", reason, entity);
            Err(ServerError::DoesNotExist(entity.to_string()))
        }
    }
}

/// Quotes `value` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    fn fast_polling() -> PollSettings {
        PollSettings {
            install_initial_delay: Duration::from_millis(5),
            install_backoff_factor: 1.5,
            install_max_delay: Duration::from_millis(20),
            shutdown_timeout: Duration::from_millis(100),
            shutdown_poll_interval: Duration::from_millis(5),
            ..PollSettings::default()
        }
    }

    fn controller(sessions: &Arc<InMemorySessions>) -> SessionController {
        SessionController::new(sessions.clone(), LauncherSettings::default(), fast_polling())
    }

    async fn existing_server(root: &TempDir) -> (ServerEntity, PathBuf) {
        let path = root.path().join("servers/Alpha@ab12");
        std::fs::create_dir_all(path.join("server")).unwrap();
        let mut entity = ServerEntity::placeholder(root.path(), "Alpha");
        entity.refresh(&path).await.unwrap();
        (entity, path)
    }

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::new(Duration::from_millis(500), 1.5, Duration::from_secs(2));
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 750, 1125, 1687, 2000, 2000]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("endstone"), "endstone");
        assert_eq!(shell_quote("/srv/Alpha@ab12/server"), "/srv/Alpha@ab12/server");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_backoff_saturates() {
        let max = Duration::from_secs(2);

        let mut backoff = Backoff::new(Duration::from_millis(500), f64::INFINITY, max);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), max);
        assert_eq!(backoff.next_delay(), max);

        let mut backoff = Backoff::new(Duration::from_millis(500), f64::NAN, max);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), max);

        let mut backoff = Backoff::new(Duration::from_millis(500), 1e300, max);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), max);
    }

    #[tokio::test]
    async fn test_launch_requires_existing_server() {
        let root = tempdir().unwrap();
        let sessions = Arc::new(InMemorySessions::new());
        let entity = ServerEntity::placeholder(root.path(), "Alpha");

        let err = controller(&sessions).launch(&entity).await.unwrap_err();
        assert!(matches!(err, ServerError::DoesNotExist(_)));
        assert!(sessions.session_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_launch_replaces_stale_session() {
        let root = tempdir().unwrap();
        let (entity, path) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new());
        sessions
            .new_session("Alpha@ab12", Path::new("/stale"))
            .await
            .unwrap();

        controller(&sessions).launch(&entity).await.unwrap();

        assert_eq!(
            sessions.start_dir("Alpha@ab12").await,
            Some(path.join("server"))
        );
        let sent = sessions.sent_lines("Alpha@ab12").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("endstone -y -s "));
        assert!(sent[0].ends_with("/servers/Alpha@ab12/server"));
    }

    #[tokio::test]
    async fn test_launch_failure_is_start_error() {
        let root = tempdir().unwrap();
        let (entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new().failing_new_session());

        let err = controller(&sessions).launch(&entity).await.unwrap_err();
        assert!(matches!(err, ServerError::Start(..)));
        assert_eq!(err.kind(), ErrorKind::ProcessControl);
    }

    #[tokio::test]
    async fn test_await_installation_sees_marker() {
        let root = tempdir().unwrap();
        let (entity, path) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new());
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        controller
            .await_installation(&entity, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(path.join("server/worlds").is_dir());
    }

    #[tokio::test]
    async fn test_await_installation_timeout_kills_session() {
        let root = tempdir().unwrap();
        let (entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new().with_install(InstallBehavior::Hang));
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        let err = controller
            .await_installation(&entity, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!sessions.has_session("Alpha@ab12").await.unwrap());
    }

    #[tokio::test]
    async fn test_await_installation_failure_marker() {
        let root = tempdir().unwrap();
        let (entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new().with_install(InstallBehavior::Fail(
            "Traceback (most recent call last):\n  boom".to_string(),
        )));
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        let err = controller.await_installation(&entity, None).await.unwrap_err();

        assert!(matches!(err, ServerError::Creation { .. }));
        assert!(!sessions.has_session("Alpha@ab12").await.unwrap());
    }

    #[tokio::test]
    async fn test_await_installation_session_exit() {
        let root = tempdir().unwrap();
        let (entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new().with_install(InstallBehavior::Exit));
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        let err = controller.await_installation(&entity, None).await.unwrap_err();
        assert!(matches!(err, ServerError::Creation { .. }));
    }

    #[tokio::test]
    async fn test_await_installation_after_launcher_exit() {
        let root = tempdir().unwrap();
        let (entity, path) = existing_server(&root).await;
        let sessions = Arc::new(
            InMemorySessions::new().with_install(InstallBehavior::CreateMarkerAndExit),
        );
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        assert!(!sessions.has_session("Alpha@ab12").await.unwrap());

        controller.await_installation(&entity, None).await.unwrap();
        assert!(path.join("server/worlds").is_dir());
    }

    #[tokio::test]
    async fn test_install_progress_rechecks_marker() {
        let root = tempdir().unwrap();
        let (entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new());
        let controller = controller(&sessions);
        let marker = entity.install_marker();

        // Session gone with no marker is a failure
        let err = controller
            .check_install_progress("Alpha@ab12", &marker)
            .await
            .unwrap_err();
        assert!(err.contains("exited before installation finished"));

        // The marker landing just before the session exits is success
        std::fs::create_dir_all(&marker).unwrap();
        controller
            .check_install_progress("Alpha@ab12", &marker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminate_fails_when_backend_unreachable() {
        let root = tempdir().unwrap();
        let (mut entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new());
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        entity.set_running(true);
        sessions.set_unreachable(true);

        let err = controller.terminate(&entity).await.unwrap_err();
        assert!(matches!(err, ServerError::Stop(..)));
        assert_eq!(err.kind(), ErrorKind::ProcessControl);

        sessions.set_unreachable(false);
        assert!(sessions.has_session("Alpha@ab12").await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_requires_running() {
        let root = tempdir().unwrap();
        let (entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new());

        let err = controller(&sessions).terminate(&entity).await.unwrap_err();
        assert!(matches!(err, ServerError::NotRunning(_)));

        let lenient = controller(&sessions).with_require_running_to_stop(false);
        lenient.terminate(&entity).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_sends_stop() {
        let root = tempdir().unwrap();
        let (mut entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new());
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        entity.set_running(true);
        controller.terminate(&entity).await.unwrap();

        assert!(controller
            .await_graceful_shutdown(&entity, Duration::from_secs(1), Duration::from_millis(5))
            .await);
        assert_eq!(
            sessions.sent_lines("Alpha@ab12").await.last().map(String::as_str),
            Some("stop")
        );
    }

    #[tokio::test]
    async fn test_graceful_shutdown_gives_up() {
        let root = tempdir().unwrap();
        let (entity, _) = existing_server(&root).await;
        let sessions = Arc::new(InMemorySessions::new().with_stop(StopBehavior::Ignore));
        let controller = controller(&sessions);

        controller.launch(&entity).await.unwrap();
        controller.send_stop("Alpha@ab12").await.unwrap();

        assert!(!controller
            .await_graceful_shutdown(&entity, Duration::from_millis(30), Duration::from_millis(5))
            .await);
        assert!(controller.is_running(&entity).await);
    }
}
