//! The server entity: an in-memory view of one server directory.
//!
//! A [`ServerEntity`] is derived entirely from the name of its directory,
//! `<root>/servers/<name>@<identifier>`. Its fields can only change through
//! [`ServerEntity::refresh`] or registry operations, so an entity never drifts
//! from its backing directory without an explicit write.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::constants::{
    DELIMITER, FORBIDDEN_NAME_CHARS, INSTALL_MARKER_DIR, SERVERS_DIR, SERVER_SUBDIR,
};
use crate::error::{Result, ServerError};
use crate::metadata::{self, ServerRecord};

/// One managed server, existing or not yet created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntity {
    root: PathBuf,
    name: String,
    identifier: Option<String>,
    path: PathBuf,
    exists: bool,
    running: bool,
}

impl ServerEntity {
    /// A not-yet-created server. Its path is `<root>/servers/<name>` until
    /// creation assigns an identifier.
    pub fn placeholder(root: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let root = root.as_ref().to_path_buf();
        let name = name.into();
        let path = servers_dir(&root).join(&name);
        let exists = path.is_dir();

        Self {
            root,
            name,
            identifier: None,
            path,
            exists,
            running: false,
        }
    }

    /// An entity pointing at `<root>/servers/<name>@<identifier>`. Nothing is
    /// read from disk besides the existence check; call [`refresh`](Self::refresh)
    /// to bind the full state.
    pub fn with_identifier(
        root: impl AsRef<Path>,
        name: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        let root = root.as_ref().to_path_buf();
        let name = name.into();
        let identifier = identifier.into();
        let path = servers_dir(&root).join(dir_name(&name, &identifier));
        let exists = path.is_dir();

        Self {
            root,
            name,
            identifier: Some(identifier),
            path,
            exists,
            running: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Last known running state.
    ///
    /// Loaded from `state/state.json` on refresh and updated by registry
    /// start/stop. It is not a live view of the process and can be stale if the
    /// server exits on its own; use `ServerRegistry::sync_running` to reconcile.
    pub fn running(&self) -> bool {
        self.running
    }

    /// Name of the terminal session dedicated to this server, `None` for placeholders.
    pub fn session_name(&self) -> Option<String> {
        self.identifier
            .as_deref()
            .map(|identifier| dir_name(&self.name, identifier))
    }

    /// Working directory handed to the launcher.
    pub fn working_dir(&self) -> PathBuf {
        self.path.join(SERVER_SUBDIR)
    }

    /// Directory the launcher creates once first-run installation completes.
    pub fn install_marker(&self) -> PathBuf {
        self.working_dir().join(INSTALL_MARKER_DIR)
    }

    /// Rebinds the entity to `new_path` and rewrites `server.json`.
    ///
    /// Refreshing an entity that existed against a path that is gone is a
    /// no-op, so a stale refresh after an out-of-band removal leaves the last
    /// known state untouched.
    #[instrument(skip(self), fields(server = %self))]
    pub async fn refresh(&mut self, new_path: impl AsRef<Path> + fmt::Debug) -> Result<()> {
        let new_path = new_path.as_ref();

        if !new_path.is_dir() {
            if self.exists {
                debug!("Skipping stale refresh, {} is gone", new_path.display());
                return Ok(());
            }
            return Err(ServerError::NotFound(new_path.to_path_buf()));
        }

        let servers_dir = servers_dir(&self.root);
        if new_path.parent() != Some(servers_dir.as_path()) {
            return Err(ServerError::NotInServersDir(
                new_path.to_path_buf(),
                servers_dir,
            ));
        }

        let file_name = new_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ServerError::MissingDelimiter(new_path.display().to_string()))?;
        let (name, identifier) = split_dir_name(file_name)
            .ok_or_else(|| ServerError::MissingDelimiter(file_name.to_string()))?;

        self.name = name.to_string();
        self.identifier = Some(identifier.to_string());
        self.path = new_path.to_path_buf();
        self.exists = true;
        self.running = metadata::read_state_record(&self.path)
            .await
            .map(|state| state.running)
            .unwrap_or(false);

        metadata::write_server_record(
            &self.path,
            &ServerRecord {
                name: self.name.clone(),
                id: self.identifier.clone(),
            },
        )
        .await?;

        debug!("Refreshed server {}", self);
        Ok(())
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }
}

impl fmt::Display for ServerEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(identifier) => write!(f, "{}{}{}", self.name, DELIMITER, identifier),
            None => f.write_str(&self.name),
        }
    }
}

/// `<root>/servers`
pub fn servers_dir(root: &Path) -> PathBuf {
    root.join(SERVERS_DIR)
}

/// `<name>@<identifier>`
pub fn dir_name(name: &str, identifier: &str) -> String {
    format!("{name}{DELIMITER}{identifier}")
}

/// Splits a server directory name on the first delimiter.
pub fn split_dir_name(dir_name: &str) -> Option<(&str, &str)> {
    dir_name.split_once(DELIMITER)
}

/// Checks a proposed server name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ServerError::invalid_name(
            name,
            "name cannot be empty or whitespace",
        ));
    }

    if let Some(c) = name
        .chars()
        .find(|c| *c == DELIMITER || FORBIDDEN_NAME_CHARS.contains(c))
    {
        return Err(ServerError::invalid_name(
            name,
            format!("name cannot contain '{c}'"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn make_server_dir(root: &Path, dir: &str) -> PathBuf {
        let path = root.join("servers").join(dir);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn test_placeholder() {
        let root = tempdir().unwrap();
        let entity = ServerEntity::placeholder(root.path(), "Alpha");

        assert_eq!(entity.name(), "Alpha");
        assert_eq!(entity.identifier(), None);
        assert_eq!(entity.path(), root.path().join("servers/Alpha"));
        assert!(!entity.exists());
        assert!(!entity.running());
        assert_eq!(entity.session_name(), None);
        assert_eq!(entity.to_string(), "Alpha");
    }

    #[tokio::test]
    async fn test_refresh_binds_and_writes_record() {
        let root = tempdir().unwrap();
        let path = make_server_dir(root.path(), "Alpha@ab12");

        let mut entity = ServerEntity::placeholder(root.path(), "Alpha");
        entity.refresh(&path).await.unwrap();

        assert!(entity.exists());
        assert_eq!(entity.name(), "Alpha");
        assert_eq!(entity.identifier(), Some("ab12"));
        assert_eq!(entity.path(), path.as_path());
        assert_eq!(entity.session_name().as_deref(), Some("Alpha@ab12"));
        assert_eq!(entity.install_marker(), path.join("server/worlds"));

        let raw = std::fs::read_to_string(path.join("server.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, serde_json::json!({"name": "Alpha", "id": "ab12"}));
    }

    #[tokio::test]
    async fn test_refresh_loads_running_state() {
        let root = tempdir().unwrap();
        let path = make_server_dir(root.path(), "Alpha@ab12");
        std::fs::create_dir(path.join("state")).unwrap();
        std::fs::write(path.join("state/state.json"), r#"{"running": true}"#).unwrap();

        let mut entity = ServerEntity::placeholder(root.path(), "Alpha");
        entity.refresh(&path).await.unwrap();
        assert!(entity.running());
    }

    #[tokio::test]
    async fn test_refresh_missing_path() {
        let root = tempdir().unwrap();
        let mut entity = ServerEntity::placeholder(root.path(), "Alpha");

        let err = entity
            .refresh(root.path().join("servers/Alpha@ab12"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!entity.exists());
    }

    #[tokio::test]
    async fn test_refresh_outside_servers_dir() {
        let root = tempdir().unwrap();
        let stray = root.path().join("elsewhere/Alpha@ab12");
        std::fs::create_dir_all(&stray).unwrap();

        let mut entity = ServerEntity::placeholder(root.path(), "Alpha");
        let err = entity.refresh(&stray).await.unwrap_err();
        assert!(matches!(err, ServerError::NotInServersDir(..)));
        assert_eq!(err.kind(), ErrorKind::PathLayout);
    }

    #[tokio::test]
    async fn test_refresh_without_delimiter() {
        let root = tempdir().unwrap();
        let path = make_server_dir(root.path(), "Alpha");

        let mut entity = ServerEntity::placeholder(root.path(), "Alpha");
        let err = entity.refresh(&path).await.unwrap_err();
        assert!(matches!(err, ServerError::MissingDelimiter(_)));
        assert!(!path.join("server.json").exists());
    }

    #[tokio::test]
    async fn test_stale_refresh_is_noop() {
        let root = tempdir().unwrap();
        let path = make_server_dir(root.path(), "Alpha@ab12");

        let mut entity = ServerEntity::placeholder(root.path(), "Alpha");
        entity.refresh(&path).await.unwrap();
        let before = entity.clone();

        entity
            .refresh(root.path().join("servers/Beta@ab12"))
            .await
            .unwrap();
        assert_eq!(entity, before);
    }

    #[test]
    fn test_with_identifier() {
        let root = tempdir().unwrap();
        make_server_dir(root.path(), "Alpha@ab12");

        let entity = ServerEntity::with_identifier(root.path(), "Alpha", "ab12");
        assert!(entity.exists());
        assert_eq!(entity.to_string(), "Alpha@ab12");

        let missing = ServerEntity::with_identifier(root.path(), "Beta", "cd34");
        assert!(!missing.exists());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Alpha").is_ok());
        assert!(validate_name("My Server 2").is_ok());

        for bad in ["", "  ", "a-b", "a:b", "a/b", "a\\b", "a@b"] {
            let err = validate_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidName, "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_split_dir_name() {
        assert_eq!(split_dir_name("Alpha@ab12"), Some(("Alpha", "ab12")));
        assert_eq!(split_dir_name("Alpha@ab12@x"), Some(("Alpha", "ab12@x")));
        assert_eq!(split_dir_name("Alpha"), None);
    }
}
