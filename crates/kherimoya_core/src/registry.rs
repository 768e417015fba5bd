//! The server registry.
//!
//! [`ServerRegistry`] is the entry point for managing servers under a root
//! directory. It keeps no index in memory: every query rescans
//! `<root>/servers`, so the directory tree is always the source of truth.
//!
//! The registry assumes a single writer. Name uniqueness and identifier
//! collision checks are read-then-act, and only the non-recursive `mkdir`
//! during creation is atomic, so two processes mutating the same root at the
//! same time can race. [`ServerRegistry::resolve_conflicts`] repairs duplicate
//! identifiers after the fact.

use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs as tokio_fs;
use tracing::{debug, info, instrument, warn};

use crate::config::RegistryConfig;
use crate::constants::SKELETON_SUBDIRS;
use crate::entity::{dir_name, servers_dir, split_dir_name, validate_name, ServerEntity};
use crate::error::{ErrorKind, Result, ServerError};
use crate::ident::IdentifierAllocator;
use crate::metadata::{self, ServerKind, StateRecord};
use crate::session::SessionController;

/// How a server process is started and stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMethod {
    /// Through the server's terminal session
    #[default]
    Tmux,
    /// Through the Kherimoya plugin; not implemented
    Plugin,
}

/// The server to create: a bare name or a placeholder entity.
#[derive(Debug, Clone)]
pub enum NewServer {
    Name(String),
    Placeholder(ServerEntity),
}

impl From<&str> for NewServer {
    fn from(name: &str) -> Self {
        NewServer::Name(name.to_string())
    }
}

impl From<String> for NewServer {
    fn from(name: String) -> Self {
        NewServer::Name(name)
    }
}

impl From<ServerEntity> for NewServer {
    fn from(entity: ServerEntity) -> Self {
        NewServer::Placeholder(entity)
    }
}

/// Manages the servers under one root directory.
#[derive(Debug)]
pub struct ServerRegistry {
    root: PathBuf,
    config: RegistryConfig,
    sessions: SessionController,
    allocator: IdentifierAllocator,
}

impl ServerRegistry {
    /// The controller's stop policy is overridden by
    /// `config.require_running_to_stop`.
    pub fn new(
        root: impl AsRef<Path>,
        config: RegistryConfig,
        sessions: SessionController,
    ) -> Self {
        let sessions = sessions.with_require_running_to_stop(config.require_running_to_stop);
        Self {
            root: root.as_ref().to_path_buf(),
            config,
            sessions,
            allocator: IdentifierAllocator::default(),
        }
    }

    /// Replaces the identifier allocator.
    pub fn with_allocator(mut self, allocator: IdentifierAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn servers_dir(&self) -> PathBuf {
        servers_dir(&self.root)
    }

    pub fn strict_names(&self) -> bool {
        self.config.strict_names
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionController {
        &self.sessions
    }

    /// A not-yet-created server under this registry's root.
    pub fn placeholder(&self, name: impl Into<String>) -> ServerEntity {
        ServerEntity::placeholder(&self.root, name)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// `(name, identifier)` for every server directory, in directory order.
    pub async fn list_pairs(&self) -> Result<Vec<(String, String)>> {
        let servers_dir = self.servers_dir();
        let mut entries = match tokio_fs::read_dir(&servers_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerError::Io(servers_dir, e)),
        };

        let mut pairs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServerError::Io(servers_dir.clone(), e))?
        {
            let is_dir = match entry.file_type().await {
                Ok(file_type) => file_type.is_dir(),
                Err(e) => {
                    debug!("Skipping {}: {}", entry.path().display(), e);
                    false
                }
            };
            if !is_dir {
                continue;
            }

            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                debug!("Skipping non UTF-8 directory {}", entry.path().display());
                continue;
            };
            if let Some((name, identifier)) = split_dir_name(file_name) {
                pairs.push((name.to_string(), identifier.to_string()));
            }
        }

        Ok(pairs)
    }

    pub async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self
            .list_pairs()
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    pub async fn list_identifiers(&self) -> Result<Vec<String>> {
        Ok(self
            .list_pairs()
            .await?
            .into_iter()
            .map(|(_, identifier)| identifier)
            .collect())
    }

    /// Every server as a refreshed entity. Servers that fail to refresh, for
    /// example because their directory vanished mid-scan, are left out.
    pub async fn list_entities(&self) -> Result<Vec<ServerEntity>> {
        let servers_dir = self.servers_dir();
        let mut entities = Vec::new();

        for (name, identifier) in self.list_pairs().await? {
            let mut entity = self.placeholder(name.as_str());
            let path = servers_dir.join(dir_name(&name, &identifier));
            match entity.refresh(&path).await {
                Ok(()) => entities.push(entity),
                Err(e) => debug!("Dropping {} from listing: {}", path.display(), e),
            }
        }

        Ok(entities)
    }

    /// Case-insensitive lookup by identifier.
    pub async fn find_by_id(&self, identifier: &str) -> Result<Option<ServerEntity>> {
        let wanted = identifier.to_lowercase();
        Ok(self.list_entities().await?.into_iter().find(|entity| {
            entity
                .identifier()
                .is_some_and(|id| id.to_lowercase() == wanted)
        }))
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    /// Creates a server with the launcher and waits for its first-run install.
    ///
    /// `install_timeout` of `None` waits indefinitely; callers wanting the
    /// configured default pass `config().install_timeout`.
    pub async fn create(
        &self,
        server: impl Into<NewServer>,
        install_timeout: Option<Duration>,
    ) -> Result<ServerEntity> {
        self.create_with_kind(server, ServerKind::Python, install_timeout)
            .await
    }

    /// [`create`](Self::create) with an explicit creation method.
    #[instrument(skip(self, server))]
    pub async fn create_with_kind(
        &self,
        server: impl Into<NewServer>,
        kind: ServerKind,
        install_timeout: Option<Duration>,
    ) -> Result<ServerEntity> {
        let mut entity = match server.into() {
            NewServer::Name(name) => self.placeholder(name),
            NewServer::Placeholder(entity) => entity,
        };

        // Everything up to the identifier is validation; nothing touches disk.
        validate_name(entity.name())?;
        if entity.root() != self.root.as_path() {
            return Err(ServerError::NotInServersDir(
                entity.path().to_path_buf(),
                self.servers_dir(),
            ));
        }
        if entity.exists() {
            return Err(ServerError::AlreadyExists(entity.to_string()));
        }
        let pairs = self.list_pairs().await?;
        if self.config.strict_names && pairs.iter().any(|(name, _)| name == entity.name()) {
            return Err(ServerError::AlreadyExists(format!(
                "a server named {} already exists and strict names are enabled",
                entity.name()
            )));
        }
        if kind == ServerKind::Docker {
            return Err(ServerError::UnsupportedMethod("docker"));
        }

        let identifier = self
            .allocator
            .allocate(pairs.iter().map(|(_, identifier)| identifier));
        let base_path = self
            .servers_dir()
            .join(dir_name(entity.name(), &identifier));

        self.make_skeleton(&base_path).await?;

        match self.install(&mut entity, &base_path, kind, install_timeout).await {
            Ok(()) => {
                info!("Created server {}", entity);
                Ok(entity)
            }
            Err(e) => {
                warn!("Creating {} failed, removing {}", entity.name(), base_path.display());
                self.sessions
                    .kill_quietly(&dir_name(entity.name(), &identifier))
                    .await;
                remove_tree_quietly(&base_path).await;
                Err(match e.kind() {
                    ErrorKind::Timeout => e,
                    _ if matches!(e, ServerError::Creation { .. }) => e,
                    _ => ServerError::creation(entity.name(), e.to_string()),
                })
            }
        }
    }

    /// Creates the server directory and its fixed subdirectories. A directory
    /// already at `base_path` is an error, never reused.
    async fn make_skeleton(&self, base_path: &Path) -> Result<()> {
        let servers_dir = self.servers_dir();
        tokio_fs::create_dir_all(&servers_dir)
            .await
            .map_err(|e| ServerError::Io(servers_dir, e))?;

        tokio_fs::create_dir(base_path).await.map_err(|e| {
            if e.kind() == IoErrorKind::AlreadyExists {
                ServerError::AlreadyExists(base_path.display().to_string())
            } else {
                ServerError::Io(base_path.to_path_buf(), e)
            }
        })?;

        for subdir in SKELETON_SUBDIRS {
            let path = base_path.join(subdir);
            if let Err(e) = tokio_fs::create_dir(&path).await {
                remove_tree_quietly(base_path).await;
                return Err(ServerError::Io(path, e));
            }
        }

        Ok(())
    }

    /// Everything after the skeleton exists. Any error here leaves cleanup to
    /// the caller.
    async fn install(
        &self,
        entity: &mut ServerEntity,
        base_path: &Path,
        kind: ServerKind,
        install_timeout: Option<Duration>,
    ) -> Result<()> {
        entity.refresh(base_path).await?;

        let session = entity
            .session_name()
            .ok_or_else(|| ServerError::creation(entity.name(), "no identifier after refresh"))?;

        self.sessions.launch(entity).await?;
        self.sessions.await_installation(entity, install_timeout).await?;

        tokio::time::sleep(self.config.settle_delay).await;

        self.sessions.send_stop(&session).await?;
        let polling = self.sessions.polling();
        let exited = self
            .sessions
            .await_graceful_shutdown(
                entity,
                polling.shutdown_timeout,
                polling.shutdown_poll_interval,
            )
            .await;
        if !exited {
            self.sessions.kill_quietly(&session).await;
            if self.sessions.session_present(&session).await {
                return Err(ServerError::creation(
                    entity.name(),
                    format!("failed to stop session {session}"),
                ));
            }
        }

        metadata::write_state_record(base_path, StateRecord { running: false }).await?;
        metadata::write_type_record(base_path, kind).await?;
        entity.set_running(false);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Removes the server's directory tree. Does not stop the server first.
    #[instrument(skip(self, entity), fields(server = %entity))]
    pub async fn delete(&self, entity: ServerEntity) -> Result<()> {
        if !entity.exists() {
            return Err(ServerError::NotFound(entity.path().to_path_buf()));
        }

        tokio_fs::remove_dir_all(entity.path())
            .await
            .map_err(|e| ServerError::Io(entity.path().to_path_buf(), e))?;

        info!("Deleted server {}", entity);
        Ok(())
    }

    /// Renames a server, keeping its identifier.
    #[instrument(skip(self, entity), fields(server = %entity))]
    pub async fn rename(&self, entity: &mut ServerEntity, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        if !entity.exists() {
            return Err(ServerError::DoesNotExist(entity.to_string()));
        }
        let identifier = entity
            .identifier()
            .ok_or_else(|| ServerError::DoesNotExist(entity.to_string()))?
            .to_string();

        if self.config.strict_names {
            let taken = self
                .list_pairs()
                .await?
                .into_iter()
                .any(|(name, id)| name == new_name && id != identifier);
            if taken {
                return Err(ServerError::AlreadyExists(format!(
                    "a server named {new_name} already exists and strict names are enabled"
                )));
            }
        }

        let new_path = self.servers_dir().join(dir_name(new_name, &identifier));
        if new_path == entity.path() {
            return Ok(());
        }
        if new_path.exists() {
            return Err(ServerError::AlreadyExists(new_path.display().to_string()));
        }

        let old_name = entity.to_string();
        tokio_fs::rename(entity.path(), &new_path)
            .await
            .map_err(|e| ServerError::Io(entity.path().to_path_buf(), e))?;
        entity.refresh(&new_path).await?;

        info!("Renamed server {} to {}", old_name, entity);
        Ok(())
    }

    /// Gives every server with a duplicate identifier a fresh one.
    ///
    /// The first server seen with an identifier keeps it. Returns whether any
    /// duplicate was found. Servers that cannot be renamed are skipped.
    #[instrument(skip(self))]
    pub async fn resolve_conflicts(&self) -> Result<bool> {
        // Includes directories that fail to refresh.
        let mut known: HashSet<String> = self
            .list_identifiers()
            .await?
            .into_iter()
            .map(|identifier| identifier.to_lowercase())
            .collect();
        let entities = self.list_entities().await?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut found = false;

        for mut entity in entities {
            let Some(identifier) = entity.identifier().map(str::to_lowercase) else {
                continue;
            };
            if seen.insert(identifier) {
                continue;
            }

            found = true;
            let fresh = self.allocator.allocate(&known);
            let new_path = self.servers_dir().join(dir_name(entity.name(), &fresh));
            let old_name = entity.to_string();

            if new_path.exists() {
                warn!(
                    "Not moving {}: {} already exists",
                    old_name,
                    new_path.display()
                );
                continue;
            }
            if let Err(e) = tokio_fs::rename(entity.path(), &new_path).await {
                warn!("Could not move {} to resolve a conflict: {}", old_name, e);
                continue;
            }
            if let Err(e) = entity.refresh(&new_path).await {
                warn!("Could not refresh {} after resolving a conflict: {}", old_name, e);
            }

            info!("Resolved identifier conflict: {} is now {}", old_name, entity);
            known.insert(fresh.clone());
            seen.insert(fresh);
        }

        Ok(found)
    }

    // ------------------------------------------------------------------------
    // Process control
    // ------------------------------------------------------------------------

    /// Starts the server and records it as running.
    pub async fn start(&self, entity: &mut ServerEntity, method: ControlMethod) -> Result<()> {
        match method {
            ControlMethod::Tmux => {
                self.sessions.launch(entity).await?;
                self.record_running(entity, true).await
            }
            ControlMethod::Plugin => Err(ServerError::UnsupportedMethod("plugin")),
        }
    }

    /// Asks the server to stop and records it as stopped.
    pub async fn stop(&self, entity: &mut ServerEntity, method: ControlMethod) -> Result<()> {
        match method {
            ControlMethod::Tmux => {
                self.sessions.terminate(entity).await?;
                self.record_running(entity, false).await
            }
            ControlMethod::Plugin => Err(ServerError::UnsupportedMethod("plugin")),
        }
    }

    /// Live check of whether the server's session exists.
    pub async fn is_running(&self, entity: &ServerEntity) -> bool {
        self.sessions.is_running(entity).await
    }

    /// Replaces the entity's last known running state with the live one and
    /// persists it.
    pub async fn sync_running(&self, entity: &mut ServerEntity) -> Result<bool> {
        if !entity.exists() {
            return Err(ServerError::DoesNotExist(entity.to_string()));
        }
        let running = self.sessions.is_running(entity).await;
        if running != entity.running() {
            debug!("Running state of {} was stale, now {}", entity, running);
        }
        self.record_running(entity, running).await?;
        Ok(running)
    }

    async fn record_running(&self, entity: &mut ServerEntity, running: bool) -> Result<()> {
        metadata::write_state_record(entity.path(), StateRecord { running }).await?;
        entity.set_running(running);
        Ok(())
    }
}

async fn remove_tree_quietly(path: &Path) {
    if let Err(e) = tokio_fs::remove_dir_all(path).await {
        warn!("Failed to clean up {}: {}", path.display(), e);
    }
}
