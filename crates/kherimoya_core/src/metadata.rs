//! Metadata records written into server directories.
//!
//! These files are a write-mostly sink for other tools; the registry itself only
//! ever reads back the running state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};
use tracing::debug;

use crate::constants::{SERVER_RECORD_FILE, STATE_RECORD_FILE, STATE_SUBDIR, TYPE_RECORD_FILE};
use crate::error::{Result, ServerError};

/// Contents of `server.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    pub id: Option<String>,
}

/// Contents of `state/state.json`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub running: bool,
}

/// How a server was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Launched through the Python launcher inside a terminal session
    Python,
    /// Container-based servers; not implemented
    Docker,
}

/// Contents of `kherimoya.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRecord {
    #[serde(rename = "type")]
    pub kind: ServerKind,
}

pub fn server_record_path(server_dir: &Path) -> PathBuf {
    server_dir.join(SERVER_RECORD_FILE)
}

pub fn state_record_path(server_dir: &Path) -> PathBuf {
    server_dir.join(STATE_SUBDIR).join(STATE_RECORD_FILE)
}

pub fn type_record_path(server_dir: &Path) -> PathBuf {
    server_dir.join(TYPE_RECORD_FILE)
}

pub async fn write_server_record(server_dir: &Path, record: &ServerRecord) -> Result<()> {
    write_json(&server_record_path(server_dir), record).await
}

pub async fn write_state_record(server_dir: &Path, record: StateRecord) -> Result<()> {
    write_json(&state_record_path(server_dir), &record).await
}

/// Reads the running state; a missing or malformed file reads as `None`.
pub async fn read_state_record(server_dir: &Path) -> Option<StateRecord> {
    let path = state_record_path(server_dir);
    let contents = tokio_fs::read_to_string(&path).await.ok()?;
    match serde_json::from_str(&contents) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!("Ignoring unreadable state record {}: {}", path.display(), e);
            None
        }
    }
}

pub async fn write_type_record(server_dir: &Path, kind: ServerKind) -> Result<()> {
    let path = type_record_path(server_dir);
    let yaml = serde_yaml::to_string(&TypeRecord { kind })
        .map_err(|e| ServerError::Metadata(path.clone(), e.to_string()))?;
    write_atomically(&path, yaml.as_bytes()).await
}

/// Serializes `value` as pretty JSON and replaces `path` with it.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ServerError::Metadata(path.to_path_buf(), e.to_string()))?;
    write_atomically(path, json.as_bytes()).await
}

async fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = tokio_fs::File::create(&temp_path)
        .await
        .map_err(|e| ServerError::Io(temp_path.clone(), e))?;

    file.write_all(contents)
        .await
        .map_err(|e| ServerError::Io(temp_path.clone(), e))?;

    file.sync_all()
        .await
        .map_err(|e| ServerError::Io(temp_path.clone(), e))?;

    tokio_fs::rename(&temp_path, path)
        .await
        .map_err(|e| ServerError::Io(path.to_path_buf(), e))?;

    debug!("Wrote {}", path.display());
    Ok(())
}
