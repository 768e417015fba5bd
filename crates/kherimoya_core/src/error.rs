//! Error types for the server registry and session control

use std::{io::Error as IoError, path::PathBuf, time::Duration};
use thiserror::Error;

/// Failures talking to the terminal multiplexer
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to run {0}: {1}")]
    Spawn(String, IoError),

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Session backend error: {0}")]
    Backend(String),
}

/// Registry, entity and lifecycle errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Server {0} does not exist")]
    DoesNotExist(String),

    #[error("Server {0} is not running")]
    NotRunning(String),

    #[error("Server already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid server name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Path {0} is not inside the servers directory {1}")]
    NotInServersDir(PathBuf, PathBuf),

    #[error("Directory name {0:?} has no name/identifier delimiter")]
    MissingDelimiter(String),

    #[error("Failed to start server {0}: {1}")]
    Start(String, #[source] SessionError),

    #[error("Failed to stop server {0}: {1}")]
    Stop(String, #[source] SessionError),

    #[error("Failed to create server {name}: {reason}")]
    Creation { name: String, reason: String },

    #[error("{operation} did not complete within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("The {0} method is not implemented")]
    UnsupportedMethod(&'static str),

    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] IoError),

    #[error("Failed to write metadata {0}: {1}")]
    Metadata(PathBuf, String),
}

/// Coarse classification of [`ServerError`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidName,
    PathLayout,
    ProcessControl,
    Timeout,
    UnsupportedMethod,
    Io,
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::NotFound(_) | ServerError::DoesNotExist(_) => ErrorKind::NotFound,
            ServerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ServerError::InvalidName { .. } => ErrorKind::InvalidName,
            ServerError::NotInServersDir(..) | ServerError::MissingDelimiter(_) => {
                ErrorKind::PathLayout
            }
            ServerError::NotRunning(_)
            | ServerError::Start(..)
            | ServerError::Stop(..)
            | ServerError::Creation { .. } => ErrorKind::ProcessControl,
            ServerError::Timeout { .. } => ErrorKind::Timeout,
            ServerError::UnsupportedMethod(_) => ErrorKind::UnsupportedMethod,
            ServerError::Io(..) | ServerError::Metadata(..) => ErrorKind::Io,
        }
    }

    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        ServerError::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn creation(name: &str, reason: impl Into<String>) -> Self {
        ServerError::Creation {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ServerError::DoesNotExist("a@b".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ServerError::MissingDelimiter("alpha".into()).kind(),
            ErrorKind::PathLayout
        );
        assert_eq!(
            ServerError::Start("a@b".into(), SessionError::Backend("down".into())).kind(),
            ErrorKind::ProcessControl
        );
        assert_eq!(
            ServerError::UnsupportedMethod("plugin").kind(),
            ErrorKind::UnsupportedMethod
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ServerError::invalid_name("a-b", "contains '-'");
        assert_eq!(err.to_string(), "Invalid server name \"a-b\": contains '-'");

        let err = ServerError::Timeout {
            operation: "Installation",
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Installation did not complete within 5s");
    }
}
