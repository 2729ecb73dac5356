//! Error types for the watch service.

use std::path::PathBuf;
use thiserror::Error;

use crate::registrar::RegisterError;

/// Errors from watch service operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("No watcher available: {reason}")]
    Unavailable { reason: String },

    #[error("Directory does not exist: {path}")]
    NotFound { path: PathBuf },

    #[error("Not a directory: {path}")]
    NotDirectory { path: PathBuf },

    #[error("Watched path must be absolute: {path}")]
    RelativePath { path: PathBuf },

    #[error("Cannot watch path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot watch path {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("Listener token was not issued by this watch service")]
    ForeignToken,

    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch service is shut down")]
    Closed,
}

impl From<RegisterError> for WatchError {
    fn from(e: RegisterError) -> Self {
        match e {
            RegisterError::NotFound { path } => WatchError::NotFound { path },
            RegisterError::NotDirectory { path } => WatchError::NotDirectory { path },
            RegisterError::Unsupported { path, reason } => WatchError::Unsupported { path, reason },
            RegisterError::Io { path, source } => WatchError::Io { path, source },
            RegisterError::Closed => WatchError::Closed,
        }
    }
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::Unavailable {
            reason: e.to_string(),
        }
    }
}
