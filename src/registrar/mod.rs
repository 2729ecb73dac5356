//! Native watch registrars.
//!
//! A registrar hands out [`WatchHandle`]s for directories (or whole directory
//! trees) and exposes a blocking [`WatchRegistrar::take`] that yields handles
//! with pending events. The multiplexer in [`crate::watcher`] is the only
//! consumer; it never talks to the operating system directly.
//!
//! ```text
//! register(path, kinds, mode) ──► WatchHandle ──(events)──► ready queue ──► take()
//!                                      ▲                                     │
//!                                      └────────── reset() / cancel() ◄──────┘
//! ```

mod manual;
mod native;
pub(crate) mod queue;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

pub use manual::ManualRegistrar;
pub use native::{NotifyRegistrar, NotifyRegistrarBuilder};

bitflags! {
    /// Set of event kinds a handle reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventKinds: u8 {
        const CREATE = 0b0001;
        const DELETE = 0b0010;
        const MODIFY = 0b0100;
        const OVERFLOW = 0b1000;
    }
}

/// Kind of a single native event.
///
/// There is no rename kind: renames surface as a `Delete` of the old name
/// followed by a `Create` of the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Delete,
    Modify,
    Overflow,
}

impl EventKind {
    /// The flag corresponding to this kind.
    pub fn as_flag(self) -> EventKinds {
        match self {
            EventKind::Create => EventKinds::CREATE,
            EventKind::Delete => EventKinds::DELETE,
            EventKind::Modify => EventKinds::MODIFY,
            EventKind::Overflow => EventKinds::OVERFLOW,
        }
    }
}

/// One event polled from a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// Path relative to the handle's watchable; `None` for overflow.
    pub context: Option<PathBuf>,
}

impl WatchEvent {
    pub fn new(kind: EventKind, context: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            context: Some(context.into()),
        }
    }

    pub fn overflow() -> Self {
        Self {
            kind: EventKind::Overflow,
            context: None,
        }
    }
}

/// Whether a registration covers one directory or the whole tree below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchMode {
    Directory,
    Subtree,
}

/// Identity of a handle, unique within its registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A native subscription to change events of one path.
pub trait WatchHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> HandleId;

    /// The registered path.
    fn watchable(&self) -> &Path;

    fn mode(&self) -> WatchMode;

    /// Retrieve and remove all pending events.
    fn poll_events(&self) -> Vec<WatchEvent>;

    /// Re-arm the handle after its events were processed.
    ///
    /// Returns `false` once the handle is no longer valid (cancelled, or the
    /// watched directory went away). That is terminal.
    fn reset(&self) -> bool;

    /// Release the native resource. Idempotent.
    fn cancel(&self);
}

/// Registrar reported itself closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Watch registrar is closed")]
pub struct RegistrarClosed;

/// Errors from installing a native watch.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("Directory does not exist: {path}")]
    NotFound { path: PathBuf },

    #[error("Not a directory: {path}")]
    NotDirectory { path: PathBuf },

    #[error("Watching {path} is not supported: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("Failed to watch {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch registrar is closed")]
    Closed,
}

impl RegisterError {
    /// Caller errors that must reach the caller unchanged rather than being
    /// absorbed by a fallback strategy.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RegisterError::NotFound { .. } | RegisterError::NotDirectory { .. } | RegisterError::Closed
        )
    }
}

impl From<RegistrarClosed> for RegisterError {
    fn from(_: RegistrarClosed) -> Self {
        RegisterError::Closed
    }
}

/// Source of native watch handles.
pub trait WatchRegistrar: Send + Sync {
    /// Install a watch for `path`.
    fn register(
        &self,
        path: &Path,
        kinds: EventKinds,
        mode: WatchMode,
    ) -> Result<Arc<dyn WatchHandle>, RegisterError>;

    /// Whether [`WatchMode::Subtree`] registrations can be attempted at all.
    fn supports_subtree(&self) -> bool;

    /// Block until a handle has pending events (or became invalid).
    fn take(&self) -> Result<Arc<dyn WatchHandle>, RegistrarClosed>;

    /// Close the registrar, waking any blocked [`take`](Self::take).
    fn close(&self);
}

/// Validate that `path` names an existing directory.
pub(crate) fn check_directory(path: &Path) -> Result<(), RegisterError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(RegisterError::NotDirectory {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RegisterError::NotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(RegisterError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        let path = PathBuf::from("/missing");
        assert!(RegisterError::NotFound { path: path.clone() }.is_caller_error());
        assert!(RegisterError::NotDirectory { path: path.clone() }.is_caller_error());
        assert!(RegisterError::Closed.is_caller_error());
        assert!(
            !RegisterError::Unsupported {
                path: path.clone(),
                reason: "no".to_string()
            }
            .is_caller_error()
        );
        assert!(
            !RegisterError::Io {
                path,
                source: std::io::Error::other("boom")
            }
            .is_caller_error()
        );
    }

    #[test]
    fn test_check_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(check_directory(temp.path()).is_ok());

        let file = temp.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            check_directory(&file),
            Err(RegisterError::NotDirectory { .. })
        ));
        assert!(matches!(
            check_directory(&temp.path().join("nope")),
            Err(RegisterError::NotFound { .. })
        ));
    }

    #[test]
    fn test_kind_flags() {
        assert_eq!(EventKind::Create.as_flag(), EventKinds::CREATE);
        assert_eq!(EventKind::Overflow.as_flag(), EventKinds::OVERFLOW);
        assert!(EventKinds::all().contains(EventKinds::MODIFY | EventKinds::DELETE));
    }
}
