//! Directory change-notification multiplexer.
//!
//! Many listeners, few native watches. Listeners are registered per
//! directory; directories below the same root-level directory share one
//! subtree watch when the registrar supports it, otherwise each directory
//! gets one direct watch shared by all of its listeners.
//!
//! # Architecture
//!
//! ```text
//! WatchService ── add_listener ──► Engine ──► PathRegistry (path -> entry)
//!                                    │           │
//!                                    │      SubtreeWatch (anchor -> entries)
//!                                    ▼
//!                        engine thread: registrar.take()
//!                                    │ translate
//!                                    ▼
//!                     DirectoryWatchEntry.pending (PendingEvents)
//!                                    │ single-flight drain
//!                                    ▼
//!                     WorkerPool ──► FileEventListener callbacks
//! ```
//!
//! Dropped [`ListenerToken`]s are removed by a background reaper thread.

mod engine;
mod entry;
mod error;
mod listener;
mod path_registry;
mod pending;
mod pool;
mod reaper;
mod service;
mod subtree;
mod token;

pub use error::WatchError;
pub use listener::FileEventListener;
pub use path_registry::{normalize_path, subtree_anchor};
pub use service::{RegistrarFactory, WatchService, WatchStats};
pub use token::ListenerToken;
