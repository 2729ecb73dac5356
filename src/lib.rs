//! Directory change-notification multiplexer.
//!
//! Turns a scarce native watch facility into a shared, many-listener
//! notification service. See [`watcher::WatchService`].

pub mod config;
pub mod logging;
pub mod registrar;
pub mod watcher;

pub use config::Settings;
pub use registrar::{ManualRegistrar, NotifyRegistrar, WatchRegistrar};
pub use watcher::{FileEventListener, ListenerToken, WatchError, WatchService, WatchStats};
