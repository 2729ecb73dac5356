//! Listener registration handle.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::engine::Engine;
use super::entry::{DirectoryWatchEntry, ListenerId};
use super::service::ServiceInner;

pub(crate) struct Registration {
    pub(crate) service: Arc<ServiceInner>,
    pub(crate) engine: Arc<Engine>,
    pub(crate) entry: Arc<DirectoryWatchEntry>,
    pub(crate) id: ListenerId,
}

/// Handle to one listener registration.
///
/// Call [`ListenerToken::remove`] to stop notifications. A token that is
/// simply dropped is removed in the background by the service's reaper.
/// While any token is alive its service stays alive too.
#[must_use = "dropping a ListenerToken unregisters the listener"]
pub struct ListenerToken {
    registration: Option<Registration>,
}

impl ListenerToken {
    pub(crate) fn new(registration: Registration) -> Self {
        Self {
            registration: Some(registration),
        }
    }

    /// The watched directory.
    pub fn path(&self) -> &Path {
        match &self.registration {
            Some(r) => r.entry.path(),
            None => Path::new(""),
        }
    }

    /// Whether events arrive through a shared subtree watch.
    pub fn is_subtree(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|r| r.entry.is_subtree())
    }

    /// Remove the listener.
    ///
    /// Events already reported by the native watcher are delivered first. A
    /// callback that was already running on the dispatch pool may still
    /// complete after this returns.
    pub fn remove(mut self) {
        if let Some(r) = self.registration.take() {
            r.engine.remove_listener(&r.entry, r.id);
            r.service.reaper().untrack();
        }
    }

    pub(crate) fn take_registration(&mut self) -> Option<Registration> {
        self.registration.take()
    }

    pub(crate) fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        if let Some(r) = self.registration.take() {
            let reaper = Arc::clone(r.service.reaper());
            reaper.submit(Box::new(move || {
                r.engine.remove_listener(&r.entry, r.id);
            }));
        }
    }
}

impl fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerToken")
            .field("path", &self.path())
            .field("removed", &self.registration.is_none())
            .finish()
    }
}
