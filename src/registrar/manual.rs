//! In-process registrar driven by explicit calls.
//!
//! No operating system resources are involved: events are injected with
//! [`ManualRegistrar::emit`] and friends. Used to exercise the multiplexer
//! deterministically and to simulate platforms with or without subtree
//! support.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::queue::{QueuedHandle, ReadyQueue};
use super::{
    EventKind, EventKinds, HandleId, RegisterError, RegistrarClosed, WatchEvent, WatchHandle,
    WatchMode, WatchRegistrar,
};

const DEFAULT_EVENT_CAPACITY: usize = 512;

struct ManualShared {
    handles: Mutex<Vec<Arc<QueuedHandle>>>,
    missing: Mutex<HashSet<PathBuf>>,
    ready: Arc<ReadyQueue>,
    next_id: AtomicU64,
    subtree: bool,
    reject_subtree: bool,
    capacity: usize,
    registrations: AtomicUsize,
    cancellations: AtomicUsize,
}

impl ManualShared {
    fn covering(&self, file: &Path) -> Vec<(Arc<QueuedHandle>, PathBuf)> {
        self.handles
            .lock()
            .iter()
            .filter_map(|h| h.relative_context(file).map(|rel| (Arc::clone(h), rel)))
            .collect()
    }

    fn rooted_at(&self, root: &Path) -> Vec<Arc<QueuedHandle>> {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.watchable() == root)
            .cloned()
            .collect()
    }

    fn handle_cancelled(&self, handle: &QueuedHandle) {
        self.handles.lock().retain(|h| h.id() != handle.id());
        self.cancellations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scriptable [`WatchRegistrar`].
#[derive(Clone)]
pub struct ManualRegistrar {
    shared: Arc<ManualShared>,
}

impl ManualRegistrar {
    /// Registrar that accepts subtree registrations.
    pub fn new() -> Self {
        Self::build(true, false, DEFAULT_EVENT_CAPACITY)
    }

    /// Registrar without subtree support; every watch is per directory.
    pub fn without_subtree() -> Self {
        Self::build(false, false, DEFAULT_EVENT_CAPACITY)
    }

    /// Registrar that advertises subtree support but rejects every subtree
    /// registration as unsupported.
    pub fn rejecting_subtree() -> Self {
        Self::build(true, true, DEFAULT_EVENT_CAPACITY)
    }

    /// Same registrar configuration with a different per-handle event buffer.
    pub fn with_event_capacity(self, capacity: usize) -> Self {
        Self::build(self.shared.subtree, self.shared.reject_subtree, capacity)
    }

    fn build(subtree: bool, reject_subtree: bool, capacity: usize) -> Self {
        Self {
            shared: Arc::new(ManualShared {
                handles: Mutex::new(Vec::new()),
                missing: Mutex::new(HashSet::new()),
                ready: Arc::new(ReadyQueue::new()),
                next_id: AtomicU64::new(1),
                subtree,
                reject_subtree,
                capacity,
                registrations: AtomicUsize::new(0),
                cancellations: AtomicUsize::new(0),
            }),
        }
    }

    /// Make registrations of `path` fail as if the directory did not exist.
    pub fn mark_missing(&self, path: impl Into<PathBuf>) {
        self.shared.missing.lock().insert(path.into());
    }

    /// Report a change of `file` to every handle covering it.
    ///
    /// Returns the number of handles that received the event.
    pub fn emit(&self, file: impl AsRef<Path>, kind: EventKind) -> usize {
        let targets = self.shared.covering(file.as_ref());
        for (handle, rel) in &targets {
            handle.push(WatchEvent::new(kind, rel.clone()));
        }
        targets.len()
    }

    /// Report a rename as the delete + create pair native watchers produce.
    pub fn emit_rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) {
        self.emit(from, EventKind::Delete);
        self.emit(to, EventKind::Create);
    }

    /// Signal an event buffer overflow on the handles registered at `root`.
    pub fn overflow(&self, root: impl AsRef<Path>) -> usize {
        let targets = self.shared.rooted_at(root.as_ref());
        for handle in &targets {
            handle.push(WatchEvent::overflow());
        }
        targets.len()
    }

    /// Invalidate the handles registered at `root`, as if the directory was
    /// removed.
    pub fn invalidate(&self, root: impl AsRef<Path>) -> usize {
        let targets = self.shared.rooted_at(root.as_ref());
        for handle in &targets {
            handle.invalidate();
        }
        targets.len()
    }

    /// Total number of successful registrations.
    pub fn registrations(&self) -> usize {
        self.shared.registrations.load(Ordering::SeqCst)
    }

    /// Total number of cancelled handles.
    pub fn cancellations(&self) -> usize {
        self.shared.cancellations.load(Ordering::SeqCst)
    }

    /// Handles that are registered and not cancelled.
    pub fn active_handles(&self) -> Vec<(PathBuf, WatchMode)> {
        self.shared
            .handles
            .lock()
            .iter()
            .map(|h| (h.watchable().to_path_buf(), h.mode()))
            .collect()
    }

    pub fn active_handle_count(&self) -> usize {
        self.shared.handles.lock().len()
    }
}

impl Default for ManualRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRegistrar for ManualRegistrar {
    fn register(
        &self,
        path: &Path,
        kinds: EventKinds,
        mode: WatchMode,
    ) -> Result<Arc<dyn WatchHandle>, RegisterError> {
        let shared = &self.shared;
        if shared.ready.is_closed() {
            return Err(RegisterError::Closed);
        }
        if shared.missing.lock().contains(path) {
            return Err(RegisterError::NotFound {
                path: path.to_path_buf(),
            });
        }
        if mode == WatchMode::Subtree && (!shared.subtree || shared.reject_subtree) {
            return Err(RegisterError::Unsupported {
                path: path.to_path_buf(),
                reason: "subtree watching rejected".to_string(),
            });
        }

        let weak: Weak<ManualShared> = Arc::downgrade(shared);
        let handle = QueuedHandle::new(
            HandleId(shared.next_id.fetch_add(1, Ordering::Relaxed)),
            path.to_path_buf(),
            mode,
            kinds,
            shared.capacity,
            Arc::clone(&shared.ready),
            Box::new(move |h| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_cancelled(h);
                }
            }),
        );
        shared.handles.lock().push(Arc::clone(&handle));
        shared.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn supports_subtree(&self) -> bool {
        self.shared.subtree
    }

    fn take(&self) -> Result<Arc<dyn WatchHandle>, RegistrarClosed> {
        let handle: Arc<dyn WatchHandle> = self.shared.ready.take()?;
        Ok(handle)
    }

    fn close(&self) {
        self.shared.ready.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_emit() {
        let registrar = ManualRegistrar::new();
        let handle = registrar
            .register(Path::new("/a/b"), EventKinds::all(), WatchMode::Directory)
            .unwrap();
        assert_eq!(registrar.registrations(), 1);
        assert_eq!(registrar.active_handle_count(), 1);

        assert_eq!(registrar.emit("/a/b/f.txt", EventKind::Create), 1);
        assert_eq!(registrar.emit("/a/c/f.txt", EventKind::Create), 0);

        let ready = registrar.take().unwrap();
        assert_eq!(ready.id(), handle.id());
        assert_eq!(
            ready.poll_events(),
            vec![WatchEvent::new(EventKind::Create, "f.txt")]
        );

        handle.cancel();
        assert_eq!(registrar.cancellations(), 1);
        assert_eq!(registrar.active_handle_count(), 0);
    }

    #[test]
    fn test_subtree_switches() {
        let plain = ManualRegistrar::without_subtree();
        assert!(!plain.supports_subtree());
        assert!(matches!(
            plain.register(Path::new("/a"), EventKinds::all(), WatchMode::Subtree),
            Err(RegisterError::Unsupported { .. })
        ));

        let rejecting = ManualRegistrar::rejecting_subtree();
        assert!(rejecting.supports_subtree());
        assert!(
            rejecting
                .register(Path::new("/a"), EventKinds::all(), WatchMode::Subtree)
                .is_err()
        );
        assert!(
            rejecting
                .register(Path::new("/a"), EventKinds::all(), WatchMode::Directory)
                .is_ok()
        );
    }

    #[test]
    fn test_subtree_emit_reaches_nested_paths() {
        let registrar = ManualRegistrar::new();
        registrar
            .register(Path::new("/a"), EventKinds::all(), WatchMode::Subtree)
            .unwrap();
        assert_eq!(registrar.emit("/a/b/c/f.txt", EventKind::Modify), 1);
        let ready = registrar.take().unwrap();
        assert_eq!(
            ready.poll_events(),
            vec![WatchEvent::new(EventKind::Modify, "b/c/f.txt")]
        );
    }

    #[test]
    fn test_missing_and_closed() {
        let registrar = ManualRegistrar::new();
        registrar.mark_missing("/gone");
        assert!(matches!(
            registrar.register(Path::new("/gone"), EventKinds::all(), WatchMode::Directory),
            Err(RegisterError::NotFound { .. })
        ));

        registrar.close();
        assert!(registrar.take().is_err());
        assert!(matches!(
            registrar.register(Path::new("/a"), EventKinds::all(), WatchMode::Directory),
            Err(RegisterError::Closed)
        ));
    }
}
