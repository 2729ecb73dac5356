//! Per-directory watch entry: the unit of listener fan-out.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::registrar::{HandleId, WatchHandle};

use super::listener::FileEventListener;
use super::pending::PendingEvents;
use super::pool::WorkerPool;

/// Identity of one registration, unique within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(pub(crate) u64);

#[derive(Clone)]
pub(crate) struct ListenerSlot {
    pub(crate) id: ListenerId,
    pub(crate) listener: Arc<dyn FileEventListener>,
}

impl ListenerSlot {
    pub(crate) fn new(id: ListenerId, listener: Arc<dyn FileEventListener>) -> Self {
        Self { id, listener }
    }
}

/// Queued call to every listener of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenerCall {
    Changed(String),
    EventsMissed,
    /// Terminal. Empties the listener list so the entry can never be reused.
    Abandoned,
}

/// Outcome of removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    NotFound,
    Remaining,
    /// The last listener was removed; the caller owns the teardown.
    Drained,
}

/// Compare-and-swap loop over an immutable list.
///
/// `f` returns `None` to leave the list untouched. Returns the previous and
/// the installed list when a swap happened.
pub(crate) fn update_list<T: Clone>(
    cell: &ArcSwap<Vec<T>>,
    mut f: impl FnMut(&[T]) -> Option<Vec<T>>,
) -> Option<(Arc<Vec<T>>, Arc<Vec<T>>)> {
    let mut current = cell.load_full();
    loop {
        let next = Arc::new(f(&current)?);
        let prev = cell.compare_and_swap(&current, Arc::clone(&next));
        if Arc::ptr_eq(&*prev, &current) {
            return Some((current, next));
        }
        current = Arc::clone(&*prev);
    }
}

/// Listener set plus event queue for one watched directory.
///
/// An entry is created with its first listener. Once the listener list is
/// empty the entry is torn down and rejects new listeners.
pub(crate) struct DirectoryWatchEntry {
    path: PathBuf,
    /// Anchor of the shared subtree watch, `None` for a direct watch.
    anchor: Option<PathBuf>,
    handle: Arc<dyn WatchHandle>,
    listeners: ArcSwap<Vec<ListenerSlot>>,
    pending: Arc<PendingEvents<ListenerCall>>,
    pool: Arc<WorkerPool>,
}

impl DirectoryWatchEntry {
    pub(crate) fn new(
        path: PathBuf,
        anchor: Option<PathBuf>,
        handle: Arc<dyn WatchHandle>,
        pool: Arc<WorkerPool>,
        first: ListenerSlot,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            anchor,
            handle,
            listeners: ArcSwap::from_pointee(vec![first]),
            pending: Arc::new(PendingEvents::new()),
            pool,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn anchor(&self) -> Option<&Path> {
        self.anchor.as_deref()
    }

    pub(crate) fn is_subtree(&self) -> bool {
        self.anchor.is_some()
    }

    pub(crate) fn handle(&self) -> &Arc<dyn WatchHandle> {
        &self.handle
    }

    pub(crate) fn handle_id(&self) -> HandleId {
        self.handle.id()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.listeners.load().is_empty()
    }

    /// Append a listener unless the entry is already torn down.
    pub(crate) fn try_add(&self, slot: ListenerSlot) -> bool {
        update_list(&self.listeners, |current| {
            if current.is_empty() {
                return None;
            }
            let mut next = current.to_vec();
            next.push(slot.clone());
            Some(next)
        })
        .is_some()
    }

    pub(crate) fn remove(&self, id: ListenerId) -> Removal {
        let swapped = update_list(&self.listeners, |current| {
            if !current.iter().any(|s| s.id == id) {
                return None;
            }
            Some(current.iter().filter(|s| s.id != id).cloned().collect())
        });
        match swapped {
            None => Removal::NotFound,
            Some((_, next)) if next.is_empty() => Removal::Drained,
            Some(_) => Removal::Remaining,
        }
    }

    pub(crate) fn enqueue(&self, call: ListenerCall) {
        self.pending.push(call);
    }

    /// Schedule delivery of queued calls on the pool.
    pub(crate) fn dispatch(self: &Arc<Self>) {
        let entry = Arc::clone(self);
        self.pending
            .dispatch(&self.pool, move |call| entry.deliver(call));
    }

    /// Deliver queued calls on the calling thread unless a drain is in flight.
    pub(crate) fn deliver_pending(&self) {
        self.pending.drain_if_idle(|call| self.deliver(call));
    }

    fn deliver(&self, call: ListenerCall) {
        match call {
            ListenerCall::Changed(name) => {
                for slot in self.listeners.load().iter() {
                    guarded(&self.path, || slot.listener.changed(&name));
                }
            }
            ListenerCall::EventsMissed => {
                for slot in self.listeners.load().iter() {
                    guarded(&self.path, || slot.listener.events_missed());
                }
            }
            ListenerCall::Abandoned => {
                let abandoned = self.listeners.swap(Arc::new(Vec::new()));
                for slot in abandoned.iter() {
                    guarded(&self.path, || slot.listener.listener_abandoned());
                }
            }
        }
    }
}

impl fmt::Debug for DirectoryWatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatchEntry")
            .field("path", &self.path)
            .field("anchor", &self.anchor)
            .field("handle", &self.handle.id())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn guarded(path: &Path, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("[watcher] listener panicked for {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::{EventKinds, ManualRegistrar, WatchMode, WatchRegistrar};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl FileEventListener for Recorder {
        fn changed(&self, name: &str) {
            self.calls.lock().push(name.to_string());
        }

        fn events_missed(&self) {
            self.calls.lock().push("<missed>".to_string());
        }

        fn listener_abandoned(&self) {
            self.calls.lock().push("<abandoned>".to_string());
        }
    }

    fn entry(first: ListenerSlot) -> Arc<DirectoryWatchEntry> {
        let registrar = ManualRegistrar::new();
        let handle = registrar
            .register(Path::new("/a/b"), EventKinds::all(), WatchMode::Directory)
            .unwrap();
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        DirectoryWatchEntry::new(PathBuf::from("/a/b"), None, handle, pool, first)
    }

    #[test]
    fn test_add_and_remove_listeners() {
        let recorder: Arc<dyn FileEventListener> = Arc::new(Recorder::default());
        let e = entry(ListenerSlot::new(ListenerId(1), recorder.clone()));
        assert!(e.try_add(ListenerSlot::new(ListenerId(2), recorder.clone())));
        assert_eq!(e.listener_count(), 2);

        assert_eq!(e.remove(ListenerId(9)), Removal::NotFound);
        assert_eq!(e.remove(ListenerId(1)), Removal::Remaining);
        assert_eq!(e.remove(ListenerId(2)), Removal::Drained);
        assert_eq!(e.remove(ListenerId(2)), Removal::NotFound);

        // Torn down entries never come back
        assert!(!e.try_add(ListenerSlot::new(ListenerId(3), recorder)));
        assert!(!e.is_live());
    }

    #[test]
    fn test_inline_delivery_in_order() {
        let recorder = Arc::new(Recorder::default());
        let e = entry(ListenerSlot::new(ListenerId(1), recorder.clone()));

        e.enqueue(ListenerCall::Changed("one".to_string()));
        e.enqueue(ListenerCall::EventsMissed);
        e.enqueue(ListenerCall::Changed("two".to_string()));
        e.deliver_pending();

        assert_eq!(*recorder.calls.lock(), vec!["one", "<missed>", "two"]);
    }

    #[test]
    fn test_abandon_once_and_tear_down() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let e = entry(ListenerSlot::new(ListenerId(1), first.clone()));
        assert!(e.try_add(ListenerSlot::new(ListenerId(2), second.clone())));

        e.enqueue(ListenerCall::Abandoned);
        e.enqueue(ListenerCall::Changed("late".to_string()));
        e.deliver_pending();

        assert_eq!(*first.calls.lock(), vec!["<abandoned>"]);
        assert_eq!(*second.calls.lock(), vec!["<abandoned>"]);
        assert!(!e.is_live());
        assert_eq!(e.remove(ListenerId(1)), Removal::NotFound);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let recorder = Arc::new(Recorder::default());
        struct Panicky;
        impl FileEventListener for Panicky {
            fn changed(&self, _name: &str) {
                panic!("listener bug");
            }
        }

        let e = entry(ListenerSlot::new(ListenerId(1), Arc::new(Panicky)));
        assert!(e.try_add(ListenerSlot::new(ListenerId(2), recorder.clone())));

        e.enqueue(ListenerCall::Changed("f.txt".to_string()));
        e.deliver_pending();
        assert_eq!(*recorder.calls.lock(), vec!["f.txt"]);
    }
}
