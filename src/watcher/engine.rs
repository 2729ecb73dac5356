//! The watcher engine.
//!
//! Owns the blocking poll loop on the registrar, decides between direct and
//! subtree installation, translates native events into listener calls and
//! hands fan-out to the worker pool.
//!
//! Only the engine thread blocks on the registrar. Other threads touch a
//! native handle only to flush it during explicit removal, and only under
//! that handle's dispatch lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::registrar::{
    EventKind, EventKinds, HandleId, WatchEvent, WatchHandle, WatchMode, WatchRegistrar,
};

use super::entry::{DirectoryWatchEntry, ListenerCall, ListenerId, ListenerSlot, Removal};
use super::error::WatchError;
use super::path_registry::{PathRegistry, Published, subtree_anchor};
use super::pool::WorkerPool;
use super::service::WatchStats;
use super::subtree::{SubtreeState, SubtreeWatch};

type KeyLock = Arc<Mutex<()>>;

enum Install {
    Done(Arc<DirectoryWatchEntry>),
    /// The anchor refuses subtree watches; watch the directory directly.
    Fallback,
    /// Lost a race against a teardown; start over.
    Retry,
}

/// Entries that received calls during one translation pass.
#[derive(Default)]
struct Touched(Vec<Arc<DirectoryWatchEntry>>);

impl Touched {
    fn push(&mut self, entry: Arc<DirectoryWatchEntry>, call: ListenerCall) {
        entry.enqueue(call);
        if !self.0.iter().any(|e| Arc::ptr_eq(e, &entry)) {
            self.0.push(entry);
        }
    }

    fn extend(&mut self, other: Touched) {
        for entry in other.0 {
            if !self.0.iter().any(|e| Arc::ptr_eq(e, &entry)) {
                self.0.push(entry);
            }
        }
    }

    fn dispatch(self) {
        for entry in &self.0 {
            entry.dispatch();
        }
    }
}

pub(crate) struct Engine {
    registrar: Arc<dyn WatchRegistrar>,
    pool: Arc<WorkerPool>,
    entries: PathRegistry,
    subtrees: DashMap<PathBuf, SubtreeState>,
    /// Serializes polling of one native handle.
    dispatch_locks: DashMap<HandleId, KeyLock>,
    /// Serializes installs per path (direct) or per anchor (subtree).
    register_locks: DashMap<PathBuf, KeyLock>,
    subtree_enabled: bool,
}

impl Engine {
    pub(crate) fn new(
        registrar: Arc<dyn WatchRegistrar>,
        pool: Arc<WorkerPool>,
        subtree_watching: bool,
    ) -> Arc<Self> {
        let subtree_enabled = subtree_watching && registrar.supports_subtree();
        crate::debug_event!(
            "watcher",
            "engine created",
            "subtree watching {}",
            if subtree_enabled { "on" } else { "off" }
        );
        Arc::new(Self {
            registrar,
            pool,
            entries: PathRegistry::new(),
            subtrees: DashMap::new(),
            dispatch_locks: DashMap::new(),
            register_locks: DashMap::new(),
            subtree_enabled,
        })
    }

    /// Start the engine thread.
    pub(crate) fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>, WatchError> {
        let engine = Arc::clone(self);
        let name = "watchmux-watcher".to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || engine.run())
            .map_err(|source| WatchError::ThreadSpawn { name, source })
    }

    /// Close the registrar; the engine thread exits after abandoning every
    /// remaining entry.
    pub(crate) fn close(&self) {
        self.registrar.close();
    }

    fn run(&self) {
        crate::log_event!("watcher", "started");
        while let Ok(handle) = self.registrar.take() {
            self.process_ready(&handle);
        }
        self.shutdown_all();
        crate::log_event!("watcher", "stopped");
    }

    fn process_ready(&self, handle: &Arc<dyn WatchHandle>) {
        // No lock means the handle is being released; leave it un-armed
        let Some(lock) = self.existing_dispatch_lock(handle.id()) else {
            return;
        };
        let touched = {
            let _guard = lock.lock();
            let events = handle.poll_events();
            self.translate(handle, events)
        };
        touched.dispatch();
        if !handle.reset() {
            self.handle_reset_failure(handle);
        }
    }

    // ---- registration ----

    /// Register `slot` for the normalized absolute directory `path`.
    pub(crate) fn add_listener(
        &self,
        path: &Path,
        slot: &ListenerSlot,
    ) -> Result<Arc<DirectoryWatchEntry>, WatchError> {
        loop {
            if let Some(existing) = self.entries.get(path) {
                if existing.try_add(slot.clone()) {
                    return Ok(existing);
                }
                // Being torn down; install again
            }

            if self.subtree_enabled {
                if let Some(anchor) = subtree_anchor(path) {
                    match self.install_subtree(path, &anchor, slot)? {
                        Install::Done(entry) => return Ok(entry),
                        Install::Retry => continue,
                        Install::Fallback => {}
                    }
                }
            }

            return self.install_direct(path, slot);
        }
    }

    fn install_subtree(
        &self,
        path: &Path,
        anchor: &Path,
        slot: &ListenerSlot,
    ) -> Result<Install, WatchError> {
        if let Some(state) = self.subtree_state(anchor) {
            return Ok(self.attach(path, state, slot));
        }

        let lock = self.register_lock(anchor);
        let _guard = lock.lock();
        if let Some(state) = self.subtree_state(anchor) {
            return Ok(self.attach(path, state, slot));
        }

        match self
            .registrar
            .register(anchor, EventKinds::all(), WatchMode::Subtree)
        {
            Ok(handle) => {
                self.install_dispatch_lock(handle.id());
                let entry = DirectoryWatchEntry::new(
                    path.to_path_buf(),
                    Some(anchor.to_path_buf()),
                    Arc::clone(&handle),
                    Arc::clone(&self.pool),
                    slot.clone(),
                );
                let watch = SubtreeWatch::new(anchor.to_path_buf(), handle, Arc::clone(&entry));
                self.subtrees.insert(
                    anchor.to_path_buf(),
                    SubtreeState::Active(Arc::clone(&watch)),
                );
                crate::debug_event!(
                    "watcher",
                    "subtree installed",
                    "{} ({}) for {}",
                    anchor.display(),
                    watch.handle_id(),
                    path.display()
                );
                Ok(self.publish_subtree_entry(entry, &watch, slot))
            }
            Err(e) if e.is_caller_error() => Err(e.into()),
            Err(e) => {
                crate::debug_event!(
                    "watcher",
                    "subtree unavailable",
                    "{}: {e}",
                    anchor.display()
                );
                self.subtrees
                    .entry(anchor.to_path_buf())
                    .or_insert(SubtreeState::Failed);
                Ok(Install::Fallback)
            }
        }
    }

    fn attach(&self, path: &Path, state: SubtreeState, slot: &ListenerSlot) -> Install {
        let watch = match state {
            SubtreeState::Failed => return Install::Fallback,
            SubtreeState::Active(watch) => watch,
        };
        let entry = DirectoryWatchEntry::new(
            path.to_path_buf(),
            Some(watch.anchor().to_path_buf()),
            Arc::clone(watch.handle()),
            Arc::clone(&self.pool),
            slot.clone(),
        );
        if !watch.add_entry(&entry) {
            // Drained or abandoned but still mapped; unmap it for the retry
            self.subtrees
                .remove_if(watch.anchor(), |_, s| s.is_watch(&watch));
            return Install::Retry;
        }
        crate::debug_event!(
            "watcher",
            "subtree joined",
            "{} under {} ({} entries)",
            path.display(),
            watch.anchor().display(),
            watch.entry_count()
        );
        self.publish_subtree_entry(entry, &watch, slot)
    }

    fn publish_subtree_entry(
        &self,
        entry: Arc<DirectoryWatchEntry>,
        watch: &Arc<SubtreeWatch>,
        slot: &ListenerSlot,
    ) -> Install {
        match self.entries.publish(&entry, slot) {
            Published::Joined(existing) => {
                // The fresh entry never became visible
                self.detach_from_subtree(&entry, watch);
                Install::Done(existing)
            }
            Published::Inserted => {
                // Abandoned between attach and publish; the abandonment scan
                // may have missed the entry
                if watch.is_closed() && self.entries.remove_if_same(&entry) {
                    entry.enqueue(ListenerCall::Abandoned);
                    entry.dispatch();
                }
                Install::Done(entry)
            }
        }
    }

    fn install_direct(
        &self,
        path: &Path,
        slot: &ListenerSlot,
    ) -> Result<Arc<DirectoryWatchEntry>, WatchError> {
        let lock = self.register_lock(path);
        let _guard = lock.lock();
        if let Some(existing) = self.entries.get(path) {
            if existing.try_add(slot.clone()) {
                return Ok(existing);
            }
        }

        let handle = self
            .registrar
            .register(path, EventKinds::all(), WatchMode::Directory)?;
        self.install_dispatch_lock(handle.id());
        let entry = DirectoryWatchEntry::new(
            path.to_path_buf(),
            None,
            handle,
            Arc::clone(&self.pool),
            slot.clone(),
        );

        match self.entries.publish(&entry, slot) {
            Published::Inserted => {
                crate::debug_event!(
                    "watcher",
                    "watch installed",
                    "{} ({})",
                    path.display(),
                    entry.handle_id()
                );
                Ok(entry)
            }
            Published::Joined(existing) => {
                // A subtree entry for the same path won the race
                self.dispatch_locks.remove(&entry.handle_id());
                entry.handle().cancel();
                Ok(existing)
            }
        }
    }

    // ---- removal ----

    /// Flush, deliver and detach one listener.
    ///
    /// Calls already queued for the entry are delivered on the calling thread
    /// first, unless a pool drain is in flight, in which case that drain
    /// delivers them.
    pub(crate) fn remove_listener(&self, entry: &Arc<DirectoryWatchEntry>, id: ListenerId) {
        let touched = self.flush(entry.handle());
        entry.deliver_pending();
        self.detach(entry, id);
        touched.dispatch();
    }

    /// Remove several listeners, flushing each native handle once.
    pub(crate) fn remove_listeners(&self, targets: &[(Arc<DirectoryWatchEntry>, ListenerId)]) {
        let mut flushed = HashSet::new();
        let mut touched = Touched::default();
        for (entry, _) in targets {
            if flushed.insert(entry.handle_id()) {
                touched.extend(self.flush(entry.handle()));
            }
        }
        for (entry, id) in targets {
            entry.deliver_pending();
            self.detach(entry, *id);
        }
        touched.dispatch();
    }

    /// Translate events still buffered in `handle` into entry queues.
    ///
    /// The touched entries are returned undispatched.
    fn flush(&self, handle: &Arc<dyn WatchHandle>) -> Touched {
        let Some(lock) = self.existing_dispatch_lock(handle.id()) else {
            return Touched::default();
        };
        let _guard = lock.lock();
        let events = handle.poll_events();
        self.translate(handle, events)
    }

    fn detach(&self, entry: &Arc<DirectoryWatchEntry>, id: ListenerId) {
        if entry.remove(id) == Removal::Drained {
            self.release_entry(entry);
        }
    }

    fn release_entry(&self, entry: &Arc<DirectoryWatchEntry>) {
        self.entries.remove_if_same(entry);
        match entry.anchor() {
            Some(anchor) => {
                if let Some(SubtreeState::Active(watch)) = self.subtree_state(anchor) {
                    if watch.handle_id() == entry.handle_id() {
                        self.detach_from_subtree(entry, &watch);
                    }
                }
            }
            None => {
                self.dispatch_locks.remove(&entry.handle_id());
                entry.handle().cancel();
                crate::debug_event!(
                    "watcher",
                    "watch cancelled",
                    "{} ({})",
                    entry.path().display(),
                    entry.handle_id()
                );
            }
        }
    }

    fn detach_from_subtree(&self, entry: &Arc<DirectoryWatchEntry>, watch: &Arc<SubtreeWatch>) {
        if watch.remove_entry(entry) {
            self.subtrees
                .remove_if(watch.anchor(), |_, s| s.is_watch(watch));
            self.dispatch_locks.remove(&watch.handle_id());
            watch.handle().cancel();
            crate::debug_event!(
                "watcher",
                "subtree cancelled",
                "{} ({})",
                watch.anchor().display(),
                watch.handle_id()
            );
        }
    }

    // ---- events ----

    fn translate(&self, handle: &Arc<dyn WatchHandle>, events: Vec<WatchEvent>) -> Touched {
        let mut touched = Touched::default();
        for event in events {
            match (event.kind, event.context) {
                (EventKind::Overflow, _) => {
                    for entry in self.covered_by(handle) {
                        touched.push(entry, ListenerCall::EventsMissed);
                    }
                }
                (_, Some(context)) => {
                    if let Some((entry, name)) = self.resolve(handle, &context) {
                        touched.push(entry, ListenerCall::Changed(name));
                    }
                }
                (_, None) => {}
            }
        }
        touched
    }

    /// Entry and child name a native event context refers to.
    fn resolve(
        &self,
        handle: &Arc<dyn WatchHandle>,
        context: &Path,
    ) -> Option<(Arc<DirectoryWatchEntry>, String)> {
        let root = handle.watchable();
        let (dir, name) = match handle.mode() {
            WatchMode::Directory => (root.to_path_buf(), context.file_name()?),
            WatchMode::Subtree => {
                let full = root.join(context);
                let dir = full.parent()?.to_path_buf();
                let name = context.file_name()?;
                (dir, name)
            }
        };
        let entry = self
            .entries
            .get(&dir)
            .filter(|e| e.handle_id() == handle.id())?;
        Some((entry, name.to_string_lossy().into_owned()))
    }

    /// Every published entry whose events arrive through `handle`.
    fn covered_by(&self, handle: &Arc<dyn WatchHandle>) -> Vec<Arc<DirectoryWatchEntry>> {
        let root = handle.watchable();
        match handle.mode() {
            WatchMode::Subtree => self.entries.under(root, handle.id()),
            WatchMode::Directory => self
                .entries
                .get(root)
                .filter(|e| e.handle_id() == handle.id())
                .into_iter()
                .collect(),
        }
    }

    /// The handle can no longer be re-armed: abandon everything relying on
    /// it and drop its bookkeeping.
    fn handle_reset_failure(&self, handle: &Arc<dyn WatchHandle>) {
        let root = handle.watchable();
        if handle.mode() == WatchMode::Subtree {
            if let Some(SubtreeState::Active(watch)) = self.subtree_state(root) {
                if watch.handle_id() == handle.id() {
                    watch.close();
                    self.subtrees.remove_if(root, |_, s| s.is_watch(&watch));
                }
            }
        }

        let mut abandoned = 0;
        for entry in self.covered_by(handle) {
            if self.entries.remove_if_same(&entry) {
                abandoned += entry.listener_count();
                entry.enqueue(ListenerCall::Abandoned);
                entry.dispatch();
            }
        }

        self.dispatch_locks.remove(&handle.id());
        handle.cancel();
        crate::log_event!(
            "watcher",
            "watch invalidated",
            "{} ({}), {abandoned} listener(s) abandoned",
            root.display(),
            handle.id()
        );
    }

    fn shutdown_all(&self) {
        for entry in self.entries.drain() {
            entry.enqueue(ListenerCall::Abandoned);
            entry.dispatch();
            if !entry.is_subtree() {
                entry.handle().cancel();
            }
        }

        let states: Vec<SubtreeState> = self.subtrees.iter().map(|s| s.value().clone()).collect();
        self.subtrees.clear();
        for state in states {
            if let SubtreeState::Active(watch) = state {
                watch.close();
                watch.handle().cancel();
            }
        }

        self.dispatch_locks.clear();
        self.pool.close();
    }

    // ---- helpers ----

    fn subtree_state(&self, anchor: &Path) -> Option<SubtreeState> {
        self.subtrees.get(anchor).map(|s| s.value().clone())
    }

    fn install_dispatch_lock(&self, id: HandleId) {
        self.dispatch_locks.entry(id).or_default();
    }

    fn existing_dispatch_lock(&self, id: HandleId) -> Option<KeyLock> {
        self.dispatch_locks.get(&id).map(|l| Arc::clone(l.value()))
    }

    fn register_lock(&self, key: &Path) -> KeyLock {
        Arc::clone(self.register_locks.entry(key.to_path_buf()).or_default().value())
    }

    pub(crate) fn stats(&self) -> WatchStats {
        let (mut subtree_anchors, mut failed_anchors) = (0, 0);
        for state in self.subtrees.iter() {
            match state.value() {
                SubtreeState::Active(_) => subtree_anchors += 1,
                SubtreeState::Failed => failed_anchors += 1,
            }
        }
        WatchStats {
            watched_directories: self.entries.len(),
            subtree_anchors,
            failed_anchors,
            native_handles: self.dispatch_locks.len(),
            listeners: self.entries.listener_count(),
            tokens: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::ManualRegistrar;
    use crate::watcher::listener::FileEventListener;

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

    fn engine(registrar: &ManualRegistrar, subtree: bool) -> Arc<Engine> {
        Engine::new(
            Arc::new(registrar.clone()),
            Arc::new(WorkerPool::new(2).unwrap()),
            subtree,
        )
    }

    fn slot(id: u64, listener: &Arc<Recorder>) -> ListenerSlot {
        ListenerSlot::new(ListenerId(id), listener.clone())
    }

    /// Process every ready handle on the calling thread, then wait for
    /// delivery by shutting the pool down.
    fn pump(engine: &Engine, registrar: &ManualRegistrar, rounds: usize) {
        for _ in 0..rounds {
            let handle = registrar.take().unwrap();
            engine.process_ready(&handle);
        }
        engine.pool.shutdown();
    }

    #[test]
    fn test_subtree_events_resolve_to_parent_entry() {
        let registrar = ManualRegistrar::new();
        let engine = engine(&registrar, true);
        let b = Arc::new(Recorder::default());
        let c = Arc::new(Recorder::default());

        engine.add_listener(Path::new("/a/b"), &slot(1, &b)).unwrap();
        engine.add_listener(Path::new("/a/c"), &slot(2, &c)).unwrap();
        assert_eq!(registrar.active_handles(), vec![(PathBuf::from("/a"), WatchMode::Subtree)]);

        registrar.emit("/a/b/f.txt", EventKind::Create);
        registrar.emit("/a/b/deep/g.txt", EventKind::Create);
        registrar.emit("/a/c/h.txt", EventKind::Modify);
        pump(&engine, &registrar, 1);

        assert_eq!(*b.calls.lock(), vec!["f.txt"]);
        assert_eq!(*c.calls.lock(), vec!["h.txt"]);
    }

    #[test]
    fn test_root_is_watched_directly() {
        let registrar = ManualRegistrar::new();
        let engine = engine(&registrar, true);
        let root = Arc::new(Recorder::default());

        let entry = engine.add_listener(Path::new("/"), &slot(1, &root)).unwrap();
        assert!(!entry.is_subtree());
        assert_eq!(registrar.active_handles(), vec![(PathBuf::from("/"), WatchMode::Directory)]);
    }

    #[test]
    fn test_rejected_subtree_falls_back_to_direct() {
        let registrar = ManualRegistrar::rejecting_subtree();
        let engine = engine(&registrar, true);
        let b = Arc::new(Recorder::default());
        let c = Arc::new(Recorder::default());

        engine.add_listener(Path::new("/a/b"), &slot(1, &b)).unwrap();
        engine.add_listener(Path::new("/a/c"), &slot(2, &c)).unwrap();

        let stats = engine.stats();
        assert_eq!(stats.failed_anchors, 1);
        assert_eq!(stats.subtree_anchors, 0);
        assert_eq!(registrar.active_handle_count(), 2);
    }

    #[test]
    fn test_missing_anchor_propagates() {
        let registrar = ManualRegistrar::new();
        registrar.mark_missing("/gone");
        let engine = engine(&registrar, true);
        let l = Arc::new(Recorder::default());

        let err = engine
            .add_listener(Path::new("/gone/dir"), &slot(1, &l))
            .unwrap_err();
        assert!(matches!(err, WatchError::NotFound { .. }));
        assert_eq!(engine.stats().failed_anchors, 0);
    }

    #[test]
    fn test_overflow_reaches_every_entry_under_anchor() {
        let registrar = ManualRegistrar::new();
        let engine = engine(&registrar, true);
        let b = Arc::new(Recorder::default());
        let c = Arc::new(Recorder::default());
        engine.add_listener(Path::new("/a/b"), &slot(1, &b)).unwrap();
        engine.add_listener(Path::new("/a/b/c"), &slot(2, &c)).unwrap();

        registrar.overflow("/a");
        pump(&engine, &registrar, 1);

        assert_eq!(*b.calls.lock(), vec!["<missed>"]);
        assert_eq!(*c.calls.lock(), vec!["<missed>"]);
    }

    #[test]
    fn test_reset_failure_abandons_and_unpublishes() {
        let registrar = ManualRegistrar::without_subtree();
        let engine = engine(&registrar, true);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        engine.add_listener(Path::new("/a/b"), &slot(1, &first)).unwrap();
        engine.add_listener(Path::new("/a/b"), &slot(2, &second)).unwrap();
        assert_eq!(registrar.registrations(), 1);

        registrar.invalidate("/a/b");
        pump(&engine, &registrar, 1);

        assert_eq!(*first.calls.lock(), vec!["<abandoned>"]);
        assert_eq!(*second.calls.lock(), vec!["<abandoned>"]);
        assert_eq!(registrar.cancellations(), 1);
        assert_eq!(engine.stats().watched_directories, 0);

        // A later registration installs a fresh watch
        let again = Arc::new(Recorder::default());
        engine.add_listener(Path::new("/a/b"), &slot(3, &again)).unwrap();
        assert_eq!(registrar.registrations(), 2);
    }

    #[test]
    fn test_remove_flushes_before_detaching() {
        let registrar = ManualRegistrar::without_subtree();
        let engine = engine(&registrar, false);
        let l = Arc::new(Recorder::default());
        let entry = engine.add_listener(Path::new("/a/b"), &slot(1, &l)).unwrap();

        registrar.emit("/a/b/f.txt", EventKind::Create);
        engine.remove_listener(&entry, ListenerId(1));

        assert_eq!(*l.calls.lock(), vec!["f.txt"]);
        assert_eq!(registrar.cancellations(), 1);
        assert_eq!(engine.stats(), WatchStats::default());
    }

    #[test]
    fn test_released_handle_is_not_rearmed() {
        let registrar = ManualRegistrar::without_subtree();
        let engine = engine(&registrar, false);
        let l = Arc::new(Recorder::default());
        engine.add_listener(Path::new("/a/b"), &slot(1, &l)).unwrap();

        registrar.emit("/a/b/f.txt", EventKind::Create);
        let handle = registrar.take().unwrap();

        // Release has dropped the lock but not yet cancelled the handle
        engine.dispatch_locks.remove(&handle.id());
        engine.process_ready(&handle);
        engine.pool.shutdown();

        assert!(l.calls.lock().is_empty());
        assert_eq!(engine.stats().native_handles, 0);
    }
}
