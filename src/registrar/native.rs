//! Registrar backed by the platform watcher from the `notify` crate.
//!
//! A single `notify::RecommendedWatcher` serves every handle. Native watches
//! are reference counted per path so that two handles on the same directory
//! share one kernel subscription.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::queue::{QueuedHandle, ReadyQueue, relative_context};
use super::{
    EventKind, EventKinds, HandleId, RegisterError, RegistrarClosed, WatchEvent, WatchHandle,
    WatchMode, WatchRegistrar, check_directory,
};

const DEFAULT_EVENT_CAPACITY: usize = 512;

/// Whether the platform backend watches a tree with a single native
/// subscription. Linux inotify emulates recursion with one watch per
/// directory, which is exactly what subtree watching is meant to avoid.
fn native_subtree_support() -> bool {
    cfg!(any(target_os = "macos", target_os = "windows"))
}

/// Registration counts for one native path.
#[derive(Debug, Default, Clone, Copy)]
struct WatchCount {
    directory: usize,
    subtree: usize,
}

impl WatchCount {
    fn mode(self) -> Option<RecursiveMode> {
        if self.subtree > 0 {
            Some(RecursiveMode::Recursive)
        } else if self.directory > 0 {
            Some(RecursiveMode::NonRecursive)
        } else {
            None
        }
    }

    fn bump(&mut self, mode: WatchMode, up: bool) {
        let slot = match mode {
            WatchMode::Directory => &mut self.directory,
            WatchMode::Subtree => &mut self.subtree,
        };
        if up {
            *slot += 1;
        } else {
            *slot = slot.saturating_sub(1);
        }
    }
}

struct NativeState {
    watcher: Option<RecommendedWatcher>,
    counts: HashMap<PathBuf, WatchCount>,
}

impl NativeState {
    /// Apply a new registration count, re-subscribing when the effective
    /// recursion mode changes.
    fn apply(&mut self, path: &Path, mode: WatchMode, up: bool) -> notify::Result<()> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(notify::Error::generic("watcher closed"));
        };
        let before = self.counts.get(path).copied().unwrap_or_default();
        let mut after = before;
        after.bump(mode, up);

        let result = match (before.mode(), after.mode()) {
            (old, new) if old == new => Ok(()),
            (None, Some(new)) => watcher.watch(path, new),
            (Some(_), None) => {
                // The directory may already be gone along with its watch
                let _ = watcher.unwatch(path);
                Ok(())
            }
            (Some(_), Some(new)) => {
                let _ = watcher.unwatch(path);
                watcher.watch(path, new)
            }
            (None, None) => Ok(()),
        };

        if result.is_ok() || !up {
            if after.mode().is_some() {
                self.counts.insert(path.to_path_buf(), after);
            } else {
                self.counts.remove(path);
            }
        }
        result
    }
}

/// One handle as seen by the event router.
struct Route {
    /// Canonical form of the registered path, as reported by the backend.
    root: PathBuf,
    handle: Arc<QueuedHandle>,
}

struct NotifyShared {
    native: Mutex<NativeState>,
    routes: Mutex<Vec<Route>>,
    ready: Arc<ReadyQueue>,
    next_id: AtomicU64,
    subtree: bool,
    capacity: usize,
}

impl NotifyShared {
    fn route(&self, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("[registrar] native watcher error: {e}");
                self.overflow(&e.paths);
                return;
            }
        };

        if event.need_rescan() {
            self.overflow(&event.paths);
            return;
        }

        for (path, kind) in translate(&event) {
            self.deliver(&path, kind);
        }

        if matches!(event.kind, notify::EventKind::Remove(_)) {
            for path in &event.paths {
                self.invalidate_rooted(path);
            }
        }
    }

    fn deliver(&self, path: &Path, kind: EventKind) {
        let routes = self.routes.lock();
        for route in routes.iter() {
            if let Some(rel) = relative_context(&route.root, route.handle.mode(), path) {
                route.handle.push(WatchEvent::new(kind, rel));
            }
        }
    }

    /// Signal overflow on every handle covering one of `paths`, or on every
    /// handle when the backend did not say which paths were affected.
    fn overflow(&self, paths: &[PathBuf]) {
        let routes = self.routes.lock();
        for route in routes.iter() {
            let covered = paths.is_empty()
                || paths.iter().any(|p| {
                    p == &route.root
                        || relative_context(&route.root, route.handle.mode(), p).is_some()
                });
            if covered {
                route.handle.push(WatchEvent::overflow());
            }
        }
    }

    fn invalidate_rooted(&self, path: &Path) {
        let routes = self.routes.lock();
        for route in routes.iter().filter(|r| r.root == path) {
            crate::debug_event!("registrar", "invalidated", "{}", route.root.display());
            route.handle.invalidate();
        }
    }

    fn handle_cancelled(&self, handle: &QueuedHandle) {
        let root = {
            let mut routes = self.routes.lock();
            let Some(pos) = routes.iter().position(|r| r.handle.id() == handle.id()) else {
                return;
            };
            routes.swap_remove(pos).root
        };
        let _ = self.native.lock().apply(&root, handle.mode(), false);
    }
}

/// Map one backend event to `(path, kind)` pairs.
///
/// Renames become a delete of the old name followed by a create of the new
/// one. Access notifications are dropped.
fn translate(event: &Event) -> Vec<(PathBuf, EventKind)> {
    use notify::EventKind as Native;

    let all = |kind: EventKind| -> Vec<(PathBuf, EventKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };

    match event.kind {
        Native::Access(_) => Vec::new(),
        Native::Create(_) => all(EventKind::Create),
        Native::Remove(_) => all(EventKind::Delete),
        Native::Modify(ModifyKind::Name(RenameMode::From)) => all(EventKind::Delete),
        Native::Modify(ModifyKind::Name(RenameMode::To)) => all(EventKind::Create),
        Native::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), EventKind::Delete));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), EventKind::Create));
            }
            out
        }
        Native::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    EventKind::Create
                } else {
                    EventKind::Delete
                };
                (p.clone(), kind)
            })
            .collect(),
        Native::Modify(_) | Native::Any | Native::Other => all(EventKind::Modify),
    }
}

/// Configures a [`NotifyRegistrar`].
#[derive(Debug, Clone)]
pub struct NotifyRegistrarBuilder {
    event_capacity: usize,
    subtree: Option<bool>,
}

impl NotifyRegistrarBuilder {
    pub fn new() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            subtree: None,
        }
    }

    /// Maximum buffered events per handle before an overflow is reported.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Override whether subtree registrations are offered.
    pub fn subtree(mut self, enabled: bool) -> Self {
        self.subtree = Some(enabled);
        self
    }

    /// Create the platform watcher.
    pub fn build(self) -> notify::Result<NotifyRegistrar> {
        let shared = Arc::new(NotifyShared {
            native: Mutex::new(NativeState {
                watcher: None,
                counts: HashMap::new(),
            }),
            routes: Mutex::new(Vec::new()),
            ready: Arc::new(ReadyQueue::new()),
            next_id: AtomicU64::new(1),
            subtree: self.subtree.unwrap_or_else(native_subtree_support),
            capacity: self.event_capacity,
        });

        let weak: Weak<NotifyShared> = Arc::downgrade(&shared);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Some(shared) = weak.upgrade() {
                shared.route(res);
            }
        })?;
        shared.native.lock().watcher = Some(watcher);

        Ok(NotifyRegistrar { shared })
    }
}

impl Default for NotifyRegistrarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// [`WatchRegistrar`] on top of the operating system's change notifications.
pub struct NotifyRegistrar {
    shared: Arc<NotifyShared>,
}

impl NotifyRegistrar {
    /// Registrar with default settings.
    pub fn new() -> notify::Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> NotifyRegistrarBuilder {
        NotifyRegistrarBuilder::new()
    }

    /// Number of distinct paths with a native subscription.
    pub fn native_watch_count(&self) -> usize {
        self.shared.native.lock().counts.len()
    }
}

impl WatchRegistrar for NotifyRegistrar {
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
        check_directory(path)?;
        if mode == WatchMode::Subtree && !shared.subtree {
            return Err(RegisterError::Unsupported {
                path: path.to_path_buf(),
                reason: "platform watcher has no native subtree mode".to_string(),
            });
        }

        let root = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        shared
            .native
            .lock()
            .apply(&root, mode, true)
            .map_err(|e| register_error(path, e))?;

        let weak: Weak<NotifyShared> = Arc::downgrade(shared);
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
        shared.routes.lock().push(Route {
            root,
            handle: Arc::clone(&handle),
        });

        crate::debug_event!(
            "registrar",
            "registered",
            "{} ({mode:?}) as {}",
            path.display(),
            handle.id()
        );
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
        let watcher = self.shared.native.lock().watcher.take();
        drop(watcher);
    }
}

impl Drop for NotifyRegistrar {
    fn drop(&mut self) {
        self.close();
    }
}

fn register_error(path: &Path, e: notify::Error) -> RegisterError {
    match e.kind {
        notify::ErrorKind::PathNotFound => RegisterError::NotFound {
            path: path.to_path_buf(),
        },
        notify::ErrorKind::Io(source) => RegisterError::Io {
            path: path.to_path_buf(),
            source,
        },
        notify::ErrorKind::MaxFilesWatch => RegisterError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other("native watch limit reached"),
        },
        other => RegisterError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("{other:?}")),
        },
    }
}
