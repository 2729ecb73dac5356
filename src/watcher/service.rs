//! The public watch service.
//!
//! A [`WatchService`] multiplexes many directory listeners onto as few native
//! watches as possible. The registrar, engine thread and dispatch pool are
//! started on the first [`WatchService::add_listener`] call.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::WatcherConfig;
use crate::registrar::{NotifyRegistrar, WatchRegistrar};

use super::engine::Engine;
use super::entry::{ListenerId, ListenerSlot};
use super::error::WatchError;
use super::listener::FileEventListener;
use super::path_registry::normalize_path;
use super::pool::WorkerPool;
use super::reaper::Reaper;
use super::token::{ListenerToken, Registration};

/// Creates the registrar on first use.
pub type RegistrarFactory =
    Box<dyn FnOnce() -> Result<Arc<dyn WatchRegistrar>, WatchError> + Send + 'static>;

/// Snapshot of the service's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchStats {
    /// Directories with at least one listener.
    pub watched_directories: usize,
    /// Anchors with a live subtree watch.
    pub subtree_anchors: usize,
    /// Anchors where subtree watching was refused.
    pub failed_anchors: usize,
    /// Native handles owned by the engine.
    pub native_handles: usize,
    pub listeners: usize,
    /// Tokens handed out and not yet removed, including dropped tokens the
    /// reaper has not processed yet.
    pub tokens: usize,
}

enum EngineSlot {
    Pending(RegistrarFactory),
    Running {
        engine: Arc<Engine>,
        pool: Arc<WorkerPool>,
        thread: Option<JoinHandle<()>>,
    },
    Unavailable(String),
    Shutdown,
}

pub(crate) struct ServiceInner {
    config: WatcherConfig,
    slot: Mutex<EngineSlot>,
    reaper: Arc<Reaper>,
    next_listener: AtomicU64,
}

impl ServiceInner {
    pub(crate) fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// The running engine, started on first use.
    fn engine(&self) -> Result<Arc<Engine>, WatchError> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, EngineSlot::Shutdown) {
            EngineSlot::Pending(factory) => match start(&self.config, factory) {
                Ok((engine, pool, thread)) => {
                    *slot = EngineSlot::Running {
                        engine: Arc::clone(&engine),
                        pool,
                        thread: Some(thread),
                    };
                    Ok(engine)
                }
                Err(e) => {
                    let reason = match e {
                        WatchError::Unavailable { reason } => reason,
                        other => other.to_string(),
                    };
                    tracing::warn!("[watcher] watching disabled: {reason}");
                    *slot = EngineSlot::Unavailable(reason.clone());
                    Err(WatchError::Unavailable { reason })
                }
            },
            EngineSlot::Running {
                engine,
                pool,
                thread,
            } => {
                *slot = EngineSlot::Running {
                    engine: Arc::clone(&engine),
                    pool,
                    thread,
                };
                Ok(engine)
            }
            EngineSlot::Unavailable(reason) => {
                *slot = EngineSlot::Unavailable(reason.clone());
                Err(WatchError::Unavailable { reason })
            }
            EngineSlot::Shutdown => Err(WatchError::Closed),
        }
    }

    fn running_engine(&self) -> Option<Arc<Engine>> {
        match &*self.slot.lock() {
            EngineSlot::Running { engine, .. } => Some(Arc::clone(engine)),
            _ => None,
        }
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        // Last handle and last token are gone; signal without joining
        if let EngineSlot::Running { engine, .. } =
            std::mem::replace(self.slot.get_mut(), EngineSlot::Shutdown)
        {
            engine.close();
        }
        self.reaper.stop();
    }
}

fn start(
    config: &WatcherConfig,
    factory: RegistrarFactory,
) -> Result<(Arc<Engine>, Arc<WorkerPool>, JoinHandle<()>), WatchError> {
    let registrar = factory()?;
    let pool = Arc::new(WorkerPool::new(config.dispatch_threads)?);
    let engine = Engine::new(registrar, Arc::clone(&pool), config.subtree_watching);
    let thread = engine.spawn()?;
    crate::log_event!(
        "watcher",
        "service started",
        "{} dispatch thread(s)",
        config.dispatch_threads.max(1)
    );
    Ok((engine, pool, thread))
}

fn native_registrar(capacity: usize) -> Result<Arc<dyn WatchRegistrar>, WatchError> {
    let registrar = NotifyRegistrar::builder()
        .event_capacity(capacity)
        .build()?;
    Ok(Arc::new(registrar))
}

/// Directory change-notification service.
///
/// Cheap to clone; clones share one engine. Listeners registered for
/// directories below the same root-level directory share a single subtree
/// watch when the registrar supports it.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use watchmux::config::WatcherConfig;
/// use watchmux::watcher::WatchService;
///
/// let service = WatchService::new(WatcherConfig::default());
/// let token = service
///     .add_listener("/tmp", Arc::new(|name: &str| println!("changed: {name}")))
///     .unwrap();
/// // ...
/// token.remove();
/// service.shutdown();
/// ```
#[derive(Clone)]
pub struct WatchService {
    inner: Arc<ServiceInner>,
}

impl WatchService {
    /// Service backed by the native [`NotifyRegistrar`].
    pub fn new(config: WatcherConfig) -> Self {
        let capacity = config.event_queue_capacity;
        Self::with_factory(config, Box::new(move || native_registrar(capacity)))
    }

    /// Service backed by an existing registrar.
    pub fn with_registrar(config: WatcherConfig, registrar: Arc<dyn WatchRegistrar>) -> Self {
        Self::with_factory(config, Box::new(move || Ok::<_, WatchError>(registrar)))
    }

    /// Service whose registrar is created by `factory` on first use. A
    /// factory error makes the service permanently unavailable.
    pub fn with_factory(config: WatcherConfig, factory: RegistrarFactory) -> Self {
        let reaper = Reaper::new(Duration::from_millis(config.reaper_idle_timeout_ms));
        Self {
            inner: Arc::new(ServiceInner {
                config,
                slot: Mutex::new(EngineSlot::Pending(factory)),
                reaper,
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.inner.config
    }

    /// Register `listener` for changes to the direct children of `dir`.
    ///
    /// `dir` must be absolute. It is normalized lexically, so `/a/./b/` and
    /// `/a/b` share one watch.
    pub fn add_listener(
        &self,
        dir: impl AsRef<Path>,
        listener: Arc<dyn FileEventListener>,
    ) -> Result<ListenerToken, WatchError> {
        let dir = dir.as_ref();
        if !dir.is_absolute() {
            return Err(WatchError::RelativePath {
                path: dir.to_path_buf(),
            });
        }
        let path = normalize_path(dir);
        let engine = self.inner.engine()?;

        self.inner.reaper.track()?;
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let slot = ListenerSlot::new(id, listener);
        match engine.add_listener(&path, &slot) {
            Ok(entry) => {
                crate::debug_event!("watcher", "listener added", "{} (#{})", path.display(), id.0);
                Ok(ListenerToken::new(Registration {
                    service: Arc::clone(&self.inner),
                    engine,
                    entry,
                    id,
                }))
            }
            Err(e) => {
                self.inner.reaper.untrack();
                Err(e)
            }
        }
    }

    /// Remove several listeners at once.
    ///
    /// Every token is checked before anything is removed. On success
    /// `tokens` is drained; on error it is left untouched and every token in
    /// it stays registered. Native handles shared by several tokens are
    /// flushed once.
    pub fn remove_listeners(&self, tokens: &mut Vec<ListenerToken>) -> Result<(), WatchError> {
        let foreign = tokens.iter().any(|t| {
            t.registration()
                .is_some_and(|r| !Arc::ptr_eq(&r.service, &self.inner))
        });
        if foreign {
            return Err(WatchError::ForeignToken);
        }

        let registrations: Vec<Registration> = tokens
            .drain(..)
            .filter_map(|mut t| t.take_registration())
            .collect();
        let Some(engine) = registrations.first().map(|r| Arc::clone(&r.engine)) else {
            return Ok(());
        };
        let targets: Vec<_> = registrations
            .iter()
            .map(|r| (Arc::clone(&r.entry), r.id))
            .collect();
        engine.remove_listeners(&targets);
        for _ in &registrations {
            self.inner.reaper.untrack();
        }
        crate::debug_event!(
            "watcher",
            "listeners removed",
            "{}",
            registrations.len()
        );
        Ok(())
    }

    pub fn stats(&self) -> WatchStats {
        let mut stats = self
            .inner
            .running_engine()
            .map(|engine| engine.stats())
            .unwrap_or_default();
        stats.tokens = self.inner.reaper.tracked();
        stats
    }

    /// Whether the engine has started.
    pub fn is_running(&self) -> bool {
        self.inner.running_engine().is_some()
    }

    /// Stop watching.
    ///
    /// Every remaining listener receives `listener_abandoned`. Waits for the
    /// engine thread and for queued callbacks, except when called from one of
    /// them. Later `add_listener` calls fail with [`WatchError::Closed`].
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.inner.slot.lock(), EngineSlot::Shutdown);
        if let EngineSlot::Running {
            engine,
            pool,
            thread,
        } = previous
        {
            engine.close();
            if let Some(thread) = thread {
                if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                    tracing::error!("[watcher] engine thread panicked");
                }
            }
            pool.join();
            crate::log_event!("watcher", "service shut down");
        }
        self.inner.reaper.stop();
    }
}

impl std::fmt::Debug for WatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchService")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("reaper_running", &self.inner.reaper.is_running())
            .finish()
    }
}
