//! Handle state machine shared by the registrars.
//!
//! A handle is either *ready* (armed, no events reported to the consumer) or
//! *signalled* (queued on the ready queue, or being processed). Events on a
//! ready handle signal it; `reset()` returns it to ready, or re-queues it when
//! events arrived while it was being processed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::{EventKind, EventKinds, HandleId, RegistrarClosed, WatchEvent, WatchHandle, WatchMode};

enum Signal {
    Ready(Arc<QueuedHandle>),
    Close,
}

/// Queue of signalled handles, consumed by [`ReadyQueue::take`].
pub(crate) struct ReadyQueue {
    tx: Sender<Signal>,
    rx: Receiver<Signal>,
    closed: AtomicBool,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    fn signal(&self, handle: Arc<QueuedHandle>) {
        if !self.is_closed() {
            let _ = self.tx.send(Signal::Ready(handle));
        }
    }

    pub(crate) fn take(&self) -> Result<Arc<QueuedHandle>, RegistrarClosed> {
        if self.is_closed() {
            return Err(RegistrarClosed);
        }
        match self.rx.recv() {
            Ok(Signal::Ready(handle)) => Ok(handle),
            Ok(Signal::Close) => {
                // wake the next blocked taker as well
                let _ = self.tx.send(Signal::Close);
                Err(RegistrarClosed)
            }
            Err(_) => Err(RegistrarClosed),
        }
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Signal::Close);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct HandleState {
    events: Vec<WatchEvent>,
    signalled: bool,
    invalid: bool,
    cancelled: bool,
    overflowed: bool,
}

type CancelHook = Box<dyn Fn(&QueuedHandle) + Send + Sync>;

/// Handle implementation used by both [`super::NotifyRegistrar`] and
/// [`super::ManualRegistrar`].
pub(crate) struct QueuedHandle {
    id: HandleId,
    path: PathBuf,
    mode: WatchMode,
    kinds: EventKinds,
    capacity: usize,
    state: Mutex<HandleState>,
    ready: Arc<ReadyQueue>,
    me: Weak<QueuedHandle>,
    on_cancel: CancelHook,
}

impl QueuedHandle {
    pub(crate) fn new(
        id: HandleId,
        path: PathBuf,
        mode: WatchMode,
        kinds: EventKinds,
        capacity: usize,
        ready: Arc<ReadyQueue>,
        on_cancel: CancelHook,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            path,
            mode,
            kinds,
            capacity: capacity.max(1),
            state: Mutex::new(HandleState::default()),
            ready,
            me: me.clone(),
            on_cancel,
        })
    }

    /// Record an event and signal the handle.
    ///
    /// Overflow is always recorded regardless of the registered kinds.
    pub(crate) fn push(&self, event: WatchEvent) {
        if event.kind != EventKind::Overflow && !self.kinds.contains(event.kind.as_flag()) {
            return;
        }
        let mut state = self.state.lock();
        if state.invalid {
            return;
        }
        if event.kind == EventKind::Overflow || state.events.len() >= self.capacity {
            if !state.overflowed {
                state.overflowed = true;
                state.events.push(WatchEvent::overflow());
            }
        } else if !state.overflowed {
            state.events.push(event);
        }
        self.signal_locked(&mut state);
    }

    /// Mark the handle permanently invalid; the next `reset()` fails.
    pub(crate) fn invalidate(&self) {
        let mut state = self.state.lock();
        if state.invalid {
            return;
        }
        state.invalid = true;
        self.signal_locked(&mut state);
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Path of `event_path` relative to this handle, if the handle covers it.
    pub(crate) fn relative_context(&self, event_path: &Path) -> Option<PathBuf> {
        relative_context(&self.path, self.mode, event_path)
    }

    fn signal_locked(&self, state: &mut HandleState) {
        if state.signalled {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            state.signalled = true;
            self.ready.signal(me);
        }
    }
}

/// Path of `event_path` relative to `root` when a watch of `root` in `mode`
/// covers it.
pub(crate) fn relative_context(root: &Path, mode: WatchMode, event_path: &Path) -> Option<PathBuf> {
    match mode {
        WatchMode::Directory => {
            if event_path.parent() == Some(root) {
                event_path.file_name().map(PathBuf::from)
            } else {
                None
            }
        }
        WatchMode::Subtree => match event_path.strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => Some(rel.to_path_buf()),
            _ => None,
        },
    }
}

impl WatchHandle for QueuedHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn watchable(&self) -> &Path {
        &self.path
    }

    fn mode(&self) -> WatchMode {
        self.mode
    }

    fn poll_events(&self) -> Vec<WatchEvent> {
        let mut state = self.state.lock();
        state.overflowed = false;
        std::mem::take(&mut state.events)
    }

    fn reset(&self) -> bool {
        let mut state = self.state.lock();
        if state.invalid {
            return false;
        }
        if state.signalled {
            if state.events.is_empty() {
                state.signalled = false;
            } else if let Some(me) = self.me.upgrade() {
                self.ready.signal(me);
            }
        }
        true
    }

    fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.invalid = true;
            state.events.clear();
        }
        (self.on_cancel)(self);
    }
}

impl fmt::Debug for QueuedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn handle(mode: WatchMode, capacity: usize, ready: &Arc<ReadyQueue>) -> Arc<QueuedHandle> {
        QueuedHandle::new(
            HandleId(1),
            PathBuf::from("/a"),
            mode,
            EventKinds::all(),
            capacity,
            Arc::clone(ready),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn test_signal_once_until_reset() {
        let ready = Arc::new(ReadyQueue::new());
        let h = handle(WatchMode::Directory, 16, &ready);

        h.push(WatchEvent::new(EventKind::Create, "x"));
        h.push(WatchEvent::new(EventKind::Modify, "x"));

        let taken = ready.take().unwrap();
        assert_eq!(taken.id(), HandleId(1));
        // Second event did not queue the handle twice
        assert!(ready.rx.is_empty());

        assert_eq!(taken.poll_events().len(), 2);
        assert!(taken.reset());
        assert!(ready.rx.is_empty());

        h.push(WatchEvent::new(EventKind::Delete, "x"));
        assert!(ready.take().is_ok());
    }

    #[test]
    fn test_reset_requeues_when_events_arrive_during_processing() {
        let ready = Arc::new(ReadyQueue::new());
        let h = handle(WatchMode::Directory, 16, &ready);

        h.push(WatchEvent::new(EventKind::Create, "x"));
        let taken = ready.take().unwrap();
        let _ = taken.poll_events();

        h.push(WatchEvent::new(EventKind::Modify, "x"));
        assert!(ready.rx.is_empty());

        assert!(taken.reset());
        let again = ready.take().unwrap();
        assert_eq!(again.poll_events(), vec![WatchEvent::new(EventKind::Modify, "x")]);
    }

    #[test]
    fn test_overflow_on_capacity() {
        let ready = Arc::new(ReadyQueue::new());
        let h = handle(WatchMode::Directory, 2, &ready);

        for i in 0..10 {
            h.push(WatchEvent::new(EventKind::Create, format!("f{i}")));
        }
        let events = h.poll_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], WatchEvent::overflow());

        // Polling clears the overflow state
        h.push(WatchEvent::new(EventKind::Create, "g"));
        assert_eq!(h.poll_events().len(), 1);
    }

    #[test]
    fn test_invalidate_and_cancel() {
        let ready = Arc::new(ReadyQueue::new());
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancels);
        let h = QueuedHandle::new(
            HandleId(7),
            PathBuf::from("/a"),
            WatchMode::Subtree,
            EventKinds::all(),
            8,
            Arc::clone(&ready),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        h.invalidate();
        let taken = ready.take().unwrap();
        assert!(!taken.reset());

        h.cancel();
        h.cancel();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(h.is_cancelled());
    }

    #[test]
    fn test_relative_context() {
        let ready = Arc::new(ReadyQueue::new());
        let dir = handle(WatchMode::Directory, 8, &ready);
        assert_eq!(
            dir.relative_context(Path::new("/a/f.txt")),
            Some(PathBuf::from("f.txt"))
        );
        assert_eq!(dir.relative_context(Path::new("/a/b/f.txt")), None);
        assert_eq!(dir.relative_context(Path::new("/a")), None);

        let tree = handle(WatchMode::Subtree, 8, &ready);
        assert_eq!(
            tree.relative_context(Path::new("/a/b/f.txt")),
            Some(PathBuf::from("b/f.txt"))
        );
        assert_eq!(tree.relative_context(Path::new("/a")), None);
        assert_eq!(tree.relative_context(Path::new("/ab/f.txt")), None);
    }

    #[test]
    fn test_close_wakes_take() {
        let ready = Arc::new(ReadyQueue::new());
        let waiter = Arc::clone(&ready);
        let join = std::thread::spawn(move || waiter.take().is_err());
        ready.close();
        assert!(join.join().unwrap());
        assert!(ready.take().is_err());
    }
}
