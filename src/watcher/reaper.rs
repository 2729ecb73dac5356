//! Background cleanup for dropped listener tokens.
//!
//! Dropping a [`super::ListenerToken`] without removing it hands the removal
//! to the reaper instead of running it inside `Drop`, which may happen on a
//! listener callback or while the caller holds locks. The reaper thread is
//! started on demand and exits after an idle period once nothing is tracked.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use super::error::WatchError;

pub(crate) type ReapJob = Box<dyn FnOnce() + Send + 'static>;

struct ReaperState {
    /// Live thread's job queue. `None` while no thread runs.
    sender: Option<Sender<ReapJob>>,
    /// Tokens issued and not yet removed.
    tracked: usize,
    stopped: bool,
    generation: u64,
}

pub(crate) struct Reaper {
    state: Mutex<ReaperState>,
    idle_timeout: Duration,
}

impl Reaper {
    pub(crate) fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReaperState {
                sender: None,
                tracked: 0,
                stopped: false,
                generation: 0,
            }),
            idle_timeout,
        })
    }

    /// Account for a new token and make sure a thread is around to reap it.
    pub(crate) fn track(self: &Arc<Self>) -> Result<(), WatchError> {
        let mut state = self.state.lock();
        if !state.stopped && state.sender.is_none() {
            let sender = self.start(&mut state)?;
            state.sender = Some(sender);
        }
        state.tracked += 1;
        Ok(())
    }

    /// A tracked token was removed explicitly.
    pub(crate) fn untrack(&self) {
        let mut state = self.state.lock();
        state.tracked = state.tracked.saturating_sub(1);
    }

    /// Run `job` on the reaper thread. The job accounts for one tracked token.
    pub(crate) fn submit(self: &Arc<Self>, job: ReapJob) {
        let job = {
            let mut state = self.state.lock();
            if !state.stopped && state.sender.is_none() {
                match self.start(&mut state) {
                    Ok(sender) => state.sender = Some(sender),
                    Err(e) => tracing::warn!("[reaper] {e}, reaping inline"),
                }
            }
            match state.sender.as_ref() {
                Some(sender) => sender.send(job).err().map(|e| e.into_inner()),
                None => Some(job),
            }
        };
        if let Some(job) = job {
            run_job(job);
            self.untrack();
        }
    }

    /// Stop accepting jobs; later drops reap on the dropping thread.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.sender = None;
    }

    pub(crate) fn tracked(&self) -> usize {
        self.state.lock().tracked
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().sender.is_some()
    }

    fn start(self: &Arc<Self>, state: &mut ReaperState) -> Result<Sender<ReapJob>, WatchError> {
        let (sender, receiver) = unbounded();
        state.generation += 1;
        let generation = state.generation;
        let reaper = Arc::clone(self);
        let name = "watchmux-reaper".to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || reaper.run(receiver, generation))
            .map_err(|source| WatchError::ThreadSpawn { name, source })?;
        crate::debug_event!("reaper", "started", "generation {generation}");
        Ok(sender)
    }

    fn run(&self, receiver: Receiver<ReapJob>, generation: u64) {
        loop {
            match receiver.recv_timeout(self.idle_timeout) {
                Ok(job) => {
                    run_job(job);
                    self.untrack();
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = self.state.lock();
                    if state.tracked > 0 {
                        continue;
                    }
                    if state.generation == generation {
                        state.sender = None;
                    }
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Jobs sent before the sender was cleared
        while let Ok(job) = receiver.try_recv() {
            run_job(job);
            self.untrack();
        }
        crate::debug_event!("reaper", "exited", "generation {generation}");
    }
}

fn run_job(job: ReapJob) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("[reaper] cleanup job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn test_jobs_run_and_untrack() {
        let reaper = Reaper::new(Duration::from_secs(5));
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            reaper.track().unwrap();
        }
        assert!(reaper.is_running());

        for _ in 0..3 {
            let ran = ran.clone();
            reaper.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(wait_until(Duration::from_secs(5), || reaper.tracked() == 0));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_idle_exit_and_restart() {
        let reaper = Reaper::new(Duration::from_millis(20));
        reaper.track().unwrap();
        reaper.untrack();
        assert!(wait_until(Duration::from_secs(5), || !reaper.is_running()));

        let ran = Arc::new(AtomicUsize::new(0));
        reaper.track().unwrap();
        assert!(reaper.is_running());
        let flag = ran.clone();
        reaper.submit(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_panicking_job_keeps_thread_alive() {
        let reaper = Reaper::new(Duration::from_secs(5));
        reaper.track().unwrap();
        reaper.track().unwrap();
        reaper.submit(Box::new(|| panic!("cleanup bug")));

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        reaper.submit(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 1));
        assert!(wait_until(Duration::from_secs(5), || reaper.tracked() == 0));
    }

    #[test]
    fn test_stopped_reaper_runs_inline() {
        let reaper = Reaper::new(Duration::from_secs(5));
        reaper.track().unwrap();
        reaper.stop();

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        reaper.submit(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(reaper.tracked(), 0);
    }
}
