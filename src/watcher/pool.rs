//! Fixed-size worker pool for listener fan-out.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::error::WatchError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs on a fixed set of named threads.
pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize) -> Result<Self, WatchError> {
        let (sender, receiver) = unbounded::<Job>();
        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let receiver = receiver.clone();
            let name = format!("watchmux-dispatch-{i}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(receiver))
                .map_err(|source| WatchError::ThreadSpawn { name, source })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job. Hands the job back if the pool is shut down.
    pub(crate) fn offer(&self, job: Job) -> Result<(), Job> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    /// Queue a job, running it on the calling thread if the pool is shut down.
    pub(crate) fn execute(&self, job: Job) {
        if let Err(job) = self.offer(job) {
            run_job(job);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs. Workers exit once the queue is drained.
    pub(crate) fn close(&self) {
        drop(self.sender.lock().take());
    }

    /// Close, let queued jobs finish and join the workers.
    pub(crate) fn shutdown(&self) {
        self.close();
        self.join();
    }

    /// Wait for the workers of a closed pool. The calling thread is skipped
    /// when it is one of them.
    pub(crate) fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.get_mut().take());
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    for job in receiver {
        run_job(job);
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("[watcher] dispatch job panicked");
    }
}
