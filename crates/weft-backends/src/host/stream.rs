//! One worker thread per stream.
//!
//! Submitted jobs are staged first. [`WorkQueue::flush`] hands everything
//! staged to the worker in submission order; [`WorkQueue::finish`] flushes and
//! waits until the worker is idle.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

pub(crate) type Job = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

#[derive(Default)]
struct Queue {
    staged: Vec<Job>,
    ready: VecDeque<Job>,
    in_flight: bool,
    failures: Vec<String>,
    shutdown: bool,
}

impl Queue {
    fn idle(&self) -> bool {
        self.ready.is_empty() && !self.in_flight
    }
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

pub(crate) struct WorkQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl WorkQueue {
    pub(crate) fn spawn(name: String) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            cond: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&shared))?
        };
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn submit(&self, job: Job) {
        self.shared.queue.lock().staged.push(job);
    }

    pub(crate) fn flush(&self) {
        let mut q = self.shared.queue.lock();
        if q.staged.is_empty() {
            return;
        }
        let staged = std::mem::take(&mut q.staged);
        q.ready.extend(staged);
        self.shared.cond.notify_all();
    }

    /// Flush and wait for the worker to drain. Returns the first job failure
    /// since the previous finish; later ones are logged and discarded.
    pub(crate) fn finish(&self) -> Result<(), String> {
        self.flush();
        let mut q = self.shared.queue.lock();
        while !q.idle() {
            self.shared.cond.wait(&mut q);
        }
        let mut failures = std::mem::take(&mut q.failures).into_iter();
        match failures.next() {
            Some(first) => {
                for other in failures {
                    tracing::debug!("further stream failure: {}", other);
                }
                Err(first)
            }
            None => Ok(()),
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.flush();
        {
            let mut q = self.shared.queue.lock();
            q.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("stream worker panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut q = shared.queue.lock();
            while q.ready.is_empty() && !q.shutdown {
                shared.cond.wait(&mut q);
            }
            match q.ready.pop_front() {
                Some(job) => {
                    q.in_flight = true;
                    job
                }
                None => return,
            }
        };

        let result = match catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        let mut q = shared.queue.lock();
        q.in_flight = false;
        if let Err(msg) = result {
            tracing::error!("stream job failed: {}", msg);
            q.failures.push(msg);
        }
        shared.cond.notify_all();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let what = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown payload".to_string());
    format!("panicked: {what}")
}
