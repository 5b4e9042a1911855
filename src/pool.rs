//! The single bounded worker pool shared by top-level task dispatch and
//! in-task sub-work.
//!
//! With a bound of one the pool holds no threads at all: submissions run
//! inline on the caller's thread, which keeps single-job builds and the
//! in-task sub-executor semantically identical to the parallel case.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Run a fallible unit, turning a panic into an ordinary error so a
/// misbehaving task can never wedge the scheduler.
pub(crate) fn run_caught<T>(unit: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(unit)) {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_owned()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "opaque panic payload".to_owned()
            };
            Err(anyhow::anyhow!("panicked: {message}"))
        }
    }
}

/// Completion handle for one submitted unit. The result (or the error the
/// unit failed with) stays observable for as long as the handle is held;
/// the pool itself never logs or swallows it.
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

enum SlotState<T> {
    Pending,
    Done(anyhow::Result<T>),
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            state: Mutex::new(SlotState::Pending),
            cond: Condvar::new(),
        }
    }

    fn fill(&self, result: anyhow::Result<T>) {
        let mut state = self.state.lock().unwrap();
        *state = SlotState::Done(result);
        self.cond.notify_all();
    }
}

impl<T> Completion<T> {
    /// Block until the unit finished and take its result.
    pub fn wait(self) -> anyhow::Result<T> {
        let mut state = self.slot.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, SlotState::Pending) {
                SlotState::Done(result) => return result,
                SlotState::Pending => state = self.slot.cond.wait(state).unwrap(),
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.slot.state.lock().unwrap(), SlotState::Done(_))
    }
}

/// Bounded executor. Cloning shares the same workers and bound.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `jobs` must be at least one; one means inline execution.
    pub fn new(jobs: usize) -> Self {
        assert!(jobs >= 1, "worker pool requires at least one job slot");
        if jobs == 1 {
            return WorkerPool { inner: None };
        }

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..jobs)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("pake-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkerPool {
            inner: Some(Arc::new(Inner {
                tx: Some(tx),
                workers,
            })),
        }
    }

    /// Submit a unit of work. Inline pools run it before returning.
    pub fn submit<T, F>(&self, job: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let slot = Arc::new(Slot::new());
        let filled = Arc::clone(&slot);
        let unit = move || filled.fill(run_caught(job));

        match &self.inner {
            None => unit(),
            Some(inner) => inner
                .tx
                .as_ref()
                .expect("pool is shut down")
                .send(Box::new(unit))
                .expect("worker threads are gone"),
        }

        Completion { slot }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // closing the channel lets the workers drain their queue and exit
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
