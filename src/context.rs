//! The per-task facade handed to every executing task body.

use std::fmt::Display;
use std::io::{self, Write};
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8PathBuf;

use crate::error::{CallSite, TaskResult};
use crate::outdated::ConcreteIo;
use crate::pool::{Completion, WorkerPool};
use crate::process::{self, CallOpts, IntoArgs};
use crate::subpake::{self, SubpakeOpts};
use crate::Pake;

/// Per-task byte queue. With output synchronization on, everything a task
/// (and its subprocesses) produces is buffered here and flushed to stdout
/// as one block once the task completes. With synchronization off, writes
/// go straight to process stdout and may interleave with other tasks.
pub(crate) struct OutputQueue {
    sync: bool,
    buf: Mutex<Vec<u8>>,
}

impl OutputQueue {
    pub fn new(sync: bool) -> Self {
        OutputQueue {
            sync,
            buf: Mutex::new(Vec::new()),
        }
    }

    /// Acquire the queue for writing. The guard holds the buffer lock for
    /// its lifetime; in unsynchronized mode it holds only the stdout lock
    /// the standard library already imposes.
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            inner: if self.sync {
                GuardInner::Buffered(self.buf.lock().unwrap())
            } else {
                GuardInner::Direct(io::stdout().lock())
            },
        }
    }

    /// Drain the buffered bytes. Empty in unsynchronized mode.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock().unwrap())
    }
}

/// Write access to a task's output queue; see [`OutputQueue::lock`].
pub struct QueueGuard<'a> {
    inner: GuardInner<'a>,
}

enum GuardInner<'a> {
    Buffered(MutexGuard<'a, Vec<u8>>),
    Direct(io::StdoutLock<'static>),
}

impl Write for QueueGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            GuardInner::Buffered(bytes) => {
                bytes.extend_from_slice(buf);
                Ok(buf.len())
            }
            GuardInner::Direct(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            GuardInner::Buffered(_) => Ok(()),
            GuardInner::Direct(stdout) => stdout.flush(),
        }
    }
}

/// The structured surface a running task body sees.
///
/// A context lives exactly as long as one execution of its task: it is
/// created after the task's declarations are expanded against the current
/// filesystem and dropped when the body returns.
pub struct TaskContext {
    pake: Arc<Pake>,
    id: usize,
    io: ConcreteIo,
    dependency_outputs: Vec<Utf8PathBuf>,
    queue: Arc<OutputQueue>,
    pool: WorkerPool,
}

impl TaskContext {
    pub(crate) fn new(
        pake: Arc<Pake>,
        id: usize,
        io: ConcreteIo,
        dependency_outputs: Vec<Utf8PathBuf>,
        queue: Arc<OutputQueue>,
        pool: WorkerPool,
    ) -> Self {
        TaskContext {
            pake,
            id,
            io,
            dependency_outputs,
            queue,
            pool,
        }
    }

    /// Name of the executing task.
    pub fn name(&self) -> &str {
        self.pake.task_name(self.id)
    }

    /// The registry this task belongs to, for define lookups.
    pub fn pake(&self) -> &Pake {
        &self.pake
    }

    /// All concrete input files, expanded at execution time.
    pub fn inputs(&self) -> &[Utf8PathBuf] {
        &self.io.inputs
    }

    /// All concrete output files.
    pub fn outputs(&self) -> &[Utf8PathBuf] {
        &self.io.outputs
    }

    /// Inputs considered out of date for this execution.
    pub fn outdated_inputs(&self) -> &[Utf8PathBuf] {
        &self.io.outdated_inputs
    }

    /// Outputs considered out of date for this execution.
    pub fn outdated_outputs(&self) -> &[Utf8PathBuf] {
        &self.io.outdated_outputs
    }

    /// Out-of-date `(input, output)` pairs under the element-wise pairing
    /// rule. Empty when the input and output counts differ.
    pub fn outdated_pairs(&self) -> &[(Utf8PathBuf, Utf8PathBuf)] {
        &self.io.outdated_pairs
    }

    /// Concrete outputs of this task's immediate dependencies, flattened,
    /// as they stood when this task started.
    pub fn dependency_outputs(&self) -> &[Utf8PathBuf] {
        &self.dependency_outputs
    }

    /// Acquire the output queue lock. Everything written through the
    /// returned guard lands in the task's output block without
    /// interleaving. A no-op passthrough when synchronization is off.
    pub fn io_lock(&self) -> QueueGuard<'_> {
        self.queue.lock()
    }

    /// Append raw bytes to the task output.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.queue.lock().write_all(bytes)
    }

    /// Append display output without a trailing newline.
    pub fn print(&self, text: impl Display) -> io::Result<()> {
        self.write(text.to_string().as_bytes())
    }

    /// Append one line to the task output.
    pub fn println(&self, text: impl Display) -> io::Result<()> {
        self.write(format!("{text}\n").as_bytes())
    }

    /// Run a command, relaying its output (stderr merged into stdout) into
    /// the task's output queue. Returns the exit code; a non-zero code is
    /// an error.
    #[track_caller]
    pub fn call<A: IntoArgs>(&self, args: A) -> TaskResult<i32> {
        self.call_at(args, CallOpts::default(), Location::caller())
    }

    /// [`call`](Self::call) with explicit options.
    #[track_caller]
    pub fn call_with<A: IntoArgs>(&self, args: A, opts: CallOpts) -> TaskResult<i32> {
        self.call_at(args, opts, Location::caller())
    }

    fn call_at<A: IntoArgs>(
        &self,
        args: A,
        opts: CallOpts,
        location: &'static Location<'static>,
    ) -> TaskResult<i32> {
        let argv = args.into_args();
        process::run_call(
            &argv,
            self.name(),
            CallSite::caller(location),
            &self.queue,
            &opts,
        )
    }

    /// Run a command quietly and return its exit code; non-zero fails.
    #[track_caller]
    pub fn check_call<A: IntoArgs>(&self, args: A) -> TaskResult<i32> {
        let argv = args.into_args();
        process::run_check_call(&argv, self.name(), CallSite::caller(Location::caller()))
    }

    /// Run a command quietly and return its captured output; non-zero
    /// fails. Nothing is relayed to the task queue.
    #[track_caller]
    pub fn check_output<A: IntoArgs>(&self, args: A) -> TaskResult<Vec<u8>> {
        let argv = args.into_args();
        process::run_check_output(&argv, self.name(), CallSite::caller(Location::caller()))
    }

    /// Run another build file, bracketed by enter/exit banners. The first
    /// argument is the build-file executable; the rest are passed to it.
    /// Exports registered on this build are piped to the child's stdin.
    #[track_caller]
    pub fn subpake<A: IntoArgs>(&self, args: A) -> TaskResult<i32> {
        self.subpake_at(args, SubpakeOpts::default(), Location::caller())
    }

    /// [`subpake`](Self::subpake) with explicit options.
    #[track_caller]
    pub fn subpake_with<A: IntoArgs>(&self, args: A, opts: SubpakeOpts) -> TaskResult<i32> {
        self.subpake_at(args, opts, Location::caller())
    }

    fn subpake_at<A: IntoArgs>(
        &self,
        args: A,
        opts: SubpakeOpts,
        location: &'static Location<'static>,
    ) -> TaskResult<i32> {
        let argv = args.into_args();
        subpake::run(subpake::Invocation {
            argv: &argv,
            task: self.name(),
            site: CallSite::caller(location),
            queue: &self.queue,
            exports: self.pake.exports(),
            depth: self.pake.depth(),
            parent_sync: self.pake.sync_output(),
            opts: &opts,
        })
    }

    /// Open a scope for submitting sub-work onto the shared worker pool.
    ///
    /// The scope end waits for every submitted unit. If any unit failed,
    /// the error of the earliest submission propagates; the remaining
    /// units still run to completion and their results are discarded.
    pub fn multitask<R>(&self, scope: impl FnOnce(&mut Multitask) -> TaskResult<R>) -> TaskResult<R> {
        let mut mt = Multitask {
            pool: self.pool.clone(),
            pending: Vec::new(),
        };
        let result = scope(&mut mt);
        let unit_error = mt.finish();
        match result {
            Err(err) => Err(err),
            Ok(value) => match unit_error {
                Some(err) => Err(err),
                None => Ok(value),
            },
        }
    }
}

/// Sub-work scope created by [`TaskContext::multitask`]. Submissions share
/// the run's worker pool and are bounded by the same job count.
pub struct Multitask {
    pool: WorkerPool,
    pending: Vec<Completion<()>>,
}

impl Multitask {
    /// Submit one unit of work. With a single-job pool the unit executes
    /// immediately on the calling thread.
    pub fn submit(&mut self, unit: impl FnOnce() -> TaskResult<()> + Send + 'static) {
        self.pending.push(self.pool.submit(unit));
    }

    /// Wait for every unit; keep the earliest-submitted failure.
    fn finish(self) -> Option<anyhow::Error> {
        let mut first = None;
        for completion in self.pending {
            if let Err(err) = completion.wait() {
                if first.is_none() {
                    first = Some(err);
                }
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronized_queue_buffers_until_taken() {
        let queue = OutputQueue::new(true);
        queue.lock().write_all(b"one ").unwrap();
        queue.lock().write_all(b"two").unwrap();
        assert_eq!(queue.take(), b"one two");
        assert!(queue.take().is_empty());
    }

    #[test]
    fn guard_keeps_a_block_contiguous() {
        let queue = OutputQueue::new(true);
        {
            let mut guard = queue.lock();
            guard.write_all(b"a").unwrap();
            guard.write_all(b"b").unwrap();
        }
        assert_eq!(queue.take(), b"ab");
    }

    #[test]
    fn unsynchronized_queue_never_buffers() {
        let queue = OutputQueue::new(false);
        // writes go straight to stdout; nothing accumulates for flushing
        assert!(queue.take().is_empty());
    }
}
