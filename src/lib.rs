#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod console;
mod context;
mod defines;
mod error;
mod executor;
pub mod fileutil;
mod graph;
mod outdated;
mod pool;
mod process;
mod program;
pub mod returncodes;
mod subpake;
mod task;

use std::collections::HashMap;

pub use crate::console::{print_error, print_warning};
pub use crate::context::{Multitask, QueueGuard, TaskContext};
pub use crate::defines::{parse_literal, Defines, LiteralError, Value};
pub use crate::error::{
    CallSite, ConfigError, MissingInputError, OutputsWithoutInputsError, SubpakeError,
    SubprocessError, TaskAggregate, TaskFailure, TaskResult, Terminate,
};
pub use crate::process::{CallOpts, CmdArg, IntoArgs};
pub use crate::program::{init, init_from, run, run_code, InitError, SYNC_OUTPUT_ENV};
pub use crate::subpake::SubpakeOpts;
pub use crate::task::{glob, pattern, DepRef, FilePattern, TaskHandle};

use crate::program::ProgramOptions;
use crate::task::{Task, TaskFn};

/// Produce the early-termination error a task body returns to stop the
/// whole build. In-flight tasks finish; no new tasks start. A code of
/// zero exits successfully and prints nothing.
pub fn terminate(code: i32) -> anyhow::Error {
    Terminate { code }.into()
}

/// The build registry: every registered task plus the run configuration
/// parsed from the command line.
///
/// A build file obtains one from [`init`], registers tasks against it and
/// hands it to [`run`]:
///
/// ```no_run
/// let mut pk = pake::init();
///
/// pk.task("build")
///     .inputs([pake::glob("src/*.c")])
///     .outputs([pake::pattern("obj/%.o")])
///     .body(|ctx| {
///         for (i, o) in ctx.outdated_pairs() {
///             ctx.call(("gcc", "-c", i, "-o", o))?;
///         }
///         Ok(())
///     })
///     .unwrap();
///
/// pake::run(pk, &["build"]);
/// ```
#[derive(Debug)]
pub struct Pake {
    tasks: Vec<Task>,
    by_name: HashMap<String, usize>,
    defines: Defines,
    exports: Vec<(String, Value)>,
    opts: ProgramOptions,
}

impl Pake {
    pub(crate) fn new(defines: Defines, opts: ProgramOptions) -> Self {
        Pake {
            tasks: Vec::new(),
            by_name: HashMap::new(),
            defines,
            exports: Vec::new(),
            opts,
        }
    }

    /// Begin registering a task. The returned builder collects
    /// dependencies, inputs, outputs and documentation, and registers the
    /// task once [`TaskBuilder::body`] is called.
    pub fn task(&mut self, name: impl Into<String>) -> TaskBuilder<'_> {
        TaskBuilder {
            pake: self,
            name: name.into(),
            deps: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            doc: None,
        }
    }

    /// Register a task with a body and nothing else. Equivalent to
    /// `self.task(name).body(body)`.
    pub fn add_task<F>(&mut self, name: impl Into<String>, body: F) -> Result<TaskHandle, ConfigError>
    where
        F: Fn(&TaskContext) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.task(name).body(body)
    }

    fn insert(&mut self, task: Task) -> Result<TaskHandle, ConfigError> {
        if task.name.is_empty() {
            return Err(ConfigError::EmptyTaskName);
        }
        if self.by_name.contains_key(&task.name) {
            return Err(ConfigError::TaskRedefined(task.name));
        }
        let id = self.tasks.len();
        self.by_name.insert(task.name.clone(), id);
        self.tasks.push(task);
        Ok(TaskHandle(id))
    }

    /// Look up a define by name.
    pub fn get_define(&self, name: &str) -> Option<&Value> {
        self.defines.get(name)
    }

    pub fn has_define(&self, name: &str) -> bool {
        self.defines.has(name)
    }

    /// Set a define programmatically. Meaningful only before the run
    /// starts; defines are frozen once tasks execute.
    pub fn set_define(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.defines.insert(name, value.into());
    }

    /// Mark a value for propagation to every sub-build started from this
    /// build's tasks. Re-exporting a name replaces its value.
    pub fn export(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.unexport(&name);
        self.exports.push((name, value.into()));
    }

    /// Stop propagating a previously exported name.
    pub fn unexport(&mut self, name: &str) {
        self.exports.retain(|(existing, _)| existing != name);
    }

    /// How many builds deep this invocation is; zero for a top-level run.
    pub fn depth(&self) -> u32 {
        self.opts.depth
    }

    /// Whether per-task output buffering is active for this run.
    pub fn sync_output(&self) -> bool {
        self.opts.sync_output
    }

    /// Working directory at the end of initialization, after any `-C`.
    pub fn init_dir(&self) -> &camino::Utf8Path {
        &self.opts.init_dir
    }

    /// The parallelism bound the run will use.
    pub fn jobs(&self) -> usize {
        self.opts.jobs
    }

    pub fn is_dry_run(&self) -> bool {
        self.opts.dry_run
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Registered task names, in registration order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn task_at(&self, id: usize) -> &Task {
        &self.tasks[id]
    }

    pub(crate) fn task_name(&self, id: usize) -> &str {
        &self.tasks[id].name
    }

    pub(crate) fn task_deps(&self, id: usize) -> &[DepRef] {
        &self.tasks[id].deps
    }

    pub(crate) fn exports(&self) -> &[(String, Value)] {
        &self.exports
    }

    pub(crate) fn opts(&self) -> &ProgramOptions {
        &self.opts
    }
}

/// Collects one task's declaration; see [`Pake::task`].
pub struct TaskBuilder<'a> {
    pake: &'a mut Pake,
    name: String,
    deps: Vec<DepRef>,
    inputs: Vec<FilePattern>,
    outputs: Vec<FilePattern>,
    doc: Option<String>,
}

impl TaskBuilder<'_> {
    /// Declare tasks that must complete before this one runs, by name or
    /// by handle. Names may refer to tasks registered later.
    pub fn after<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<DepRef>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Declare input files for change detection.
    pub fn inputs<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<FilePattern>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Declare output files for change detection.
    pub fn outputs<I>(mut self, outputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<FilePattern>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Attach documentation shown by the `-ti` listing.
    pub fn doc(mut self, text: impl Into<String>) -> Self {
        self.doc = Some(text.into());
        self
    }

    /// Attach the body and register the task.
    pub fn body<F>(self, body: F) -> Result<TaskHandle, ConfigError>
    where
        F: Fn(&TaskContext) -> TaskResult<()> + Send + Sync + 'static,
    {
        let body: TaskFn = std::sync::Arc::new(body);
        self.pake.insert(Task {
            name: self.name,
            deps: self.deps,
            inputs: self.inputs,
            outputs: self.outputs,
            body,
            doc: self.doc,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_instance() -> Pake {
    Pake::new(Defines::default(), ProgramOptions::default())
}
