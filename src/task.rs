//! The task record and the declaration forms it is built from.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::context::TaskContext;
use crate::error::TaskResult;

/// Task body signature. Bodies receive the per-run [`TaskContext`] facade
/// and report failure through the returned error.
pub(crate) type TaskFn = Arc<dyn Fn(&TaskContext) -> TaskResult<()> + Send + Sync>;

/// An opaque reference to a registered task, usable anywhere a task name is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) usize);

/// A dependency declaration: either a name (which may be registered later)
/// or a handle returned by a previous registration.
#[derive(Debug, Clone)]
pub enum DepRef {
    Name(String),
    Handle(TaskHandle),
}

impl From<&str> for DepRef {
    fn from(value: &str) -> Self {
        DepRef::Name(value.to_owned())
    }
}

impl From<String> for DepRef {
    fn from(value: String) -> Self {
        DepRef::Name(value)
    }
}

impl From<&String> for DepRef {
    fn from(value: &String) -> Self {
        DepRef::Name(value.clone())
    }
}

impl From<TaskHandle> for DepRef {
    fn from(value: TaskHandle) -> Self {
        DepRef::Handle(value)
    }
}

/// One declared input or output. Expansion is deferred until the task is
/// about to execute so that it reflects the filesystem of that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePattern {
    /// A path taken as-is.
    Path(Utf8PathBuf),
    /// A unix-style glob, expanded to the sorted list of matches.
    Glob(String),
    /// An output template; `%` is replaced with each input's stem.
    /// Only valid as an output.
    Template(String),
}

impl From<&str> for FilePattern {
    fn from(value: &str) -> Self {
        FilePattern::Path(Utf8PathBuf::from(value))
    }
}

impl From<String> for FilePattern {
    fn from(value: String) -> Self {
        FilePattern::Path(Utf8PathBuf::from(value))
    }
}

impl From<Utf8PathBuf> for FilePattern {
    fn from(value: Utf8PathBuf) -> Self {
        FilePattern::Path(value)
    }
}

impl From<&Utf8Path> for FilePattern {
    fn from(value: &Utf8Path) -> Self {
        FilePattern::Path(value.to_owned())
    }
}

/// Declare a glob input or output, expanded when the task executes.
pub fn glob(expression: impl Into<String>) -> FilePattern {
    FilePattern::Glob(expression.into())
}

/// Declare a templated output. Each concrete input contributes one output,
/// produced by substituting the input's stem (base name without its last
/// extension) for every `%` in the template.
pub fn pattern(template: impl Into<String>) -> FilePattern {
    FilePattern::Template(template.into())
}

/// A registered task: name, dependency declarations, declared i/o, body
/// and optional documentation shown by task listings.
pub(crate) struct Task {
    pub name: String,
    pub deps: Vec<DepRef>,
    pub inputs: Vec<FilePattern>,
    pub outputs: Vec<FilePattern>,
    pub body: TaskFn,
    pub doc: Option<String>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("doc", &self.doc)
            .finish_non_exhaustive()
    }
}
