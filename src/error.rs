use std::fmt;
use std::panic::Location;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::returncodes;

/// Result type returned by task bodies and multitask units.
pub type TaskResult<T> = anyhow::Result<T>;

/// Errors detected while resolving the run set, before any task body runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("task name cannot be empty")]
    EmptyTaskName,

    #[error("task \"{0}\" is already defined")]
    TaskRedefined(String),

    #[error("task \"{0}\" is not defined")]
    UndefinedTask(String),

    #[error("cyclic dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("task \"{0}\" declares outputs but no inputs")]
    OutputsWithoutInputs(String),

    #[error("no tasks are defined")]
    NoTasksDefined,

    #[error("no tasks specified and no default tasks exist")]
    NoTasksSpecified,
}

impl ConfigError {
    pub fn return_code(&self) -> i32 {
        match self {
            ConfigError::EmptyTaskName => returncodes::ERROR,
            ConfigError::TaskRedefined(_) => returncodes::ERROR,
            ConfigError::UndefinedTask(_) => returncodes::UNDEFINED_TASK,
            ConfigError::CyclicDependency(_) => returncodes::CYCLIC_DEPENDENCY,
            ConfigError::OutputsWithoutInputs(_) => returncodes::OUTPUTS_WITHOUT_INPUTS,
            ConfigError::NoTasksDefined => returncodes::NO_TASKS_DEFINED,
            ConfigError::NoTasksSpecified => returncodes::NO_TASKS_TO_RUN,
        }
    }
}

/// A declared input that does not exist on disk. Fatal for the task.
#[derive(Debug, Error)]
#[error("input file \"{path}\" of task \"{task}\" does not exist")]
pub struct MissingInputError {
    pub task: String,
    pub path: Utf8PathBuf,
}

/// A task whose concrete inputs expanded to nothing while outputs remain
/// declared. Carries the same exit code as the declaration-time check.
#[derive(Debug, Error)]
#[error("task \"{task}\" declares outputs but its inputs expanded to nothing")]
pub struct OutputsWithoutInputsError {
    pub task: String,
}

/// The call site of a failed subprocess or sub-build invocation.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    pub(crate) fn caller(location: &'static Location<'static>) -> Self {
        CallSite {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A subprocess started through a task context exited with a non-zero
/// status (and `ignore_errors` was not set).
#[derive(Debug)]
pub struct SubprocessError {
    pub task: String,
    pub site: CallSite,
    pub cmd: Vec<String>,
    pub code: i32,
    pub output: Vec<u8>,
}

impl fmt::Display for SubprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "subprocess failed in task \"{}\" at {}",
            self.task, self.site
        )?;
        writeln!(f, "command: {:?}", self.cmd)?;
        writeln!(f, "exit status: {}", self.code)?;
        writeln!(f, "--- captured output ---")?;
        f.write_str(&String::from_utf8_lossy(&self.output))?;
        write!(f, "--- end captured output ---")
    }
}

impl std::error::Error for SubprocessError {}

/// A sub-build exited with a non-zero status.
#[derive(Debug)]
pub struct SubpakeError {
    pub task: String,
    pub site: CallSite,
    pub script: Utf8PathBuf,
    pub cmd: Vec<String>,
    pub code: i32,
    pub output: Vec<u8>,
}

impl fmt::Display for SubpakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "sub-build \"{}\" failed in task \"{}\" at {}",
            self.script, self.task, self.site
        )?;
        writeln!(f, "command: {:?}", self.cmd)?;
        writeln!(f, "exit status: {}", self.code)?;
        writeln!(f, "--- captured output ---")?;
        f.write_str(&String::from_utf8_lossy(&self.output))?;
        write!(f, "--- end captured output ---")
    }
}

impl std::error::Error for SubpakeError {}

/// Early termination requested from inside a task body.
///
/// Constructed through [`crate::terminate`]. A code of zero exits the
/// process successfully and prints no failure report.
#[derive(Debug, Error)]
#[error("build terminated with exit code {code}")]
pub struct Terminate {
    pub code: i32,
}

/// One failed task, as recorded by the driver.
#[derive(Debug)]
pub struct TaskFailure {
    /// Registration index of the failing task, used to pick the first
    /// failure for the process exit code.
    pub(crate) id: usize,
    pub task: String,
    pub error: anyhow::Error,
}

impl TaskFailure {
    /// Exit code this failure maps to under the stable contract.
    pub fn return_code(&self) -> i32 {
        let err = &self.error;
        if let Some(term) = err.downcast_ref::<Terminate>() {
            if term.code == 0 {
                returncodes::SUCCESS
            } else {
                returncodes::TERMINATED
            }
        } else if err.downcast_ref::<SubpakeError>().is_some() {
            returncodes::SUBPAKE_EXCEPTION
        } else if err.downcast_ref::<SubprocessError>().is_some() {
            returncodes::SUBPROCESS_EXCEPTION
        } else if err.downcast_ref::<MissingInputError>().is_some() {
            returncodes::TASK_INPUT_NOT_FOUND
        } else if err.downcast_ref::<OutputsWithoutInputsError>().is_some() {
            returncodes::OUTPUTS_WITHOUT_INPUTS
        } else {
            returncodes::TASK_EXCEPTION
        }
    }

    /// Short name for the failure kind, used in the report header.
    pub fn kind(&self) -> &'static str {
        let err = &self.error;
        if err.downcast_ref::<Terminate>().is_some() {
            "terminate"
        } else if err.downcast_ref::<SubpakeError>().is_some() {
            "sub-build failure"
        } else if err.downcast_ref::<SubprocessError>().is_some() {
            "subprocess failure"
        } else if err.downcast_ref::<MissingInputError>().is_some() {
            "missing input"
        } else if err.downcast_ref::<OutputsWithoutInputsError>().is_some() {
            "outputs without inputs"
        } else {
            "task error"
        }
    }
}

/// Every execution failure collected from one run.
///
/// The process exit code is that of the earliest-registered failing task.
#[derive(Debug, Default)]
pub struct TaskAggregate {
    pub failures: Vec<TaskFailure>,
}

impl TaskAggregate {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn push(&mut self, failure: TaskFailure) {
        self.failures.push(failure);
    }

    /// The failure of the earliest-registered failing task.
    pub fn first(&self) -> Option<&TaskFailure> {
        self.failures.iter().min_by_key(|f| f.id)
    }

    pub fn return_code(&self) -> i32 {
        self.first()
            .map(TaskFailure::return_code)
            .unwrap_or(returncodes::SUCCESS)
    }
}
