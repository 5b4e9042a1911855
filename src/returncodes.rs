//! Process exit codes, a stable contract shared with parent builds.
//!
//! A build invoked as a sub-build is observed only through its exit status
//! and output, so these values must never be renumbered.

/// Success.
pub const SUCCESS: i32 = 0;

/// No build file was found in the target directory, or a specified build
/// file does not exist.
pub const BUILD_FILE_NOT_FOUND: i32 = 1;

/// Bad combination of command line arguments.
pub const BAD_ARGUMENTS: i32 = 2;

/// The build file registered no tasks at all.
pub const NO_TASKS_DEFINED: i32 = 3;

/// No tasks were requested and the build file declares no default tasks.
pub const NO_TASKS_TO_RUN: i32 = 4;

/// A task's input file is missing.
pub const TASK_INPUT_NOT_FOUND: i32 = 5;

/// A task declares output files without declaring any inputs.
pub const OUTPUTS_WITHOUT_INPUTS: i32 = 6;

/// An undefined task was referenced.
pub const UNDEFINED_TASK: i32 = 7;

/// A cyclic dependency was detected.
pub const CYCLIC_DEPENDENCY: i32 = 8;

/// An unhandled error escaped a task body.
pub const TASK_EXCEPTION: i32 = 9;

/// A sub-build exited with a non-zero status.
pub const SUBPAKE_EXCEPTION: i32 = 10;

/// A subprocess started by a task exited with a non-zero status.
pub const SUBPROCESS_EXCEPTION: i32 = 11;

/// A task requested early termination with a non-zero code.
pub const TERMINATED: i32 = 12;

/// Any other error raised by the orchestrator itself.
pub const ERROR: i32 = 13;
