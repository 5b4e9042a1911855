//! Build-file program lifecycle: argument parsing, initialization and the
//! run entry points that map every outcome onto the stable exit codes.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::absolute;
use std::process::exit;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use tracing::debug;

use crate::console::print_error;
use crate::defines::{self, Defines};
use crate::error::{ConfigError, TaskAggregate, TaskFailure, Terminate};
use crate::executor;
use crate::{returncodes, Pake};

/// Command line accepted by every build file.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pake",
    version,
    about = "Run tasks from this build file.",
    long_about = None
)]
pub(crate) struct CliArgs {
    /// Tasks to run, in order. Defaults to the build file's default tasks.
    pub tasks: Vec<String>,

    /// Add a defined value. VALUE is parsed as a literal; a bare KEY
    /// defines boolean true.
    #[arg(short = 'D', long = "define", value_name = "KEY[=VALUE]")]
    pub define: Vec<String>,

    /// Read a literal mapping of defines from standard input before
    /// applying -D overrides.
    #[arg(long = "stdin-defines")]
    pub stdin_defines: bool,

    /// Maximum number of tasks running in parallel.
    #[arg(
        short = 'j',
        long = "jobs",
        value_name = "N",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub jobs: u32,

    /// List the tasks that would execute, in order, without running them.
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Change the working directory before running.
    #[arg(short = 'C', long = "directory", value_name = "DIR")]
    pub directory: Option<Utf8PathBuf>,

    /// List all task names.
    #[arg(short = 't', long = "show-tasks")]
    pub show_tasks: bool,

    /// With -t (as -ti): include task documentation in the listing.
    #[arg(short = 'i', long = "show-task-info")]
    pub show_task_info: bool,

    /// Buffer each task's output and print it as one block. Inherited by
    /// sub-builds unless they are given their own value.
    #[arg(long = "sync-output", value_name = "{true,false,1,0}", value_parser = parse_sync_flag)]
    pub sync_output: Option<bool>,

    #[arg(long = "s-depth", hide = true, default_value_t = 0)]
    pub s_depth: u32,
}

fn parse_sync_flag(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(format!("expected true, false, 1 or 0, got \"{other}\"")),
    }
}

/// Environment variable supplying the output-synchronization default when
/// `--sync-output` is absent.
pub const SYNC_OUTPUT_ENV: &str = "PAKE_SYNC_OUTPUT";

/// Why initialization could not produce a [`Pake`] instance.
#[derive(Debug)]
pub enum InitError {
    /// Argument parsing failed (or `--help`/`--version` was requested).
    Usage(clap::Error),
    /// Arguments parsed but their combination or environment is invalid.
    BadArguments(String),
    /// Reading stdin defines or changing directory failed.
    Init(String),
}

impl InitError {
    pub fn return_code(&self) -> i32 {
        use clap::error::ErrorKind;
        match self {
            InitError::Usage(err) => match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => returncodes::SUCCESS,
                _ => returncodes::BAD_ARGUMENTS,
            },
            InitError::BadArguments(_) => returncodes::BAD_ARGUMENTS,
            InitError::Init(_) => returncodes::ERROR,
        }
    }

    /// Print the problem and exit with the matching code.
    pub fn exit(self) -> ! {
        match self {
            InitError::Usage(err) => err.exit(),
            InitError::BadArguments(message) => {
                print_error(format!("pake: error: {message}"));
                exit(returncodes::BAD_ARGUMENTS);
            }
            InitError::Init(message) => {
                print_error(format!("pake: error: {message}"));
                exit(returncodes::ERROR);
            }
        }
    }
}

/// Per-run settings resolved during initialization.
#[derive(Debug, Clone)]
pub(crate) struct ProgramOptions {
    pub requested: Vec<String>,
    pub jobs: usize,
    pub dry_run: bool,
    pub show_tasks: bool,
    pub show_task_info: bool,
    pub sync_output: bool,
    pub depth: u32,
    pub init_dir: Utf8PathBuf,
    pub entered_dir: Option<Utf8PathBuf>,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        ProgramOptions {
            requested: Vec::new(),
            jobs: 1,
            dry_run: false,
            show_tasks: false,
            show_task_info: false,
            sync_output: true,
            depth: 0,
            init_dir: Utf8PathBuf::from("."),
            entered_dir: None,
        }
    }
}

/// Parse the process command line and build the registry. Exits the
/// process on bad arguments.
pub fn init() -> Pake {
    match init_from(std::env::args_os().skip(1)) {
        Ok(pake) => pake,
        Err(err) => err.exit(),
    }
}

/// [`init`] over an explicit argument list (without the program name).
pub fn init_from<I, T>(args: I) -> Result<Pake, InitError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let argv = std::iter::once(OsString::from("pake")).chain(args.into_iter().map(Into::into));
    let cli = CliArgs::try_parse_from(argv).map_err(InitError::Usage)?;

    let sync_output = match cli.sync_output {
        Some(flag) => flag,
        None => match std::env::var(SYNC_OUTPUT_ENV) {
            Ok(raw) => parse_sync_flag(&raw).map_err(|err| {
                InitError::BadArguments(format!("{SYNC_OUTPUT_ENV}: {err}"))
            })?,
            Err(_) => true,
        },
    };

    let entered_dir = match &cli.directory {
        Some(dir) => {
            let dir = absolute(dir.as_std_path())
                .ok()
                .and_then(|p| Utf8PathBuf::try_from(p).ok())
                .unwrap_or_else(|| dir.clone());
            std::env::set_current_dir(&dir)
                .map_err(|err| InitError::Init(format!("cannot enter \"{dir}\": {err}")))?;
            println!("pake[{}]: Entering Directory \"{dir}\"", cli.s_depth);
            let _ = std::io::stdout().flush();
            Some(dir)
        }
        None => None,
    };

    let mut defines = Defines::default();
    if cli.stdin_defines {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .map_err(|err| InitError::Init(format!("cannot read stdin defines: {err}")))?;
        let raw = raw.trim();
        if !raw.is_empty() {
            let parsed = defines::parse_literal(raw)
                .map_err(|err| InitError::Init(format!("bad stdin defines: {err}")))?;
            defines
                .merge_literal_map(parsed)
                .map_err(|err| InitError::Init(format!("bad stdin defines: {err}")))?;
        }
    }
    for flag in &cli.define {
        let (name, value) = defines::parse_define_flag(flag);
        if name.is_empty() {
            return Err(InitError::BadArguments(format!(
                "invalid define \"{flag}\""
            )));
        }
        defines.insert(name, value);
    }

    let init_dir = std::env::current_dir()
        .ok()
        .and_then(|p| Utf8PathBuf::try_from(p).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."));

    debug!(
        jobs = cli.jobs,
        sync_output,
        depth = cli.s_depth,
        defines = defines.len(),
        "initialized"
    );

    Ok(Pake::new(
        defines,
        ProgramOptions {
            requested: cli.tasks,
            jobs: cli.jobs as usize,
            dry_run: cli.dry_run,
            show_tasks: cli.show_tasks,
            show_task_info: cli.show_task_info,
            sync_output,
            depth: cli.s_depth,
            init_dir,
            entered_dir,
        },
    ))
}

/// Drive the build and exit the process with the contract exit code.
pub fn run(pake: Pake, default_tasks: &[&str]) -> ! {
    exit(run_code(pake, default_tasks))
}

/// [`run`] without exiting; returns the exit code instead.
pub fn run_code(pake: Pake, default_tasks: &[&str]) -> i32 {
    let depth = pake.depth();
    let entered_dir = pake.opts().entered_dir.clone();

    let code = run_inner(pake, default_tasks);

    if let Some(dir) = entered_dir {
        println!("pake[{depth}]: Exiting Directory \"{dir}\"");
        let _ = std::io::stdout().flush();
    }
    code
}

fn run_inner(pake: Pake, default_tasks: &[&str]) -> i32 {
    let opts = pake.opts().clone();

    let listing = opts.show_tasks || opts.show_task_info;
    if listing && opts.dry_run {
        print_error("pake: error: task listing and dry run cannot be combined");
        return returncodes::BAD_ARGUMENTS;
    }
    if listing && !opts.requested.is_empty() {
        print_error("pake: error: tasks cannot be requested together with a task listing");
        return returncodes::BAD_ARGUMENTS;
    }
    if listing {
        list_tasks(&pake, opts.show_task_info);
        return returncodes::SUCCESS;
    }

    if pake.task_count() == 0 {
        let err = ConfigError::NoTasksDefined;
        print_error(format!("pake: {err}"));
        return err.return_code();
    }

    let requested: Vec<String> = if opts.requested.is_empty() {
        default_tasks.iter().map(|s| (*s).to_string()).collect()
    } else {
        opts.requested.clone()
    };
    if requested.is_empty() {
        let err = ConfigError::NoTasksSpecified;
        print_error(format!("pake: {err}"));
        return err.return_code();
    }

    let plan = match executor::plan(&pake, &requested) {
        Ok(plan) => plan,
        Err(err) => {
            print_error(format!("pake: {err}"));
            return err.return_code();
        }
    };

    if opts.dry_run {
        return match executor::dry_run(&pake, &plan) {
            Ok(()) => returncodes::SUCCESS,
            Err(failure) => {
                report_failure(&failure);
                failure.return_code()
            }
        };
    }

    let pake = Arc::new(pake);
    let aggregate = executor::execute(&pake, &plan, opts.jobs, opts.sync_output);
    report(&aggregate);
    aggregate.return_code()
}

fn list_tasks(pake: &Pake, with_docs: bool) {
    let mut stdout = std::io::stdout().lock();
    for id in 0..pake.task_count() {
        let task = pake.task_at(id);
        if with_docs {
            if let Some(doc) = &task.doc {
                let _ = writeln!(stdout, "{}:\n  {}", task.name, doc);
            }
        } else {
            let _ = writeln!(stdout, "{}", task.name);
        }
    }
}

fn report(aggregate: &TaskAggregate) {
    let mut failures: Vec<&TaskFailure> = aggregate.failures.iter().collect();
    failures.sort_by_key(|f| f.id);
    for failure in failures {
        report_failure(failure);
    }
}

fn report_failure(failure: &TaskFailure) {
    if let Some(term) = failure.error.downcast_ref::<Terminate>() {
        // a clean terminate is not a failure and prints nothing
        if term.code != 0 {
            print_error(format!(
                "pake: task \"{}\" requested termination with exit code {}",
                failure.task, term.code
            ));
        }
        return;
    }
    print_error(format!(
        "pake: task \"{}\" failed ({})\n{:#}",
        failure.task,
        failure.kind(),
        failure.error
    ));
}
