//! The `pake` command: find a build-file executable and run it.
//!
//! A build file is an ordinary executable (usually a compiled binary
//! linking the `pake` library) named `pakefile`. This command locates one
//! in the working directory (or takes explicit paths via `-f`), forwards
//! every other argument to it verbatim, and passes its exit code through.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{exit, Command};

use pake::{print_error, returncodes};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable controlling the log filter, e.g. `PAKE_LOG=debug`.
const LOG_ENV: &str = "PAKE_LOG";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<OsString> = env::args_os().skip(1).collect();
    let (files, forwarded) = split_file_args(&args);

    if files.is_empty() {
        let dir = directory_arg(&forwarded).unwrap_or_else(|| PathBuf::from("."));
        let Some(file) = find_build_file(&dir) else {
            print_error(format!(
                "pake: error: no \"pakefile\" found in \"{}\"",
                dir.display()
            ));
            exit(returncodes::BUILD_FILE_NOT_FOUND);
        };
        exit(run_build_file(&file, &forwarded));
    }

    // explicit build files run in the given order; the first failure wins
    for file in files {
        let path = PathBuf::from(&file);
        if !path.is_file() {
            print_error(format!(
                "pake: error: build file \"{}\" does not exist",
                path.display()
            ));
            exit(returncodes::BUILD_FILE_NOT_FOUND);
        }
        let code = run_build_file(&path, &forwarded);
        if code != 0 {
            exit(code);
        }
    }
}

/// Extract every `-f FILE` / `--file FILE` / `--file=FILE` pair, leaving
/// all remaining arguments untouched for the build file itself.
fn split_file_args(args: &[OsString]) -> (Vec<OsString>, Vec<OsString>) {
    let mut files = Vec::new();
    let mut forwarded = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.to_str() {
            Some("-f") | Some("--file") => {
                if let Some(value) = iter.next() {
                    files.push(value.clone());
                }
            }
            Some(flag) if flag.starts_with("--file=") => {
                files.push(OsString::from(&flag["--file=".len()..]));
            }
            _ => forwarded.push(arg.clone()),
        }
    }
    (files, forwarded)
}

/// Peek at a forwarded `-C DIR` / `--directory DIR` so discovery looks in
/// the directory the build file will run in.
fn directory_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.to_str() {
            Some("-C") | Some("--directory") => {
                return iter.next().map(PathBuf::from);
            }
            Some(flag) if flag.starts_with("--directory=") => {
                return Some(PathBuf::from(&flag["--directory=".len()..]));
            }
            _ => {}
        }
    }
    None
}

fn find_build_file(dir: &Path) -> Option<PathBuf> {
    let candidate = dir.join("pakefile");
    candidate.is_file().then_some(candidate)
}

fn run_build_file(file: &Path, args: &[OsString]) -> i32 {
    debug!(file = %file.display(), "running build file");
    match Command::new(file).args(args).status() {
        Ok(status) => status.code().unwrap_or(returncodes::ERROR),
        Err(err) => {
            print_error(format!(
                "pake: error: cannot run build file \"{}\": {err}",
                file.display()
            ));
            returncodes::BUILD_FILE_NOT_FOUND
        }
    }
}
