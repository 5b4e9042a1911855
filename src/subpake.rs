//! Recursive invocation of another build file.
//!
//! The child is an ordinary build-file executable. It learns its nesting
//! depth through a hidden flag, receives the parent's exported defines as
//! one literal mapping on stdin, and inherits the parent's output
//! synchronization policy unless the caller overrides it. To the parent,
//! a sub-build is opaque: cycles between build files are not detected.

use std::fs;
use std::io::Write;
use std::path::absolute;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::context::OutputQueue;
use crate::defines::Value;
use crate::error::{CallSite, SubpakeError};
use crate::process::{self, StdinMode};

/// Options accepted by [`crate::TaskContext::subpake_with`].
#[derive(Debug, Clone, Default)]
pub struct SubpakeOpts {
    /// Spool the child's output and relay it in one locked burst after it
    /// exits, instead of streaming it live.
    pub collect_output: bool,
    /// Suppress banners and output relay. Output is still captured for
    /// failure reporting.
    pub silent: bool,
    /// Return the exit code instead of failing on a non-zero status.
    pub ignore_errors: bool,
    /// Working directory handed to the child through `-C`. Defaults to
    /// the directory containing the build file.
    pub working_dir: Option<Utf8PathBuf>,
    /// Output synchronization policy for the child. Defaults to the
    /// parent's own policy.
    pub sync_output: Option<bool>,
}

pub(crate) struct Invocation<'a> {
    /// Build-file executable followed by its extra arguments.
    pub argv: &'a [String],
    pub task: &'a str,
    pub site: CallSite,
    pub queue: &'a OutputQueue,
    pub exports: &'a [(String, Value)],
    /// The parent's depth; the child runs at `depth + 1`.
    pub depth: u32,
    pub parent_sync: bool,
    pub opts: &'a SubpakeOpts,
}

pub(crate) fn run(inv: Invocation<'_>) -> anyhow::Result<i32> {
    let script = inv
        .argv
        .first()
        .ok_or_else(|| anyhow!("subpake requires a build file path"))?;
    let extra = &inv.argv[1..];

    let script = resolve_script(script)?;
    let child_depth = inv.depth + 1;

    let work_dir = match &inv.opts.working_dir {
        Some(dir) => dir.clone(),
        None => script
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from(".")),
    };

    let mut cmd: Vec<String> = vec![
        script.to_string(),
        "--s-depth".into(),
        child_depth.to_string(),
        "-C".into(),
        work_dir.into_string(),
        "--stdin-defines".into(),
    ];
    if !extra.iter().any(|a| a == "--sync-output") {
        let sync = inv.opts.sync_output.unwrap_or(inv.parent_sync);
        cmd.push("--sync-output".into());
        cmd.push(sync.to_string());
    }
    cmd.extend(extra.iter().cloned());

    let stdin = StdinMode::Bytes(render_exports(inv.exports).into_bytes());

    debug!(script = %script, depth = child_depth, "running sub-build");

    let enter = format!("*** enter subpake[{child_depth}]:\n");
    let exit = format!("*** exit subpake[{child_depth}]:\n");

    let (code, captured) = if inv.opts.collect_output || inv.opts.silent {
        let (code, mut spool) = process::run_spooled(&cmd, None, stdin)?;
        if code == 0 || inv.opts.ignore_errors {
            if !inv.opts.silent {
                // one guard for the banner pair and the whole relay
                let mut sink = inv.queue.lock();
                sink.write_all(enter.as_bytes())?;
                process::copy_spool(&mut spool, &mut sink)?;
                sink.write_all(exit.as_bytes())?;
            }
            return Ok(code);
        }
        (code, process::read_spool(spool)?)
    } else {
        if !inv.opts.silent {
            inv.queue.lock().write_all(enter.as_bytes())?;
        }
        let (code, captured) = process::run_streamed(&cmd, None, stdin, Some(inv.queue))?;
        if code == 0 || inv.opts.ignore_errors {
            if !inv.opts.silent {
                inv.queue.lock().write_all(exit.as_bytes())?;
            }
            return Ok(code);
        }
        (code, captured)
    };

    Err(SubpakeError {
        task: inv.task.to_owned(),
        site: inv.site,
        script,
        cmd,
        code,
        output: captured,
    }
    .into())
}

/// The exports mapping in the literal grammar the child's
/// `--stdin-defines` reads back.
pub(crate) fn render_exports(exports: &[(String, Value)]) -> String {
    let entries = exports
        .iter()
        .map(|(name, value)| (Value::Str(name.clone()), value.clone()))
        .collect();
    Value::Map(entries).to_string()
}

fn resolve_script(script: &str) -> anyhow::Result<Utf8PathBuf> {
    let meta =
        fs::metadata(script).with_context(|| format!("build file \"{script}\" does not exist"))?;
    if !meta.is_file() {
        return Err(anyhow!("build file \"{script}\" is not a file"));
    }
    let abs = absolute(script).with_context(|| format!("cannot resolve \"{script}\""))?;
    Utf8PathBuf::try_from(abs).context("build file path is not UTF-8")
}
