//! Subprocess execution with output-collection discipline.
//!
//! All process output (stderr merged into stdout) flows into the calling
//! task's output queue, either streamed as it is produced or spooled into
//! an anonymous temp file and relayed in one locked burst after the process
//! exits. The latter keeps the queue lock independent of process runtime,
//! so sibling processes running in parallel never interleave.

use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::process::{Child, Command, Stdio};

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::context::OutputQueue;
use crate::error::{CallSite, SubprocessError};

const RELAY_CHUNK: usize = 8 * 1024;

/// Options accepted by [`crate::TaskContext::call_with`].
#[derive(Debug, Clone)]
pub struct CallOpts {
    /// Spool process output while it runs and relay it to the task queue
    /// in one locked copy after exit, instead of streaming it live.
    pub collect_output: bool,
    /// Do not relay process output to the task queue at all. Output is
    /// still captured for failure reporting.
    pub silent: bool,
    /// Echo the command line to the task queue before execution.
    pub print_cmd: bool,
    /// Return the exit code instead of failing on a non-zero status.
    pub ignore_errors: bool,
}

impl Default for CallOpts {
    fn default() -> Self {
        CallOpts {
            collect_output: false,
            silent: false,
            print_cmd: true,
            ignore_errors: false,
        }
    }
}

/// A single command-line argument, or one nesting level of them.
///
/// Strings are always single arguments; they are never split into
/// characters. Sequences contribute each of their elements, which lets a
/// task pass `ctx.inputs()` or `ctx.outputs()` straight into a command.
pub trait CmdArg {
    fn push_args(&self, out: &mut Vec<String>);
}

macro_rules! impl_cmd_arg_display {
    ($($ty:ty),* $(,)?) => {
        $(impl CmdArg for $ty {
            fn push_args(&self, out: &mut Vec<String>) {
                out.push(self.to_string());
            }
        })*
    };
}

impl_cmd_arg_display!(&str, String, i32, i64, u32, u64, usize, f64);

impl CmdArg for &String {
    fn push_args(&self, out: &mut Vec<String>) {
        out.push((*self).clone());
    }
}

impl CmdArg for Utf8PathBuf {
    fn push_args(&self, out: &mut Vec<String>) {
        out.push(self.as_str().to_owned());
    }
}

impl CmdArg for &Utf8PathBuf {
    fn push_args(&self, out: &mut Vec<String>) {
        out.push(self.as_str().to_owned());
    }
}

impl CmdArg for &Utf8Path {
    fn push_args(&self, out: &mut Vec<String>) {
        out.push(self.as_str().to_owned());
    }
}

impl<T: CmdArg> CmdArg for Vec<T> {
    fn push_args(&self, out: &mut Vec<String>) {
        for item in self {
            item.push_args(out);
        }
    }
}

impl<T: CmdArg> CmdArg for &Vec<T> {
    fn push_args(&self, out: &mut Vec<String>) {
        for item in *self {
            item.push_args(out);
        }
    }
}

impl<T: CmdArg> CmdArg for &[T] {
    fn push_args(&self, out: &mut Vec<String>) {
        for item in *self {
            item.push_args(out);
        }
    }
}

impl<T: CmdArg, const N: usize> CmdArg for [T; N] {
    fn push_args(&self, out: &mut Vec<String>) {
        for item in self {
            item.push_args(out);
        }
    }
}

/// A full command line: a bare string, a sequence of [`CmdArg`]s, or a
/// tuple of them.
///
/// A bare string is tokenized into a command line (`"gcc -c test.c"`);
/// every other form passes its elements through verbatim.
pub trait IntoArgs {
    fn into_args(self) -> Vec<String>;
}

impl IntoArgs for &str {
    fn into_args(self) -> Vec<String> {
        split_command_line(self)
    }
}

impl IntoArgs for String {
    fn into_args(self) -> Vec<String> {
        split_command_line(&self)
    }
}

impl IntoArgs for Utf8PathBuf {
    fn into_args(self) -> Vec<String> {
        vec![self.into_string()]
    }
}

impl IntoArgs for &Utf8Path {
    fn into_args(self) -> Vec<String> {
        vec![self.as_str().to_owned()]
    }
}

impl<T: CmdArg> IntoArgs for Vec<T> {
    fn into_args(self) -> Vec<String> {
        let mut out = Vec::new();
        self.push_args(&mut out);
        out
    }
}

impl<T: CmdArg> IntoArgs for &Vec<T> {
    fn into_args(self) -> Vec<String> {
        let mut out = Vec::new();
        self.push_args(&mut out);
        out
    }
}

impl<T: CmdArg> IntoArgs for &[T] {
    fn into_args(self) -> Vec<String> {
        let mut out = Vec::new();
        self.push_args(&mut out);
        out
    }
}

impl<T: CmdArg, const N: usize> IntoArgs for [T; N] {
    fn into_args(self) -> Vec<String> {
        let mut out = Vec::new();
        self.push_args(&mut out);
        out
    }
}

macro_rules! impl_into_args {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: CmdArg),+> IntoArgs for ($($name,)+) {
            fn into_args(self) -> Vec<String> {
                let ($($name,)+) = self;
                let mut out = Vec::new();
                $($name.push_args(&mut out);)+
                out
            }
        }
    };
}

impl_into_args!(A);
impl_into_args!(A, B);
impl_into_args!(A, B, C);
impl_into_args!(A, B, C, D);
impl_into_args!(A, B, C, D, E);
impl_into_args!(A, B, C, D, E, F);
impl_into_args!(A, B, C, D, E, F, G);
impl_into_args!(A, B, C, D, E, F, G, H);
impl_into_args!(A, B, C, D, E, F, G, H, I);
impl_into_args!(A, B, C, D, E, F, G, H, I, J);
impl_into_args!(A, B, C, D, E, F, G, H, I, J, K);
impl_into_args!(A, B, C, D, E, F, G, H, I, J, K, L);

/// Tokenize a command line given as one string: whitespace separates
/// arguments, single or double quotes group them. No other shell syntax is
/// recognized; the command never passes through a shell.
fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pending = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    pending = true;
                }
                c if c.is_whitespace() => {
                    if pending || !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                        pending = false;
                    }
                }
                c => current.push(c),
            },
        }
    }
    if pending || !current.is_empty() {
        args.push(current);
    }
    args
}

/// What the child reads from its standard input.
pub(crate) enum StdinMode {
    Inherit,
    Bytes(Vec<u8>),
}

/// Run a command for `ctx.call`, relaying output into `queue` under the
/// options' discipline. Returns the exit code; a non-zero code is an error
/// unless `ignore_errors` is set.
pub(crate) fn run_call(
    argv: &[String],
    task: &str,
    site: CallSite,
    queue: &OutputQueue,
    opts: &CallOpts,
) -> anyhow::Result<i32> {
    if opts.print_cmd && !opts.silent {
        queue.lock().write_all(format!("{}\n", argv.join(" ")).as_bytes())?;
    }

    let (code, captured) = if opts.collect_output || opts.silent {
        let (code, mut spool) = run_spooled(argv, None, StdinMode::Inherit)?;
        if code == 0 || opts.ignore_errors {
            if !opts.silent {
                copy_spool(&mut spool, &mut queue.lock())?;
            }
            return Ok(code);
        }
        (code, read_spool(spool)?)
    } else {
        let (code, captured) = run_streamed(argv, None, StdinMode::Inherit, Some(queue))?;
        if code == 0 || opts.ignore_errors {
            return Ok(code);
        }
        (code, captured)
    };

    Err(SubprocessError {
        task: task.to_owned(),
        site,
        cmd: argv.to_vec(),
        code,
        output: captured,
    }
    .into())
}

/// `check_call`: run quietly, return the exit code, fail on non-zero.
pub(crate) fn run_check_call(
    argv: &[String],
    task: &str,
    site: CallSite,
) -> anyhow::Result<i32> {
    let (code, spool) = run_spooled(argv, None, StdinMode::Inherit)?;
    if code == 0 {
        return Ok(code);
    }
    Err(SubprocessError {
        task: task.to_owned(),
        site,
        cmd: argv.to_vec(),
        code,
        output: read_spool(spool)?,
    }
    .into())
}

/// `check_output`: run quietly and return the captured bytes. Never
/// relays anything to the task queue.
pub(crate) fn run_check_output(
    argv: &[String],
    task: &str,
    site: CallSite,
) -> anyhow::Result<Vec<u8>> {
    let (code, spool) = run_spooled(argv, None, StdinMode::Inherit)?;
    let output = read_spool(spool)?;
    if code == 0 {
        return Ok(output);
    }
    Err(SubprocessError {
        task: task.to_owned(),
        site,
        cmd: argv.to_vec(),
        code,
        output,
    }
    .into())
}

/// Spawn with both output streams spooled into an anonymous temp file.
/// Returns the exit code and the rewound spool.
pub(crate) fn run_spooled(
    argv: &[String],
    cwd: Option<&Utf8Path>,
    stdin: StdinMode,
) -> anyhow::Result<(i32, File)> {
    let spool = tempfile::tempfile().context("cannot create output spool")?;
    let out = spool.try_clone().context("cannot clone spool handle")?;
    let err = spool.try_clone().context("cannot clone spool handle")?;

    let mut cmd = command(argv, cwd, &stdin)?;
    cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));

    let mut child = spawn(cmd, argv)?;
    feed_stdin(&mut child, stdin)?;
    let code = wait(child, argv)?;

    let mut spool = spool;
    spool.rewind().context("cannot rewind output spool")?;
    Ok((code, spool))
}

/// Spawn with both output streams merged into one pipe, streaming every
/// chunk into `queue` (when given) as it arrives. All output is also
/// accumulated for failure reporting.
pub(crate) fn run_streamed(
    argv: &[String],
    cwd: Option<&Utf8Path>,
    stdin: StdinMode,
    queue: Option<&OutputQueue>,
) -> anyhow::Result<(i32, Vec<u8>)> {
    let (mut reader, writer) = io::pipe().context("cannot create output pipe")?;
    let writer_err = writer.try_clone().context("cannot clone pipe handle")?;

    let mut cmd = command(argv, cwd, &stdin)?;
    cmd.stdout(Stdio::from(writer)).stderr(Stdio::from(writer_err));

    let mut child = spawn(cmd, argv)?;
    feed_stdin(&mut child, stdin)?;

    let mut captured = Vec::new();
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = reader.read(&mut buf).context("reading process output")?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&buf[..n]);
        if let Some(queue) = queue {
            queue.lock().write_all(&buf[..n])?;
        }
    }

    let code = wait(child, argv)?;
    Ok((code, captured))
}

/// Copy a rewound spool into a sink in bounded chunks. Callers pass a
/// held queue guard so the whole relay stays one contiguous block.
pub(crate) fn copy_spool(spool: &mut File, sink: &mut impl Write) -> io::Result<()> {
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = spool.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n])?;
    }
}

pub(crate) fn read_spool(mut spool: File) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    spool
        .read_to_end(&mut out)
        .context("cannot read output spool")?;
    Ok(out)
}

fn command(argv: &[String], cwd: Option<&Utf8Path>, stdin: &StdinMode) -> anyhow::Result<Command> {
    let program = argv.first().ok_or_else(|| anyhow!("empty command line"))?;
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    match stdin {
        StdinMode::Inherit => cmd.stdin(Stdio::inherit()),
        StdinMode::Bytes(_) => cmd.stdin(Stdio::piped()),
    };
    Ok(cmd)
}

fn spawn(mut cmd: Command, argv: &[String]) -> anyhow::Result<Child> {
    debug!(cmd = ?argv, "spawning process");
    let child = cmd
        .spawn()
        .with_context(|| format!("cannot start \"{}\"", argv[0]))?;
    // release the parent's copies of the output handles so readers see EOF
    drop(cmd);
    Ok(child)
}

fn feed_stdin(child: &mut Child, stdin: StdinMode) -> anyhow::Result<()> {
    if let StdinMode::Bytes(bytes) = stdin {
        let mut pipe = child.stdin.take().expect("stdin was configured as piped");
        // a child that never reads its stdin is fine
        match pipe.write_all(&bytes) {
            Err(err) if err.kind() != io::ErrorKind::BrokenPipe => {
                return Err(err).context("writing to child stdin");
            }
            _ => {}
        }
    }
    Ok(())
}

fn wait(mut child: Child, argv: &[String]) -> anyhow::Result<i32> {
    let status = child
        .wait()
        .with_context(|| format!("waiting for \"{}\"", argv[0]))?;
    let code = status.code().unwrap_or(-1);
    debug!(cmd = ?argv, code, "process exited");
    Ok(code)
}
