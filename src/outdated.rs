//! Expansion of declared inputs/outputs and change detection.
//!
//! Declarations are expanded eagerly right before a task executes, so the
//! concrete file lists always reflect the filesystem at that moment rather
//! than at registration time. Freshness is purely mtime-based; nothing is
//! persisted between runs.

use std::fs;
use std::time::SystemTime;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{MissingInputError, OutputsWithoutInputsError};
use crate::task::FilePattern;

/// The concrete view of a task's files, handed to its body through the
/// task context.
#[derive(Debug, Default, Clone)]
pub(crate) struct ConcreteIo {
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
    pub outdated_inputs: Vec<Utf8PathBuf>,
    pub outdated_outputs: Vec<Utf8PathBuf>,
    /// Filled only under the element-wise pairing rule.
    pub outdated_pairs: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    /// Whether the task body should run at all.
    pub outdated: bool,
}

/// Expand a task's declarations and decide whether it is out of date.
pub(crate) fn classify(
    task: &str,
    declared_inputs: &[FilePattern],
    declared_outputs: &[FilePattern],
) -> anyhow::Result<ConcreteIo> {
    let inputs = expand_inputs(task, declared_inputs)?;
    let outputs = expand_outputs(declared_outputs, &inputs)?;

    for path in &inputs {
        if !path_exists(path) {
            return Err(MissingInputError {
                task: task.to_owned(),
                path: path.clone(),
            }
            .into());
        }
    }

    if inputs.is_empty() && !outputs.is_empty() {
        return Err(OutputsWithoutInputsError {
            task: task.to_owned(),
        }
        .into());
    }

    let mut io = ConcreteIo {
        inputs,
        outputs,
        ..ConcreteIo::default()
    };

    if io.inputs.is_empty() && io.outputs.is_empty() {
        // no files declared at all: the task is phony and always runs
        io.outdated = true;
        return Ok(io);
    }

    if io.outputs.is_empty() {
        io.outdated = true;
        io.outdated_inputs = io.inputs.clone();
        return Ok(io);
    }

    if io.inputs.len() == io.outputs.len() {
        for (input, output) in io.inputs.iter().zip(&io.outputs) {
            if pair_outdated(input, output)? {
                io.outdated_inputs.push(input.clone());
                io.outdated_outputs.push(output.clone());
                io.outdated_pairs.push((input.clone(), output.clone()));
            }
        }
        io.outdated = !io.outdated_pairs.is_empty();
    } else {
        let newest_input = io
            .inputs
            .iter()
            .map(|p| mtime(p))
            .collect::<anyhow::Result<Vec<_>>>()?
            .into_iter()
            .max()
            .expect("inputs are non-empty here");

        let mut stale = false;
        let mut oldest_output: Option<SystemTime> = None;
        for output in &io.outputs {
            if !path_exists(output) {
                stale = true;
                break;
            }
            let t = mtime(output)?;
            oldest_output = Some(oldest_output.map_or(t, |o| o.min(t)));
        }

        io.outdated = stale || oldest_output.is_some_and(|oldest| newest_input > oldest);
        if io.outdated {
            io.outdated_inputs = io.inputs.clone();
            io.outdated_outputs = io.outputs.clone();
        }
    }

    Ok(io)
}

fn expand_inputs(task: &str, declared: &[FilePattern]) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut out: Vec<Utf8PathBuf> = Vec::new();
    for pattern in declared {
        match pattern {
            FilePattern::Path(path) => push_unique(&mut out, path.clone()),
            FilePattern::Glob(expr) => {
                for path in expand_glob(expr)? {
                    push_unique(&mut out, path);
                }
            }
            FilePattern::Template(tmpl) => {
                return Err(anyhow!(
                    "task \"{task}\": output template \"{tmpl}\" is not valid as an input"
                ));
            }
        }
    }
    Ok(out)
}

fn expand_outputs(
    declared: &[FilePattern],
    inputs: &[Utf8PathBuf],
) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut out: Vec<Utf8PathBuf> = Vec::new();
    for pattern in declared {
        match pattern {
            FilePattern::Path(path) => out.push(path.clone()),
            FilePattern::Glob(expr) => out.extend(expand_glob(expr)?),
            FilePattern::Template(tmpl) => {
                for input in inputs {
                    out.push(Utf8PathBuf::from(tmpl.replace('%', stem(input))));
                }
            }
        }
    }
    Ok(out)
}

/// Matches for a glob expression, sorted by path (the `glob` crate yields
/// matches in sorted order already).
fn expand_glob(expr: &str) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut paths = Vec::new();
    for entry in glob::glob(expr).with_context(|| format!("bad glob pattern \"{expr}\""))? {
        let path = entry.with_context(|| format!("glob \"{expr}\" failed"))?;
        paths.push(Utf8PathBuf::try_from(path).context("non UTF-8 path in glob expansion")?);
    }
    Ok(paths)
}

fn push_unique(list: &mut Vec<Utf8PathBuf>, path: Utf8PathBuf) {
    if !list.contains(&path) {
        list.push(path);
    }
}

/// Base name without its last extension, substituted for `%` in output
/// templates.
fn stem(path: &Utf8Path) -> &str {
    path.file_stem().unwrap_or_else(|| path.as_str())
}

/// Directories participate exactly like files; a directory's mtime is the
/// mtime of its own inode, never derived from its contents.
fn path_exists(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path()).is_ok()
}

fn mtime(path: &Utf8Path) -> anyhow::Result<SystemTime> {
    fs::metadata(path.as_std_path())
        .and_then(|m| m.modified())
        .with_context(|| format!("cannot stat \"{path}\""))
}

fn pair_outdated(input: &Utf8Path, output: &Utf8Path) -> anyhow::Result<bool> {
    if !path_exists(output) {
        return Ok(true);
    }
    Ok(mtime(input)? > mtime(output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str, age: Duration) -> Utf8PathBuf {
        let path = Utf8PathBuf::try_from(dir.path().join(name)).unwrap();
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    fn path_in(dir: &TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().join(name)).unwrap()
    }

    #[test]
    fn symmetric_pairing_selects_stale_pairs() {
        let dir = TempDir::new().unwrap();
        let a_c = touch(&dir, "a.c", Duration::from_secs(60));
        let b_c = touch(&dir, "b.c", Duration::from_secs(60));
        // a.o exists but is older than a.c; b.o is missing entirely
        let a_o = touch(&dir, "a.o", Duration::from_secs(120));
        let b_o = path_in(&dir, "b.o");

        let io = classify(
            "bar",
            &[a_c.clone().into(), b_c.clone().into()],
            &[a_o.clone().into(), b_o.clone().into()],
        )
        .unwrap();

        assert!(io.outdated);
        assert_eq!(io.outdated_pairs, vec![(a_c, a_o), (b_c, b_o)]);
    }

    #[test]
    fn symmetric_pairing_skips_fresh_pairs() {
        let dir = TempDir::new().unwrap();
        let a_c = touch(&dir, "a.c", Duration::from_secs(120));
        let b_c = touch(&dir, "b.c", Duration::from_secs(120));
        let a_o = touch(&dir, "a.o", Duration::from_secs(60));
        let b_o = touch(&dir, "b.o", Duration::from_secs(240));

        let io = classify(
            "bar",
            &[a_c.into(), b_c.clone().into()],
            &[a_o.into(), b_o.clone().into()],
        )
        .unwrap();

        assert!(io.outdated);
        assert_eq!(io.outdated_pairs, vec![(b_c, b_o)]);
        assert_eq!(io.outdated_inputs.len(), 1);
    }

    #[test]
    fn asymmetric_rule_compares_extremes() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.c", Duration::from_secs(60));
        let b = touch(&dir, "b.c", Duration::from_secs(600));
        let exe = touch(&dir, "prog", Duration::from_secs(120));

        // newest input (a.c) is newer than the only output
        let io = classify(
            "link",
            &[a.clone().into(), b.clone().into()],
            &[exe.clone().into()],
        )
        .unwrap();
        assert!(io.outdated);
        assert_eq!(io.outdated_inputs, vec![a.clone(), b.clone()]);
        assert_eq!(io.outdated_outputs, vec![exe.clone()]);
        assert!(io.outdated_pairs.is_empty());

        // make the output newer than every input: nothing to do
        File::options()
            .write(true)
            .open(exe.as_std_path())
            .unwrap()
            .set_modified(SystemTime::now())
            .unwrap();
        let io = classify("link", &[a.into(), b.into()], &[exe.into()]).unwrap();
        assert!(!io.outdated);
    }

    #[test]
    fn missing_output_is_always_stale() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.c", Duration::from_secs(60));
        let missing = path_in(&dir, "out.bin");
        let extra = touch(&dir, "extra.bin", Duration::from_secs(1));

        let io = classify(
            "gen",
            &[a.into()],
            &[extra.into(), missing.into()],
        )
        .unwrap();
        assert!(io.outdated);
    }

    #[test]
    fn phony_task_is_always_outdated() {
        let io = classify("clean", &[], &[]).unwrap();
        assert!(io.outdated);
        assert!(io.inputs.is_empty());
        assert!(io.outdated_pairs.is_empty());
    }

    #[test]
    fn inputs_without_outputs_is_always_outdated() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.txt", Duration::from_secs(60));
        let io = classify("check", &[a.clone().into()], &[]).unwrap();
        assert!(io.outdated);
        assert_eq!(io.outdated_inputs, vec![a]);
    }

    #[test]
    fn outputs_without_inputs_is_invalid() {
        let dir = TempDir::new().unwrap();
        let out = path_in(&dir, "out.bin");
        let err = classify("bad", &[], &[out.into()]).unwrap_err();
        assert!(err.downcast_ref::<OutputsWithoutInputsError>().is_some());

        // a glob that expands to nothing counts as "no inputs" too
        let none = format!("{}/*.nope", dir.path().display());
        let out = path_in(&dir, "out.bin");
        let err = classify("bad", &[crate::task::glob(none)], &[out.into()]).unwrap_err();
        assert!(err.downcast_ref::<OutputsWithoutInputsError>().is_some());
    }

    #[test]
    fn missing_input_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ghost = path_in(&dir, "missing.c");
        let out = path_in(&dir, "missing.o");
        let err = classify("compile", &[ghost.clone().into()], &[out.into()]).unwrap_err();
        let missing = err.downcast_ref::<MissingInputError>().unwrap();
        assert_eq!(missing.path, ghost);
        assert_eq!(missing.task, "compile");
    }

    #[test]
    fn templates_substitute_input_stems() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.c", Duration::from_secs(10));
        let b = touch(&dir, "b.c", Duration::from_secs(10));

        let io = classify(
            "objects",
            &[a.into(), b.into()],
            &[crate::task::pattern("obj/%.o")],
        )
        .unwrap();

        assert_eq!(
            io.outputs,
            vec![Utf8PathBuf::from("obj/a.o"), Utf8PathBuf::from("obj/b.o")]
        );
        // none of the outputs exist, so every pair is stale
        assert_eq!(io.outdated_pairs.len(), 2);
    }

    #[test]
    fn templates_are_rejected_as_inputs() {
        let err = classify("bad", &[crate::task::pattern("%.c")], &[]).unwrap_err();
        assert!(err.to_string().contains("not valid as an input"));
    }

    #[test]
    fn glob_inputs_are_sorted_and_deduped() {
        let dir = TempDir::new().unwrap();
        let b = touch(&dir, "b.c", Duration::from_secs(10));
        let a = touch(&dir, "a.c", Duration::from_secs(10));

        let expr = format!("{}/*.c", dir.path().display());
        let io = classify(
            "compile",
            &[crate::task::glob(expr), a.clone().into()],
            &[],
        )
        .unwrap();
        assert_eq!(io.inputs, vec![a, b]);
    }
}
