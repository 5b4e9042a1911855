//! End-to-end runs through `init_from` + `run_code`, asserting scheduling
//! order, freshness behavior and the exit-code contract.

use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use camino::Utf8PathBuf;
use pake::{returncodes, CallOpts, Pake, SubprocessError};
use tempfile::TempDir;

fn pk(args: &[&str]) -> Pake {
    pake::init_from(args.iter().copied()).expect("arguments must parse")
}

fn path_in(dir: &TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::try_from(dir.path().join(name)).unwrap()
}

fn create_aged(dir: &TempDir, name: &str, age_secs: u64) -> Utf8PathBuf {
    let path = path_in(dir, name);
    let file = File::create(&path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .unwrap();
    path
}

#[test]
fn serial_execution_follows_registration_tiebroken_topological_order() {
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let mut pk = pk(&[]);

    let recorder = |log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str| {
        let log = Arc::clone(log);
        move |_: &pake::TaskContext| -> pake::TaskResult<()> {
            log.lock().unwrap().push(name);
            Ok(())
        }
    };

    pk.add_task("base", recorder(&log, "base")).unwrap();
    pk.task("left")
        .after(["base"])
        .body(recorder(&log, "left"))
        .unwrap();
    pk.task("right")
        .after(["base"])
        .body(recorder(&log, "right"))
        .unwrap();
    pk.task("top")
        .after(["left", "right"])
        .body(recorder(&log, "top"))
        .unwrap();

    assert_eq!(pake::run_code(pk, &["top"]), returncodes::SUCCESS);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["base", "left", "right", "top"]
    );
}

#[test]
fn dependencies_complete_before_dependents_start_in_parallel() {
    let done = Arc::new(AtomicBool::new(false));
    let mut pk = pk(&["-j", "4"]);

    {
        let done = Arc::clone(&done);
        pk.add_task("foo", move |ctx| {
            std::thread::sleep(Duration::from_millis(50));
            done.store(true, Ordering::SeqCst);
            ctx.println("foo ran")?;
            Ok(())
        })
        .unwrap();
    }
    {
        let done = Arc::clone(&done);
        pk.task("bar")
            .after(["foo"])
            .body(move |ctx| {
                anyhow::ensure!(
                    done.load(Ordering::SeqCst),
                    "bar started before foo completed"
                );
                ctx.println("bar ran")?;
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(pake::run_code(pk, &["bar"]), returncodes::SUCCESS);
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn unrelated_tasks_all_run_under_parallelism() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut pk = pk(&["-j", "4"]);
    for name in ["a", "b", "c", "d", "e", "f"] {
        let count = Arc::clone(&count);
        pk.add_task(name, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }

    assert_eq!(
        pake::run_code(pk, &["a", "b", "c", "d", "e", "f"]),
        returncodes::SUCCESS
    );
    assert_eq!(count.load(Ordering::SeqCst), 6);
}

#[test]
fn cyclic_dependencies_fail_before_any_body_runs() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut pk = pk(&[]);
    for (name, dep) in [("a", "b"), ("b", "a")] {
        let ran = Arc::clone(&ran);
        pk.task(name)
            .after([dep])
            .body(move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(pake::run_code(pk, &["a"]), returncodes::CYCLIC_DEPENDENCY);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn unknown_task_references_are_rejected() {
    let mut pk = pk(&[]);
    pk.add_task("known", |_| Ok(())).unwrap();
    assert_eq!(
        pake::run_code(pk, &["missing"]),
        returncodes::UNDEFINED_TASK
    );

    let mut pk = self::pk(&[]);
    pk.task("broken").after(["ghost"]).body(|_| Ok(())).unwrap();
    assert_eq!(
        pake::run_code(pk, &["broken"]),
        returncodes::UNDEFINED_TASK
    );
}

#[test]
fn empty_registries_and_empty_requests_have_distinct_codes() {
    let pk_empty = pk(&[]);
    assert_eq!(
        pake::run_code(pk_empty, &["anything"]),
        returncodes::NO_TASKS_DEFINED
    );

    let mut pk_no_request = pk(&[]);
    pk_no_request.add_task("something", |_| Ok(())).unwrap();
    assert_eq!(
        pake::run_code(pk_no_request, &[]),
        returncodes::NO_TASKS_TO_RUN
    );
}

#[test]
fn missing_inputs_fail_without_invoking_the_body() {
    let dir = TempDir::new().unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    let mut pk = pk(&[]);
    {
        let ran = Arc::clone(&ran);
        pk.task("compile")
            .inputs([path_in(&dir, "missing.c")])
            .outputs([path_in(&dir, "missing.o")])
            .body(move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(
        pake::run_code(pk, &["compile"]),
        returncodes::TASK_INPUT_NOT_FOUND
    );
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn outputs_without_inputs_fail_at_resolution_time() {
    let dir = TempDir::new().unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    let mut pk = pk(&[]);
    {
        let ran = Arc::clone(&ran);
        pk.add_task("dep", move |_| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }
    pk.task("bad")
        .after(["dep"])
        .outputs([path_in(&dir, "out.bin")])
        .body(|_| Ok(()))
        .unwrap();

    assert_eq!(
        pake::run_code(pk, &["bad"]),
        returncodes::OUTPUTS_WITHOUT_INPUTS
    );
    // resolution-time failure: even the dependency never ran
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn symmetric_change_detection_runs_the_body_with_the_stale_pairs() {
    let dir = TempDir::new().unwrap();
    let a_c = create_aged(&dir, "a.c", 60);
    let b_c = create_aged(&dir, "b.c", 60);
    // a.o exists but is older than a.c; b.o is absent
    let a_o = create_aged(&dir, "a.o", 120);
    let b_o = path_in(&dir, "b.o");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pk = pk(&[]);
    {
        let seen = Arc::clone(&seen);
        pk.task("bar")
            .inputs([a_c.clone(), b_c.clone()])
            .outputs([a_o.clone(), b_o.clone()])
            .body(move |ctx| {
                seen.lock().unwrap().extend(ctx.outdated_pairs().to_vec());
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(pake::run_code(pk, &["bar"]), returncodes::SUCCESS);
    assert_eq!(*seen.lock().unwrap(), vec![(a_c, a_o), (b_c, b_o)]);
}

#[test]
fn fresh_tasks_are_skipped_but_still_feed_dependents() {
    let dir = TempDir::new().unwrap();
    let src = create_aged(&dir, "lib.c", 600);
    let obj = create_aged(&dir, "lib.o", 60);

    let dep_ran = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(Mutex::new(Vec::new()));

    let mut pk = pk(&[]);
    {
        let dep_ran = Arc::clone(&dep_ran);
        pk.task("objects")
            .inputs([src])
            .outputs([obj.clone()])
            .body(move |_| {
                dep_ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    {
        let observed = Arc::clone(&observed);
        pk.task("link")
            .after(["objects"])
            .body(move |ctx| {
                observed
                    .lock()
                    .unwrap()
                    .extend(ctx.dependency_outputs().to_vec());
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(pake::run_code(pk, &["link"]), returncodes::SUCCESS);
    // the object file was newer than its source, so "objects" was skipped,
    // yet its concrete outputs flowed through to the dependent
    assert!(!dep_ran.load(Ordering::SeqCst));
    assert_eq!(*observed.lock().unwrap(), vec![obj]);
}

#[test]
fn phony_tasks_run_every_time() {
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let count = Arc::clone(&count);
        let mut pk = pk(&[]);
        pk.add_task("always", move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(pake::run_code(pk, &["always"]), returncodes::SUCCESS);
    }
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[cfg(unix)]
#[test]
fn subprocess_failures_carry_the_call_site_and_map_to_their_code() {
    let mut pk = pk(&["-j", "8"]);
    pk.add_task("shell", |ctx| {
        let opts = CallOpts {
            collect_output: true,
            ..CallOpts::default()
        };
        let call_line = line!() + 1;
        let err = ctx.call_with("false", opts).unwrap_err();

        let failure = err
            .downcast_ref::<SubprocessError>()
            .expect("a non-zero exit must surface as SubprocessError");
        assert_eq!(failure.cmd, vec!["false"]);
        assert_eq!(failure.code, 1);
        assert_eq!(failure.task, "shell");
        assert!(failure.output.is_empty());
        assert_eq!(failure.site.line, call_line);
        Err(err)
    })
    .unwrap();

    assert_eq!(
        pake::run_code(pk, &["shell"]),
        returncodes::SUBPROCESS_EXCEPTION
    );
}

#[test]
fn multitask_propagates_the_earliest_failure_after_all_units_finish() {
    let completed = Arc::new(AtomicUsize::new(0));
    let mut pk = pk(&["-j", "4"]);
    {
        let completed = Arc::clone(&completed);
        pk.add_task("fanout", move |ctx| {
            let completed = Arc::clone(&completed);
            ctx.multitask(move |mt| {
                for i in 0..3 {
                    let completed = Arc::clone(&completed);
                    mt.submit(move || {
                        completed.fetch_add(1, Ordering::SeqCst);
                        anyhow::ensure!(i != 1, "unit {i} broke");
                        Ok(())
                    });
                }
                Ok(())
            })
        })
        .unwrap();
    }

    assert_eq!(
        pake::run_code(pk, &["fanout"]),
        returncodes::TASK_EXCEPTION
    );
    // the failing unit does not cancel its siblings
    assert_eq!(completed.load(Ordering::SeqCst), 3);
}

#[test]
fn failures_stop_dependents_and_map_to_task_exception() {
    let dependent_ran = Arc::new(AtomicBool::new(false));
    let mut pk = pk(&[]);
    pk.add_task("broken", |_| anyhow::bail!("boom")).unwrap();
    {
        let dependent_ran = Arc::clone(&dependent_ran);
        pk.task("after")
            .after(["broken"])
            .body(move |_| {
                dependent_ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(pake::run_code(pk, &["after"]), returncodes::TASK_EXCEPTION);
    assert!(!dependent_ran.load(Ordering::SeqCst));
}

#[test]
fn terminate_honors_the_requested_semantics() {
    let mut pk = pk(&[]);
    pk.add_task("stop", |_| Err(pake::terminate(3))).unwrap();
    assert_eq!(pake::run_code(pk, &["stop"]), returncodes::TERMINATED);

    let mut pk = self::pk(&[]);
    pk.add_task("stop_clean", |_| Err(pake::terminate(0))).unwrap();
    assert_eq!(pake::run_code(pk, &["stop_clean"]), returncodes::SUCCESS);
}

#[test]
fn cli_defines_are_typed_and_readable_from_bodies() {
    let mut pk = pk(&["-D", "CC=clang", "-D", "N=3", "-D", "FLAG", "-D", "XS=[1, 2]"]);
    assert_eq!(pk.get_define("CC"), Some(&pake::Value::Str("clang".into())));
    assert_eq!(pk.get_define("N"), Some(&pake::Value::Int(3)));
    assert_eq!(pk.get_define("FLAG"), Some(&pake::Value::Bool(true)));

    let ok = Arc::new(AtomicBool::new(false));
    {
        let ok = Arc::clone(&ok);
        pk.add_task("inspect", move |ctx| {
            let n = ctx.pake().get_define("N").and_then(|v| v.as_int());
            ok.store(n == Some(3), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }
    assert_eq!(pake::run_code(pk, &["inspect"]), returncodes::SUCCESS);
    assert!(ok.load(Ordering::SeqCst));
}

#[test]
fn cli_tasks_override_the_default_set() {
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let mut pk = pk(&["requested"]);
    for name in ["default", "requested"] {
        let log = Arc::clone(&log);
        pk.add_task(name, move |_| {
            log.lock().unwrap().push(name);
            Ok(())
        })
        .unwrap();
    }

    assert_eq!(pake::run_code(pk, &["default"]), returncodes::SUCCESS);
    assert_eq!(*log.lock().unwrap(), vec!["requested"]);
}

#[test]
fn listing_flags_reject_conflicting_modes() {
    let pk_conflict = pk(&["-t", "-n"]);
    assert_eq!(
        pake::run_code(pk_conflict, &[]),
        returncodes::BAD_ARGUMENTS
    );

    let mut pk_with_tasks = pk(&["-t", "sometask"]);
    pk_with_tasks.add_task("sometask", |_| Ok(())).unwrap();
    assert_eq!(
        pake::run_code(pk_with_tasks, &[]),
        returncodes::BAD_ARGUMENTS
    );
}

#[test]
fn dry_run_reports_without_executing() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut pk = pk(&["-n"]);
    {
        let ran = Arc::clone(&ran);
        pk.add_task("work", move |_| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }

    assert_eq!(pake::run_code(pk, &["work"]), returncodes::SUCCESS);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn bad_flag_values_are_usage_errors() {
    let err = pake::init_from(["-j", "0"]).unwrap_err();
    assert_eq!(err.return_code(), returncodes::BAD_ARGUMENTS);

    let err = pake::init_from(["--sync-output", "maybe"]).unwrap_err();
    assert_eq!(err.return_code(), returncodes::BAD_ARGUMENTS);

    let pk = pake::init_from(["--sync-output", "0"]).unwrap();
    assert!(!pk.sync_output());
}
