//! The scheduler: resolves the run set, walks the graph bottom-up and
//! drives task bodies through the shared worker pool.
//!
//! Tasks execute as soon as their dependencies have completed, but their
//! output is flushed to stdout strictly in topological(+registration)
//! order, so two runs of the same graph always print task blocks in the
//! same order no matter how completions race.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use tracing::debug;

use crate::context::{OutputQueue, TaskContext};
use crate::error::{ConfigError, TaskAggregate, TaskFailure};
use crate::graph::TaskGraph;
use crate::outdated;
use crate::pool::WorkerPool;
use crate::task::DepRef;
use crate::Pake;

/// A validated execution plan: the reachable tasks in the order their
/// output must appear, plus every task's resolved dependency ids.
pub(crate) struct Plan {
    pub order: Vec<usize>,
    pub deps: Vec<Vec<usize>>,
}

/// Resolve requested task names, link dependencies, and topologically
/// order the reachable subgraph. All configuration errors surface here,
/// before anything runs.
pub(crate) fn plan(pake: &Pake, requested: &[String]) -> Result<Plan, ConfigError> {
    let mut roots = Vec::new();
    for name in requested {
        let id = pake
            .lookup(name)
            .ok_or_else(|| ConfigError::UndefinedTask(name.clone()))?;
        if !roots.contains(&id) {
            roots.push(id);
        }
    }

    let mut deps = Vec::with_capacity(pake.task_count());
    for id in 0..pake.task_count() {
        let mut resolved = Vec::new();
        for dep in pake.task_deps(id) {
            let dep_id = match dep {
                DepRef::Name(name) => pake
                    .lookup(name)
                    .ok_or_else(|| ConfigError::UndefinedTask(name.clone()))?,
                DepRef::Handle(handle) => handle.0,
            };
            resolved.push(dep_id);
        }
        deps.push(resolved);
    }

    let graph = TaskGraph::new(deps);
    let names: Vec<String> = (0..pake.task_count())
        .map(|id| pake.task_name(id).to_owned())
        .collect();
    let order = graph.topological_order(&roots, &names)?;

    // declaration-level validation; globs that expand to nothing are
    // caught again at execution time
    let mut deps = Vec::with_capacity(graph.node_count());
    for id in 0..graph.node_count() {
        deps.push(graph.immediate_dependencies(id));
    }
    for &id in &order {
        let task = pake.task_at(id);
        if !task.outputs.is_empty() && task.inputs.is_empty() {
            return Err(ConfigError::OutputsWithoutInputs(task.name.clone()));
        }
    }

    debug!(tasks = order.len(), "computed execution plan");
    Ok(Plan { order, deps })
}

/// Walk the plan without running bodies, printing the tasks that are out
/// of date. Stops at the first classification failure.
pub(crate) fn dry_run(pake: &Pake, plan: &Plan) -> Result<(), TaskFailure> {
    let mut stdout = std::io::stdout().lock();
    for &id in &plan.order {
        let task = pake.task_at(id);
        match outdated::classify(&task.name, &task.inputs, &task.outputs) {
            Ok(io) if io.outdated => {
                let _ = writeln!(stdout, "Visited Task: \"{}\"", task.name);
            }
            Ok(_) => {}
            Err(error) => {
                return Err(TaskFailure {
                    id,
                    task: task.name.clone(),
                    error,
                });
            }
        }
    }
    Ok(())
}

/// Result of one task's turn on the pool, reported back to the driver.
struct TaskRun {
    queue: Arc<OutputQueue>,
    error: Option<anyhow::Error>,
}

/// Concrete outputs of completed tasks, read by their dependents.
struct RunState {
    outputs: Mutex<HashMap<usize, Vec<Utf8PathBuf>>>,
}

/// Execute the plan with the given parallelism. Returns the collected
/// failures; an empty aggregate means success.
pub(crate) fn execute(pake: &Arc<Pake>, plan: &Plan, jobs: usize, sync: bool) -> TaskAggregate {
    let state = Arc::new(RunState {
        outputs: Mutex::new(HashMap::new()),
    });
    let pool = WorkerPool::new(jobs);
    let mut aggregate = TaskAggregate::default();

    if jobs == 1 {
        for &id in &plan.order {
            let run = run_task(pake, id, &plan.deps[id], &state, &pool, sync);
            flush(&run.queue);
            if let Some(error) = run.error {
                aggregate.push(TaskFailure {
                    id,
                    task: pake.task_name(id).to_owned(),
                    error,
                });
                break;
            }
        }
        return aggregate;
    }

    execute_parallel(pake, plan, &pool, state, sync, &mut aggregate);
    aggregate
}

fn execute_parallel(
    pake: &Arc<Pake>,
    plan: &Plan,
    pool: &WorkerPool,
    state: Arc<RunState>,
    sync: bool,
    aggregate: &mut TaskAggregate,
) {
    let n = plan.order.len();
    let pos_of: HashMap<usize, usize> = plan
        .order
        .iter()
        .enumerate()
        .map(|(pos, &id)| (id, pos))
        .collect();

    // dependency counts and dependent lists, restricted to the plan
    let mut remaining = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (pos, &id) in plan.order.iter().enumerate() {
        for dep in &plan.deps[id] {
            if let Some(&dep_pos) = pos_of.get(dep) {
                remaining[pos] += 1;
                dependents[dep_pos].push(pos);
            }
        }
    }

    let (done_tx, done_rx) = crossbeam_channel::unbounded::<(usize, TaskRun)>();
    let mut results: Vec<Option<TaskRun>> = (0..n).map(|_| None).collect();
    let mut in_flight = 0usize;
    let mut flushed = 0usize;
    let mut failing = false;

    let submit = |pos: usize, in_flight: &mut usize| {
        let id = plan.order[pos];
        let pake = Arc::clone(pake);
        let deps = plan.deps[id].clone();
        let state = Arc::clone(&state);
        let pool_for_task = pool.clone();
        let done_tx = done_tx.clone();
        *in_flight += 1;
        let _ = pool.submit(move || {
            let run = run_task(&pake, id, &deps, &state, &pool_for_task, sync);
            done_tx
                .send((pos, run))
                .expect("driver outlives its workers");
            Ok(())
        });
    };

    for pos in 0..n {
        if remaining[pos] == 0 {
            submit(pos, &mut in_flight);
        }
    }

    while in_flight > 0 {
        let (pos, run) = done_rx.recv().expect("completion channel closed");
        in_flight -= 1;

        let failed = run.error.is_some();
        results[pos] = Some(run);

        // flush every completed prefix entry, in plan order
        while flushed < n {
            match &results[flushed] {
                Some(run) => flush(&run.queue),
                None => break,
            }
            flushed += 1;
        }

        if failed {
            if !failing {
                debug!(task = pake.task_name(plan.order[pos]), "first failure, draining");
            }
            failing = true;
        }

        if !failing {
            // one dependent may appear twice if it declared the same
            // dependency twice; the graph already collapsed those
            for &dep_pos in &dependents[pos] {
                remaining[dep_pos] -= 1;
                if remaining[dep_pos] == 0 {
                    submit(dep_pos, &mut in_flight);
                }
            }
        }
    }

    // whatever completed after the failure still flushes, in order
    for run in results.iter().flatten().skip(flushed) {
        flush(&run.queue);
    }

    for (pos, run) in results.into_iter().enumerate() {
        let Some(run) = run else { continue };
        if let Some(error) = run.error {
            let id = plan.order[pos];
            aggregate.push(TaskFailure {
                id,
                task: pake.task_name(id).to_owned(),
                error,
            });
        }
    }
}

/// Classify one task and, if it is out of date, run its body with a fresh
/// context. Always records the task's concrete outputs for dependents.
fn run_task(
    pake: &Arc<Pake>,
    id: usize,
    deps: &[usize],
    state: &RunState,
    pool: &WorkerPool,
    sync: bool,
) -> TaskRun {
    let queue = Arc::new(OutputQueue::new(sync));
    let task = pake.task_at(id);

    let io = match outdated::classify(&task.name, &task.inputs, &task.outputs) {
        Ok(io) => io,
        Err(error) => {
            return TaskRun {
                queue,
                error: Some(error),
            };
        }
    };

    {
        let mut outputs = state.outputs.lock().unwrap();
        outputs.insert(id, io.outputs.clone());
    }

    if !io.outdated {
        debug!(task = %task.name, "up to date, skipping");
        return TaskRun { queue, error: None };
    }

    let dependency_outputs = {
        let outputs = state.outputs.lock().unwrap();
        deps.iter()
            .filter_map(|dep| outputs.get(dep))
            .flatten()
            .cloned()
            .collect()
    };

    let write_result = queue
        .lock()
        .write_all(format!("===== Executing Task: \"{}\"\n", task.name).as_bytes());
    if let Err(error) = write_result {
        return TaskRun {
            queue,
            error: Some(error.into()),
        };
    }

    debug!(task = %task.name, "executing");
    let context = TaskContext::new(
        Arc::clone(pake),
        id,
        io,
        dependency_outputs,
        Arc::clone(&queue),
        pool.clone(),
    );

    let error = crate::pool::run_caught(|| (task.body)(&context)).err();
    TaskRun { queue, error }
}

/// Flush one task's buffered output to stdout as a single block. The
/// stdout handle's own lock is the process-wide flush lock.
fn flush(queue: &OutputQueue) {
    let bytes = queue.take();
    if !bytes.is_empty() {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(&bytes);
        let _ = stdout.flush();
    }
}
