//! DAG execution over a worker pool.
//!
//! The coordinator walks the sub-DAG reachable from the root job, keeps a
//! pending-dependency counter per job, and hands ready jobs to a pool of
//! scoped worker threads over a channel. At most `options.jobs` actions are in
//! flight at a time; completions come back over a second channel and release
//! dependants. On the first failure nothing further is dispatched, in-flight
//! actions drain, and the first error is returned (secondary errors are
//! suppressed).
//!
//! ```text
//! ready queue ──(work channel)──> worker ── run_action ──┐
//!      ^                          worker                 │
//!      │                          worker                 v
//!      └── release dependants <──(result channel)── coordinator
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::panic;
use std::path::Path;
use std::thread;

use crossbeam_channel as channel;
use log::debug;

use super::planner::{Job, JobId, Plan};
use crate::error::{Error, Result};
use crate::rule::Rule;
use crate::workflow::{Options, RunFlags};

/// Run every job reachable from the plan's root, in dependency order.
pub(crate) fn execute(rules: &[Rule], plan: &Plan, options: &Options) -> Result<()> {
    Executor::new(rules, plan, options).run()
}

struct Executor<'a> {
    rules: &'a [Rule],
    plan: &'a Plan,
    options: &'a Options,
    pending: HashMap<JobId, usize>,
    dependants: HashMap<JobId, Vec<JobId>>,
    ready: VecDeque<JobId>,
}

impl<'a> Executor<'a> {
    fn new(rules: &'a [Rule], plan: &'a Plan, options: &'a Options) -> Self {
        // The plan may hold memoised jobs that ended up not being depended
        // on; only the sub-DAG reachable from the root executes.
        let mut reachable = HashSet::new();
        let mut stack = vec![plan.root];
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                stack.extend(plan.jobs[id].depends.iter().copied());
            }
        }

        let mut ids: Vec<JobId> = reachable.into_iter().collect();
        ids.sort_unstable();

        let mut pending = HashMap::new();
        let mut dependants: HashMap<JobId, Vec<JobId>> = HashMap::new();
        let mut ready = VecDeque::new();
        for &id in &ids {
            let depends = &plan.jobs[id].depends;
            pending.insert(id, depends.len());
            if depends.is_empty() {
                ready.push_back(id);
            }
            for &dep in depends {
                dependants.entry(dep).or_default().push(id);
            }
        }

        Executor { rules, plan, options, pending, dependants, ready }
    }

    fn run(mut self) -> Result<()> {
        let total = self.pending.len();
        let slots = self.options.jobs.max(1);
        let quiet = self.options.flags.contains(RunFlags::QUIET);
        let dry_run = self.options.flags.contains(RunFlags::DRY_RUN);

        let (work_tx, work_rx) = channel::unbounded::<JobId>();
        let (result_tx, result_rx) = channel::unbounded::<(JobId, Result<()>)>();

        thread::scope(|scope| {
            for _ in 0..slots {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let rules = self.rules;
                let plan = self.plan;
                scope.spawn(move || {
                    while let Ok(id) = work_rx.recv() {
                        let job = &plan.jobs[id];
                        let rule = &rules[job.rule];
                        // A panicking action must still produce a result, or
                        // the coordinator would wait on it forever.
                        let result =
                            panic::catch_unwind(panic::AssertUnwindSafe(|| {
                                run_action(rule, job, quiet)
                            }))
                            .unwrap_or_else(|_| {
                                Err(Error::ActionFailed {
                                    rule: rule.name().to_string(),
                                    cause: "action panicked".into(),
                                })
                            });
                        if result_tx.send((id, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            // The workers hold their own clones; dropping ours lets the
            // result channel close once they exit.
            drop(result_tx);
            drop(work_rx);

            let mut first_error: Option<Error> = None;
            let mut in_flight = 0usize;
            let mut completed = 0usize;

            loop {
                while first_error.is_none() && in_flight < slots {
                    let Some(id) = self.ready.pop_front() else { break };
                    let job = &self.plan.jobs[id];
                    let rule = &self.rules[job.rule];

                    if !job.needs_run {
                        debug!("rule '{}' is up to date", rule.name());
                        completed += 1;
                        self.release_dependants(id);
                    } else if !rule.has_action() {
                        completed += 1;
                        self.release_dependants(id);
                    } else if dry_run {
                        if !quiet {
                            println!("{}", job.message);
                        }
                        completed += 1;
                        self.release_dependants(id);
                    } else {
                        debug!("dispatching rule '{}' (outputs: {:?})", rule.name(), job.outputs);
                        in_flight += 1;
                        work_tx.send(id).expect("worker pool outlives the run");
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let (id, result) =
                    result_rx.recv().expect("workers outlive their in-flight jobs");
                in_flight -= 1;
                match result {
                    Ok(()) => {
                        completed += 1;
                        self.release_dependants(id);
                    }
                    Err(err) => {
                        debug!("job for rule '{}' failed: {err}", self.rule_name(id));
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }

            drop(work_tx);
            match first_error {
                Some(err) => Err(err),
                None => {
                    debug_assert_eq!(completed, total);
                    Ok(())
                }
            }
        })
    }

    fn rule_name(&self, id: JobId) -> &str {
        self.rules[self.plan.jobs[id].rule].name()
    }

    fn release_dependants(&mut self, id: JobId) {
        let Some(dependants) = self.dependants.remove(&id) else { return };
        for dependant in dependants {
            if let Some(count) = self.pending.get_mut(&dependant) {
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(dependant);
                }
            }
        }
    }
}

/// Run one job's action: print its message, make sure the output directories
/// exist, invoke the callback, clean up on failure, and verify the declared
/// outputs afterwards.
fn run_action(rule: &Rule, job: &Job, quiet: bool) -> Result<()> {
    let Some(action) = rule.action() else { return Ok(()) };

    if !quiet {
        println!("{}", job.message);
    }

    for output in &job.outputs {
        if let Some(dir) = Path::new(output).parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|err| Error::ActionFailed {
                    rule: rule.name().to_string(),
                    cause: err.into(),
                })?;
            }
        }
    }

    if let Err(cause) = action(&job.inputs, &job.outputs, &job.binding) {
        // Remove whatever the failed action managed to produce so a
        // half-written output cannot pass the next staleness check.
        for output in &job.outputs {
            let path = Path::new(output);
            if path.is_dir() {
                let _ = fs::remove_dir(path);
            } else if path.exists() {
                let _ = fs::remove_file(path);
            }
        }
        return Err(Error::ActionFailed { rule: rule.name().to_string(), cause });
    }

    for output in &job.outputs {
        if !Path::new(output).exists() {
            return Err(Error::MissingOutput {
                rule: rule.name().to_string(),
                path: output.clone(),
            });
        }
    }
    Ok(())
}
