//! Dependency-ordered job execution on a bounded worker pool.
//!
//! The coordinating thread owns all graph state (in-degrees, ready queue,
//! completion count). Workers only receive an action to run and report its
//! outcome back over a channel, so no lock guards the graph itself. No more
//! actions are handed out than there are idle workers, so the channel never
//! holds a job that a failure could no longer cancel.

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::unbounded;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{Action, JobGraph, NodeId};
use crate::error::BuildError;
use crate::logging::{operations, status};

/// Summary of a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Jobs whose action ran
    pub executed: usize,
    /// Jobs without an action
    pub passed_through: usize,
    pub elapsed: Duration,
}

/// A job dispatched to a worker thread.
struct Dispatch {
    node: NodeId,
    action: Action,
}

/// Outcome sent back from a worker thread.
struct Outcome {
    node: NodeId,
    result: Result<()>,
}

/// Runs job graphs
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    workers: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Scheduler {
    /// Create a scheduler running at most `workers` actions at once
    /// (0 = one per CPU).
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    /// Effective worker limit
    pub fn workers(&self) -> usize {
        match self.workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    /// Execute every job of `graph`, dependencies first.
    ///
    /// After the first failure no further job is started; jobs already
    /// running are waited for, then the first error is returned wrapped in
    /// [`BuildError::JobFailed`].
    pub fn run(&self, graph: JobGraph) -> Result<RunReport> {
        let start = Instant::now();
        let (mut jobs, members, root) = graph.into_parts();
        let total = members.iter().filter(|m| **m).count();

        let mut in_degree = vec![0usize; jobs.len()];
        let mut dependents: Vec<Vec<NodeId>> = vec![Vec::new(); jobs.len()];
        let mut runnable = 0usize;
        for (idx, job) in jobs.iter().enumerate() {
            if !members[idx] {
                continue;
            }
            if !job.is_pass_through() {
                runnable += 1;
            }
            for dep in job.dependencies() {
                in_degree[idx] += 1;
                dependents[dep.index()].push(NodeId(idx));
            }
        }

        let mut ready: VecDeque<NodeId> = (0..jobs.len())
            .filter(|&i| members[i] && in_degree[i] == 0)
            .map(NodeId)
            .collect();

        let num_workers = self.workers().min(runnable);
        debug!(
            operation = operations::GRAPH_RUN,
            job_count = total,
            workers = num_workers,
            root = jobs[root.index()].description(),
            "starting job graph"
        );

        let mut completed = 0usize;
        let mut executed = 0usize;
        let mut passed_through = 0usize;
        let mut first_error: Option<(NodeId, anyhow::Error)> = None;

        std::thread::scope(|s| -> Result<()> {
            let (job_tx, job_rx) = unbounded::<Dispatch>();
            let (result_tx, result_rx) = unbounded::<Outcome>();

            for _ in 0..num_workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                s.spawn(move || {
                    while let Ok(Dispatch { node, action }) = job_rx.recv() {
                        let result = panic::catch_unwind(AssertUnwindSafe(action)).unwrap_or_else(
                            |payload| Err(anyhow!("job panicked: {}", panic_message(&*payload))),
                        );
                        if result_tx.send(Outcome { node, result }).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let mut in_flight = 0usize;
            loop {
                if first_error.is_none() {
                    // At most one job per idle worker; anything else stays
                    // in `ready` so a failure can still skip it.
                    let mut waiting = VecDeque::new();
                    while let Some(node) = ready.pop_front() {
                        let job = &mut jobs[node.index()];
                        if !job.is_pass_through() && in_flight == num_workers {
                            waiting.push_back(node);
                            continue;
                        }
                        match job.take_action() {
                            Some(action) => {
                                debug!(
                                    operation = operations::JOB_RUN,
                                    job = job.description(),
                                    "dispatching job"
                                );
                                job_tx
                                    .send(Dispatch { node, action })
                                    .map_err(|_| anyhow!("scheduler workers exited unexpectedly"))?;
                                in_flight += 1;
                            }
                            None => {
                                completed += 1;
                                passed_through += 1;
                                release(node, &dependents, &mut in_degree, &mut ready);
                            }
                        }
                    }
                    ready = waiting;
                }

                if in_flight == 0 {
                    break;
                }

                let Outcome { node, result } = result_rx
                    .recv()
                    .map_err(|_| anyhow!("scheduler workers exited unexpectedly"))?;
                in_flight -= 1;

                match result {
                    Ok(()) => {
                        completed += 1;
                        executed += 1;
                        release(node, &dependents, &mut in_degree, &mut ready);
                    }
                    Err(error) => {
                        let description = jobs[node.index()].description();
                        if first_error.is_none() {
                            debug!(
                                operation = operations::JOB_RUN,
                                status = status::ERROR,
                                job = description,
                                in_flight,
                                "job failed, draining running jobs"
                            );
                            first_error = Some((node, error));
                        } else {
                            debug!(
                                operation = operations::JOB_RUN,
                                status = status::ERROR,
                                job = description,
                                "discarding error after first failure: {error:#}"
                            );
                        }
                    }
                }
            }

            Ok(())
        })?;

        if let Some((node, source)) = first_error {
            return Err(BuildError::JobFailed {
                description: jobs[node.index()].description().to_string(),
                source,
            }
            .into());
        }

        if completed < total {
            bail!(
                "dependency cycle detected: {} of {} jobs cannot be scheduled",
                total - completed,
                total
            );
        }

        let report = RunReport {
            executed,
            passed_through,
            elapsed: start.elapsed(),
        };
        info!(
            operation = operations::GRAPH_RUN,
            status = status::SUCCESS,
            executed,
            passed_through,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "job graph finished"
        );
        Ok(report)
    }
}

/// Mark `node` complete and queue dependents whose prerequisites are all done.
fn release(
    node: NodeId,
    dependents: &[Vec<NodeId>],
    in_degree: &mut [usize],
    ready: &mut VecDeque<NodeId>,
) {
    for &dependent in &dependents[node.index()] {
        in_degree[dependent.index()] -= 1;
        if in_degree[dependent.index()] == 0 {
            ready.push_back(dependent);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
