use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepgraph_core::config::EngineConfig;
use stepgraph_core::error::StepgraphError;
use stepgraph_core::event::EventBus;
use stepgraph_core::state::{State, StateUpdate};
use stepgraph_core::types::{ErrorKind, NodeContext, RunEvent, RunFailure, RunId, RunStatus};

use super::builder::Graph;
use super::edge::Next;
use crate::retry::calculate_backoff;

/// One successful node invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    /// 1-based step number.
    pub step: usize,
    pub node: String,
    /// Invocations it took, including retries.
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// Version of the snapshot produced by the merge.
    pub version: u64,
}

/// Outcome of executing a graph once.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub status: RunStatus,
    /// Last merged snapshot. On failure, the state before the failing step.
    pub state: State,
    pub steps: usize,
    /// Node names in execution order.
    pub path: Vec<String>,
    pub trace: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Receives every merged snapshot as the run advances.
pub trait ExecutionObserver: Send + Sync {
    fn on_step(&self, record: &StepRecord, state: &State);
}

struct NodeOutcome {
    update: StateUpdate,
    attempts: u32,
    elapsed_ms: u64,
}

/// Drives runs over a shared, read-only `Graph`.
///
/// Each call to `execute` owns its state exclusively; the executor itself
/// holds nothing run-specific, so one instance serves any number of
/// concurrent runs.
pub struct Executor {
    graph: Arc<Graph>,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl Executor {
    pub fn new(graph: Arc<Graph>, config: EngineConfig) -> Self {
        Self {
            graph,
            config,
            event_bus: None,
        }
    }

    /// Publish `RunEvent`s to this bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn publish(&self, event: RunEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }

    /// Run the graph from its entry node until a terminal node, a failure,
    /// cancellation, or the step budget ends it.
    ///
    /// Cancellation is only observed between steps: a node that has started
    /// runs to completion (or timeout) first.
    pub async fn execute(
        &self,
        run_id: &RunId,
        initial: State,
        cancel: &CancellationToken,
        observer: Option<&dyn ExecutionObserver>,
    ) -> ExecutionResult {
        let start = Instant::now();
        let max_steps = self.config.max_steps;
        let mut state = initial;
        let mut frontier = vec![self.graph.entry().to_string()];
        let mut steps = 0usize;
        let mut path = Vec::new();
        let mut trace = Vec::new();

        info!(run_id = %run_id, entry = %self.graph.entry(), max_steps, "Run started");
        self.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
        });

        let finish = |status: RunStatus,
                      state: State,
                      steps: usize,
                      path: Vec<String>,
                      trace: Vec<StepRecord>,
                      failure: Option<RunFailure>| {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match (&status, &failure) {
                (RunStatus::Completed, _) => {
                    info!(run_id = %run_id, steps, elapsed_ms, "Run completed");
                    self.publish(RunEvent::RunCompleted {
                        run_id: run_id.clone(),
                        steps,
                    });
                }
                (RunStatus::Cancelled, _) => {
                    info!(run_id = %run_id, steps, "Run cancelled");
                    self.publish(RunEvent::RunCancelled {
                        run_id: run_id.clone(),
                        steps,
                    });
                }
                (_, Some(failure)) => {
                    error!(
                        run_id = %run_id,
                        kind = ?failure.kind,
                        node = failure.node.as_deref().unwrap_or("-"),
                        step = failure.step,
                        error = %failure.message,
                        "Run failed"
                    );
                    self.publish(RunEvent::RunFailed {
                        run_id: run_id.clone(),
                        failure: failure.clone(),
                    });
                }
                _ => {}
            }
            ExecutionResult {
                status,
                state,
                steps,
                path,
                trace,
                failure,
                elapsed_ms,
            }
        };

        loop {
            if cancel.is_cancelled() {
                let failure = RunFailure {
                    kind: ErrorKind::Cancelled,
                    node: None,
                    step: steps,
                    message: StepgraphError::Cancelled.to_string(),
                };
                return finish(RunStatus::Cancelled, state, steps, path, trace, Some(failure));
            }

            if steps + frontier.len() > max_steps {
                let err = StepgraphError::StepBudgetExceeded { max_steps };
                let failure = to_failure(&err, None, steps);
                return finish(RunStatus::Failed, state, steps, path, trace, Some(failure));
            }

            // Every node in the frontier sees the same snapshot.
            let snapshot = state.clone();
            let outcomes = join_all(frontier.iter().enumerate().map(|(i, name)| {
                self.run_node(run_id, name, &snapshot, steps + 1 + i, cancel)
            }))
            .await;

            let mut branches = Vec::with_capacity(frontier.len());
            let mut timings = Vec::with_capacity(frontier.len());
            for (i, (name, outcome)) in frontier.iter().zip(outcomes).enumerate() {
                match outcome {
                    Ok(outcome) => {
                        timings.push((outcome.attempts, outcome.elapsed_ms));
                        branches.push((name.clone(), outcome.update));
                    }
                    Err(err) => {
                        let failure = to_failure(&err, Some(name.as_str()), steps + 1 + i);
                        return finish(RunStatus::Failed, state, steps, path, trace, Some(failure));
                    }
                }
            }

            let merged = if branches.len() == 1 {
                Ok(state.merge(&branches[0].1))
            } else {
                state.merge_branches(&branches)
            };
            state = match merged {
                Ok(next) => next,
                Err(err) => {
                    let failure = to_failure(&err, None, steps);
                    return finish(RunStatus::Failed, state, steps, path, trace, Some(failure));
                }
            };

            for ((name, _), (attempts, elapsed_ms)) in branches.iter().zip(timings) {
                steps += 1;
                let record = StepRecord {
                    step: steps,
                    node: name.clone(),
                    attempts,
                    elapsed_ms,
                    version: state.version(),
                };
                self.publish(RunEvent::NodeCompleted {
                    run_id: run_id.clone(),
                    node: name.clone(),
                    step: steps,
                    elapsed_ms,
                });
                if let Some(observer) = observer {
                    observer.on_step(&record, &state);
                }
                path.push(name.clone());
                trace.push(record);
            }

            let mut next_frontier: Vec<String> = Vec::new();
            for (name, _) in &branches {
                match self.route(name, &state) {
                    Ok(Next::End) => {
                        debug!(run_id = %run_id, node = %name, "Reached terminal node");
                    }
                    Ok(Next::Nodes(nodes)) => {
                        for node in nodes {
                            if !next_frontier.contains(&node) {
                                next_frontier.push(node);
                            }
                        }
                    }
                    Err(err) => {
                        let failure = to_failure(&err, Some(name.as_str()), steps);
                        return finish(RunStatus::Failed, state, steps, path, trace, Some(failure));
                    }
                }
            }

            if next_frontier.is_empty() {
                return finish(RunStatus::Completed, state, steps, path, trace, None);
            }
            frontier = next_frontier;
        }
    }

    /// Resolve successors of `name`; a panicking predicate is a routing error.
    fn route(&self, name: &str, state: &State) -> Result<Next, StepgraphError> {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.graph.next(name, state)))
            .unwrap_or_else(|payload| {
                Err(StepgraphError::Routing {
                    node: name.to_string(),
                    message: format!("predicate panicked: {}", panic_message(&*payload)),
                })
            })
    }

    /// Execute one node under its timeout, retrying recoverable failures.
    async fn run_node(
        &self,
        run_id: &RunId,
        name: &str,
        state: &State,
        step: usize,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, StepgraphError> {
        let node = self.graph.node(name)?;
        let timeout = self.config.node_timeout(name, node.metadata.timeout);
        let max_retries = self.config.max_retries(name, node.metadata.max_retries);
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            debug!(run_id = %run_id, node = %name, step, attempt, "Executing node");
            self.publish(RunEvent::NodeStarted {
                run_id: run_id.clone(),
                node: name.to_string(),
                step,
                attempt,
            });

            let ctx = NodeContext {
                run_id: run_id.clone(),
                node: name.to_string(),
                step,
                attempt,
                cancel: cancel.clone(),
            };

            let call = AssertUnwindSafe(async { node.handler.execute(state.clone(), ctx).await })
                .catch_unwind();

            let err = match tokio::time::timeout(timeout, call).await {
                Ok(Err(payload)) => {
                    return Err(StepgraphError::NodeExecution {
                        node: name.to_string(),
                        message: format!("node panicked: {}", panic_message(&*payload)),
                        recoverable: false,
                    });
                }
                Ok(Ok(Ok(update))) => {
                    return Ok(NodeOutcome {
                        update,
                        attempts: attempt + 1,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Ok(Ok(Err(e))) if !e.recoverable => {
                    return Err(StepgraphError::NodeExecution {
                        node: name.to_string(),
                        message: e.message,
                        recoverable: false,
                    });
                }
                Ok(Ok(Err(e))) => StepgraphError::NodeExecution {
                    node: name.to_string(),
                    message: e.message,
                    recoverable: true,
                },
                Err(_) => StepgraphError::Timeout {
                    node: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            };

            if attempt >= max_retries {
                warn!(node = %name, attempts = attempt + 1, error = %err, "Retry budget exhausted");
                return Err(err);
            }

            let backoff = calculate_backoff(attempt, &self.config.retry);
            warn!(
                node = %name,
                attempt = attempt + 1,
                max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying node"
            );
            self.publish(RunEvent::NodeRetrying {
                run_id: run_id.clone(),
                node: name.to_string(),
                attempt: attempt + 1,
                backoff_ms: backoff.as_millis() as u64,
                error: err.to_string(),
            });
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn to_failure(err: &StepgraphError, node: Option<&str>, step: usize) -> RunFailure {
    let node = node.map(str::to_string).or_else(|| match err {
        StepgraphError::NodeNotFound(name) => Some(name.clone()),
        _ => None,
    });
    RunFailure {
        kind: err.kind().unwrap_or(ErrorKind::NodeFatal),
        node,
        step,
        message: err.to_string(),
    }
}
