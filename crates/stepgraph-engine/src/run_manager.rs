use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepgraph_core::config::{AdmissionPolicy, EngineConfig, RunsConfig};
use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::event::EventBus;
use stepgraph_core::state::State;
use stepgraph_core::types::{ErrorKind, RunEvent, RunFailure, RunId, RunStatus};

use crate::graph::executor::panic_message;
use crate::graph::{ExecutionObserver, ExecutionResult, Executor, Graph, StepRecord};

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Latest merged state; the initial payload while pending.
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    pub steps: usize,
    pub path: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

struct RunEntry {
    snapshot: RunSnapshot,
    cancel: CancellationToken,
    status_tx: watch::Sender<RunStatus>,
}

impl RunEntry {
    fn set_status(&mut self, status: RunStatus) {
        self.snapshot.status = status;
        self.status_tx.send_replace(status);
    }
}

struct Inner {
    executor: Executor,
    config: RunsConfig,
    event_bus: Option<Arc<EventBus>>,
    runs: Mutex<HashMap<RunId, RunEntry>>,
    permits: Arc<Semaphore>,
    queued: Mutex<usize>,
}

impl Inner {
    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queued(&self) -> MutexGuard<'_, usize> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_running(&self, run_id: &RunId) {
        if let Some(entry) = self.runs().get_mut(run_id) {
            entry.snapshot.started_at = Some(Utc::now());
            entry.set_status(RunStatus::Running);
        }
    }

    fn finish(&self, run_id: &RunId, result: ExecutionResult) {
        if let Some(entry) = self.runs().get_mut(run_id) {
            entry.snapshot.state = result.state;
            entry.snapshot.steps = result.steps;
            entry.snapshot.path = result.path;
            entry.snapshot.error = result.failure;
            entry.snapshot.finished_at = Some(Utc::now());
            entry.set_status(result.status);
        }
    }

    /// The engine loop itself unwound. Keeps the last live snapshot.
    fn finish_panicked(&self, run_id: &RunId, message: String) {
        error!(run_id = %run_id, error = %message, "Run panicked");
        let failure = {
            let mut runs = self.runs();
            let Some(entry) = runs.get_mut(run_id) else {
                return;
            };
            let failure = RunFailure {
                kind: ErrorKind::NodeFatal,
                node: None,
                step: entry.snapshot.steps,
                message,
            };
            entry.snapshot.error = Some(failure.clone());
            entry.snapshot.finished_at = Some(Utc::now());
            entry.set_status(RunStatus::Failed);
            failure
        };
        if let Some(ref bus) = self.event_bus {
            bus.publish(RunEvent::RunFailed {
                run_id: run_id.clone(),
                failure,
            });
        }
    }

    /// A run cancelled before it ever got a slot.
    fn finish_unstarted(&self, run_id: &RunId) {
        if let Some(entry) = self.runs().get_mut(run_id) {
            entry.snapshot.error = Some(RunFailure {
                kind: ErrorKind::Cancelled,
                node: None,
                step: 0,
                message: StepgraphError::Cancelled.to_string(),
            });
            entry.snapshot.finished_at = Some(Utc::now());
            entry.set_status(RunStatus::Cancelled);
        }
        if let Some(ref bus) = self.event_bus {
            bus.publish(RunEvent::RunCancelled {
                run_id: run_id.clone(),
                steps: 0,
            });
        }
    }
}

/// Mirrors each merged snapshot into the run table.
struct LiveSnapshot<'a> {
    inner: &'a Inner,
    run_id: &'a RunId,
}

impl ExecutionObserver for LiveSnapshot<'_> {
    fn on_step(&self, record: &StepRecord, state: &State) {
        if let Some(entry) = self.inner.runs().get_mut(self.run_id) {
            entry.snapshot.state = state.clone();
            entry.snapshot.steps = record.step;
            entry.snapshot.path.push(record.node.clone());
        }
    }
}

/// Supervises runs: admission, status, cancellation and retention.
///
/// Each run gets its own engine loop on a tokio task. Runs share only the
/// read-only graph; state is never visible across runs.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl RunManager {
    pub fn new(
        graph: Arc<Graph>,
        engine: EngineConfig,
        runs: RunsConfig,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        let mut executor = Executor::new(graph, engine);
        if let Some(ref bus) = event_bus {
            executor = executor.with_event_bus(bus.clone());
        }
        let permits = Arc::new(Semaphore::new(runs.max_concurrent_runs.max(1)));
        Self {
            inner: Arc::new(Inner {
                executor,
                config: runs,
                event_bus,
                runs: Mutex::new(HashMap::new()),
                permits,
                queued: Mutex::new(0),
            }),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        self.inner.executor.graph()
    }

    /// Admit a new run seeded with `input` and start it in the background.
    pub fn start(&self, input: State) -> Result<RunId> {
        self.evict_expired();

        let limit = self.inner.config.max_concurrent_runs;
        let acquired = self.inner.permits.clone().try_acquire_owned();
        let permit: Option<OwnedSemaphorePermit> = match acquired {
            Ok(permit) => Some(permit),
            Err(_) => match self.inner.config.admission {
                AdmissionPolicy::Reject => {
                    warn!(limit, "Run rejected: no free slot");
                    return Err(StepgraphError::AdmissionRejected { limit });
                }
                AdmissionPolicy::Queue => {
                    let mut queued = self.inner.queued();
                    if *queued >= self.inner.config.max_queued_runs {
                        warn!(limit, queued = *queued, "Run rejected: queue full");
                        return Err(StepgraphError::AdmissionRejected { limit });
                    }
                    *queued += 1;
                    None
                }
            },
        };

        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let (status_tx, _) = watch::channel(RunStatus::Pending);
        let snapshot = RunSnapshot {
            run_id: run_id.clone(),
            status: RunStatus::Pending,
            state: input.clone(),
            error: None,
            steps: 0,
            path: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
        };
        self.inner.runs().insert(
            run_id.clone(),
            RunEntry {
                snapshot,
                cancel: cancel.clone(),
                status_tx,
            },
        );

        if permit.is_none() {
            info!(run_id = %run_id, "Run queued");
        }

        let inner = self.inner.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            let permit = match permit {
                Some(permit) => permit,
                None => {
                    let acquired = tokio::select! {
                        permit = inner.permits.clone().acquire_owned() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    };
                    *inner.queued() -= 1;
                    match acquired {
                        Some(permit) => permit,
                        None => {
                            debug!(run_id = %id, "Queued run cancelled before start");
                            inner.finish_unstarted(&id);
                            return;
                        }
                    }
                }
            };

            inner.mark_running(&id);
            let observer = LiveSnapshot {
                inner: &inner,
                run_id: &id,
            };
            let outcome = AssertUnwindSafe(inner.executor.execute(
                &id,
                input,
                &cancel,
                Some(&observer),
            ))
            .catch_unwind()
            .await;
            drop(permit);
            match outcome {
                Ok(result) => inner.finish(&id, result),
                Err(payload) => inner.finish_panicked(&id, panic_message(&*payload)),
            }
        });

        Ok(run_id)
    }

    pub fn status(&self, run_id: &RunId) -> Result<RunSnapshot> {
        self.inner
            .runs()
            .get(run_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| StepgraphError::RunNotFound(run_id.to_string()))
    }

    /// Request cooperative cancellation. Returns `false` if the run had
    /// already finished.
    pub fn cancel(&self, run_id: &RunId) -> Result<bool> {
        let mut runs = self.inner.runs();
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| StepgraphError::RunNotFound(run_id.to_string()))?;
        if entry.snapshot.status.is_terminal() {
            return Ok(false);
        }
        entry.snapshot.cancel_requested = true;
        entry.cancel.cancel();
        info!(run_id = %run_id, "Cancellation requested");
        Ok(true)
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let mut rx = {
            let runs = self.inner.runs();
            let entry = runs
                .get(run_id)
                .ok_or_else(|| StepgraphError::RunNotFound(run_id.to_string()))?;
            entry.status_tx.subscribe()
        };
        // A closed channel means the entry was evicted; status() reports it.
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.status(run_id)
    }

    /// All known runs, oldest first.
    pub fn list(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self
            .inner
            .runs()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    /// Drop terminal runs older than the retention window. Returns how many
    /// were evicted.
    pub fn evict_expired(&self) -> usize {
        let retention = Duration::from_secs(self.inner.config.retention_secs);
        let now = Utc::now();
        let mut runs = self.inner.runs();
        let before = runs.len();
        runs.retain(|_, entry| {
            let Some(finished) = entry.snapshot.finished_at else {
                return true;
            };
            match (now - finished).to_std() {
                Ok(age) => age < retention,
                Err(_) => true,
            }
        });
        let evicted = before - runs.len();
        if evicted > 0 {
            debug!(evicted, remaining = runs.len(), "Evicted expired runs");
        }
        evicted
    }

    /// Periodically evict expired runs until `shutdown` fires.
    pub async fn run_reaper(&self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.inner.config.reap_interval_secs.max(1));
        info!(
            interval_secs = interval.as_secs(),
            retention_secs = self.inner.config.retention_secs,
            "Run reaper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.evict_expired();
                }
                _ = shutdown.cancelled() => {
                    info!("Run reaper stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{node_fn, GraphBuilder};
    use serde_json::json;
    use stepgraph_core::error::NodeError;
    use stepgraph_core::state::StateUpdate;

    fn sleepy_graph(ms: u64) -> Arc<Graph> {
        let mut builder = GraphBuilder::new();
        builder
            .add_node(
                "work",
                node_fn(move |state: State, _ctx| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let n = state.get("n").cloned().unwrap_or(json!(0));
                    Ok::<_, NodeError>(StateUpdate::new().with("echo", n))
                }),
            )
            .unwrap()
            .set_entry("work");
        Arc::new(builder.build().unwrap())
    }

    fn manager(ms: u64, runs: RunsConfig) -> RunManager {
        RunManager::new(sleepy_graph(ms), EngineConfig::default(), runs, None)
    }

    fn input(n: i64) -> State {
        State::from_map([("n".to_string(), json!(n))])
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_wait() {
        let mgr = manager(10, RunsConfig::default());
        let id = mgr.start(input(7)).unwrap();
        assert_eq!(mgr.status(&id).unwrap().status, RunStatus::Pending);

        let snap = mgr.wait(&id).await.unwrap();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.state.get("echo"), Some(&json!(7)));
        assert_eq!(snap.path, vec!["work"]);
        assert!(snap.started_at.is_some());
        assert!(snap.finished_at.is_some());
        assert!(snap.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_are_isolated() {
        let mgr = manager(10, RunsConfig::default());
        let a = mgr.start(input(1)).unwrap();
        let b = mgr.start(input(2)).unwrap();
        assert_ne!(a, b);

        let (sa, sb) = (mgr.wait(&a).await.unwrap(), mgr.wait(&b).await.unwrap());
        assert_eq!(sa.state.get("echo"), Some(&json!(1)));
        assert_eq!(sb.state.get("echo"), Some(&json!(2)));
        assert_eq!(mgr.list().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let mgr = manager(1, RunsConfig::default());
        let ghost = RunId::from_string("nope");
        assert!(matches!(mgr.status(&ghost), Err(StepgraphError::RunNotFound(_))));
        assert!(matches!(mgr.cancel(&ghost), Err(StepgraphError::RunNotFound(_))));
        assert!(matches!(mgr.wait(&ghost).await, Err(StepgraphError::RunNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_is_not_acked() {
        let mgr = manager(1, RunsConfig::default());
        let id = mgr.start(input(1)).unwrap();
        mgr.wait(&id).await.unwrap();
        assert!(!mgr.cancel(&id).unwrap());
        assert_eq!(mgr.status(&id).unwrap().status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_when_full() {
        let runs = RunsConfig {
            max_concurrent_runs: 1,
            admission: AdmissionPolicy::Reject,
            ..RunsConfig::default()
        };
        let mgr = manager(1_000, runs);
        let first = mgr.start(input(1)).unwrap();
        assert!(matches!(
            mgr.start(input(2)),
            Err(StepgraphError::AdmissionRejected { limit: 1 })
        ));

        mgr.wait(&first).await.unwrap();
        assert!(mgr.start(input(3)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_then_run() {
        let runs = RunsConfig {
            max_concurrent_runs: 1,
            max_queued_runs: 1,
            ..RunsConfig::default()
        };
        let mgr = manager(100, runs);
        let first = mgr.start(input(1)).unwrap();
        let second = mgr.start(input(2)).unwrap();
        assert!(matches!(
            mgr.start(input(3)),
            Err(StepgraphError::AdmissionRejected { .. })
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.status(&first).unwrap().status, RunStatus::Running);
        assert_eq!(mgr.status(&second).unwrap().status, RunStatus::Pending);

        let snap = mgr.wait(&second).await.unwrap();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.state.get("echo"), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_run() {
        let runs = RunsConfig {
            max_concurrent_runs: 1,
            ..RunsConfig::default()
        };
        let mgr = manager(1_000, runs);
        let _first = mgr.start(input(1)).unwrap();
        let second = mgr.start(input(2)).unwrap();

        assert!(mgr.cancel(&second).unwrap());
        let snap = mgr.wait(&second).await.unwrap();
        assert_eq!(snap.status, RunStatus::Cancelled);
        assert_eq!(snap.steps, 0);
        assert!(snap.cancel_requested);
        assert_eq!(snap.error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_retention() {
        let runs = RunsConfig {
            retention_secs: 0,
            ..RunsConfig::default()
        };
        let mgr = manager(1, runs);
        let id = mgr.start(input(1)).unwrap();
        mgr.wait(&id).await.unwrap();

        assert_eq!(mgr.evict_expired(), 1);
        assert!(matches!(mgr.status(&id), Err(StepgraphError::RunNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_runs_are_not_evicted() {
        let runs = RunsConfig {
            retention_secs: 0,
            ..RunsConfig::default()
        };
        let mgr = manager(1_000, runs);
        let id = mgr.start(input(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.evict_expired(), 0);
        assert_eq!(mgr.status(&id).unwrap().status, RunStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_node_still_finishes_run() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node(
                "crashy",
                node_fn(|state: State, _ctx| async move {
                    let value = state.get("x").cloned().unwrap();
                    Ok::<_, NodeError>(StateUpdate::new().with("copy", value))
                }),
            )
            .unwrap()
            .set_entry("crashy");
        let runs = RunsConfig {
            max_concurrent_runs: 1,
            admission: AdmissionPolicy::Reject,
            retention_secs: 0,
            ..RunsConfig::default()
        };
        let mgr = RunManager::new(
            Arc::new(builder.build().unwrap()),
            EngineConfig::default(),
            runs,
            None,
        );

        let id = mgr.start(State::new()).unwrap();
        let snap = tokio::time::timeout(Duration::from_secs(2), mgr.wait(&id))
            .await
            .expect("run never reached a terminal status")
            .unwrap();
        assert_eq!(snap.status, RunStatus::Failed);
        assert!(snap.finished_at.is_some());
        let failure = snap.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::NodeFatal);
        assert_eq!(failure.node.as_deref(), Some("crashy"));

        // the slot was released, and starting again evicts the finished entry
        assert!(mgr.start(State::new()).is_ok());
        assert!(matches!(mgr.status(&id), Err(StepgraphError::RunNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_finished_runs() {
        let runs = RunsConfig {
            retention_secs: 0,
            reap_interval_secs: 1,
            ..RunsConfig::default()
        };
        let mgr = manager(1, runs);
        let id = mgr.start(input(1)).unwrap();
        mgr.wait(&id).await.unwrap();

        let shutdown = CancellationToken::new();
        let reaper = tokio::spawn({
            let mgr = mgr.clone();
            let shutdown = shutdown.clone();
            async move { mgr.run_reaper(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(matches!(mgr.status(&id), Err(StepgraphError::RunNotFound(_))));
        assert!(mgr.list().is_empty());

        shutdown.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_on_shutdown() {
        let mgr = manager(1, RunsConfig::default());
        let shutdown = CancellationToken::new();
        let reaper = tokio::spawn({
            let mgr = mgr.clone();
            let shutdown = shutdown.clone();
            async move { mgr.run_reaper(shutdown).await }
        });
        tokio::time::sleep(Duration::from_secs(120)).await;
        shutdown.cancel();
        reaper.await.unwrap();
    }
}
