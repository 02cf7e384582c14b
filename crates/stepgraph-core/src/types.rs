use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Classification carried by every run that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Routing,
    NodeFatal,
    NodeRecoverableExhausted,
    Timeout,
    StepBudgetExceeded,
    MergeConflict,
    Cancelled,
}

/// Why a run ended without completing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    /// Node that raised the error, if one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Step counter at the time of failure.
    pub step: usize,
    pub message: String,
}

/// Per-invocation context handed to a node function.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node: String,
    /// Step number this invocation will occupy if it succeeds (1-based).
    pub step: usize,
    /// Attempt number within the retry budget (0 = first try).
    pub attempt: u32,
    /// Cancellation signal for the run. Nodes may observe it; the engine
    /// never interrupts a node that is already executing.
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(run_id: RunId, node: impl Into<String>) -> Self {
        Self {
            run_id,
            node: node.into(),
            step: 1,
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }
}

/// A single entry of a per-thread conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub thread_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_input: String,
    #[serde(default)]
    pub agent_response: Option<String>,
}

/// Run lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Run admitted and its engine loop started.
    RunStarted { run_id: RunId },
    /// A node invocation started.
    NodeStarted { run_id: RunId, node: String, step: usize, attempt: u32 },
    /// A node's update was merged.
    NodeCompleted { run_id: RunId, node: String, step: usize, elapsed_ms: u64 },
    /// A recoverable failure is being retried.
    NodeRetrying { run_id: RunId, node: String, attempt: u32, backoff_ms: u64, error: String },
    /// Run reached a terminal node.
    RunCompleted { run_id: RunId, steps: usize },
    /// Run failed.
    RunFailed { run_id: RunId, failure: RunFailure },
    /// Run observed a cancellation request at a step boundary.
    RunCancelled { run_id: RunId, steps: usize },
}
