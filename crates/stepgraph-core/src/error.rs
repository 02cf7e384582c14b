use thiserror::Error;

use crate::types::ErrorKind;

#[derive(Debug, Error)]
pub enum StepgraphError {
    // Graph construction errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Run errors
    #[error("Routing error at {node}: {message}")]
    Routing { node: String, message: String },

    #[error("Node execution failed: {node}: {message}")]
    NodeExecution {
        node: String,
        message: String,
        recoverable: bool,
    },

    #[error("Node timeout after {timeout_ms}ms: {node}")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Run exceeded step budget ({max_steps})")]
    StepBudgetExceeded { max_steps: usize },

    #[error("Conflicting writes to '{field}' from parallel branches: {}", branches.join(", "))]
    MergeConflict { field: String, branches: Vec<String> },

    #[error("Run cancelled")]
    Cancelled,

    // Run manager errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run rejected: concurrent run limit ({limit}) reached")]
    AdmissionRejected { limit: usize },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepgraphError {
    /// Classification surfaced on a failed run, if this error can end one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::NodeNotFound(_) => Some(ErrorKind::NotFound),
            Self::Routing { .. } => Some(ErrorKind::Routing),
            Self::NodeExecution {
                recoverable: true, ..
            } => Some(ErrorKind::NodeRecoverableExhausted),
            Self::NodeExecution { .. } => Some(ErrorKind::NodeFatal),
            Self::Timeout { .. } => Some(ErrorKind::Timeout),
            Self::StepBudgetExceeded { .. } => Some(ErrorKind::StepBudgetExceeded),
            Self::MergeConflict { .. } => Some(ErrorKind::MergeConflict),
            Self::Cancelled => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StepgraphError>;

/// Error returned by a node function.
///
/// `recoverable` tells the engine whether the failure is worth retrying
/// (transient tool or network failure) or should end the run immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NodeError {
    pub message: String,
    pub recoverable: bool,
}

impl NodeError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}
