use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepgraphError};

/// Top-level stepgraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Execution engine limits and per-node policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overrides the graph's declared entry node.
    #[serde(default)]
    pub entry_node: Option<String>,
    /// Extra nodes designated terminal on top of those the graph declares.
    #[serde(default)]
    pub terminal_nodes: Vec<String>,
    /// Hard cap on node invocations per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Default per-node deadline.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-node overrides keyed by node name.
    #[serde(default)]
    pub nodes: HashMap<String, NodePolicyConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entry_node: None,
            terminal_nodes: vec![],
            max_steps: default_max_steps(),
            node_timeout_ms: default_node_timeout(),
            retry: RetryConfig::default(),
            nodes: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Effective timeout for a node: config override, then the value the
    /// node declared, then the engine default.
    pub fn node_timeout(&self, node: &str, declared: Option<Duration>) -> Duration {
        self.nodes
            .get(node)
            .and_then(|p| p.timeout_ms)
            .map(Duration::from_millis)
            .or(declared)
            .unwrap_or(Duration::from_millis(self.node_timeout_ms))
    }

    /// Effective retry budget for a node, resolved like `node_timeout`.
    pub fn max_retries(&self, node: &str, declared: Option<u32>) -> u32 {
        self.nodes
            .get(node)
            .and_then(|p| p.max_retries)
            .or(declared)
            .unwrap_or(self.retry.max_retries)
    }
}

/// Per-node override of the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePolicyConfig {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_max_steps() -> usize { 25 }
fn default_node_timeout() -> u64 { 30_000 }

/// Backoff shape between retries of a recoverable node failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Retry configuration for recoverable node failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Scale each delay by a random factor in 0.8..1.2.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffKind::default(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: false,
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 5_000 }

/// What to do with a run when every concurrency slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    #[default]
    Queue,
    Reject,
}

/// Run manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    /// Queue depth in `queue` mode before new runs are rejected.
    #[serde(default = "default_max_queued_runs")]
    pub max_queued_runs: usize,
    /// How long finished runs stay queryable.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            admission: AdmissionPolicy::default(),
            max_queued_runs: default_max_queued_runs(),
            retention_secs: default_retention(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

fn default_max_concurrent_runs() -> usize { 8 }
fn default_max_queued_runs() -> usize { 64 }
fn default_retention() -> u64 { 900 }
fn default_reap_interval() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read runs/history only
    Viewer,
    /// Read + start and cancel runs
    #[default]
    Operator,
    /// Full access
    Admin,
}

fn default_bind() -> String { "127.0.0.1:8000".to_string() }

/// Conversation log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// SQLite database path; `:memory:` keeps the log in-process.
    #[serde(default = "default_history_path")]
    pub path: String,
    #[serde(default = "default_history_limit")]
    pub default_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
            default_limit: default_history_limit(),
        }
    }
}

fn default_history_path() -> String { ":memory:".to_string() }
fn default_history_limit() -> usize { 20 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepgraphError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| StepgraphError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
