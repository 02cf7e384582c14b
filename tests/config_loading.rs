use std::io::Write;
use std::time::Duration;

use stepgraph_core::config::{AdmissionPolicy, ApiKeyRole, AppConfig, BackoffKind};
use stepgraph_core::error::StepgraphError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
entry_node = "analyze_input"
terminal_nodes = ["generate_response"]
max_steps = 10
node_timeout_ms = 5000

[engine.retry]
max_retries = 4
backoff = "exponential"
initial_backoff_ms = 50
max_backoff_ms = 800
jitter = true

[engine.nodes.generate_response]
timeout_ms = 60000
max_retries = 1

[runs]
max_concurrent_runs = 2
admission = "reject"
max_queued_runs = 0
retention_secs = 30
reap_interval_secs = 5

[gateway]
bind = "0.0.0.0:9999"

[[gateway.api_keys]]
name = "ci"
key = "sk_ci_key"
role = "admin"

[[gateway.api_keys]]
name = "dashboard"
key = "sk_view"
role = "viewer"

[history]
path = "/var/lib/stepgraph/history.db"
default_limit = 5
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.entry_node.as_deref(), Some("analyze_input"));
    assert_eq!(config.engine.terminal_nodes, vec!["generate_response"]);
    assert_eq!(config.engine.max_steps, 10);
    assert_eq!(config.engine.retry.max_retries, 4);
    assert_eq!(config.engine.retry.backoff, BackoffKind::Exponential);
    assert!(config.engine.retry.jitter);

    assert_eq!(
        config.engine.node_timeout("generate_response", None),
        Duration::from_secs(60)
    );
    assert_eq!(
        config.engine.node_timeout("analyze_input", None),
        Duration::from_secs(5)
    );
    assert_eq!(config.engine.max_retries("generate_response", Some(9)), 1);
    assert_eq!(config.engine.max_retries("analyze_input", None), 4);

    assert_eq!(config.runs.max_concurrent_runs, 2);
    assert_eq!(config.runs.admission, AdmissionPolicy::Reject);
    assert_eq!(config.runs.retention_secs, 30);

    let gw = config.gateway.expect("gateway present");
    assert_eq!(gw.bind, "0.0.0.0:9999");
    assert_eq!(gw.api_keys.len(), 2);
    assert_eq!(gw.api_keys[0].role, ApiKeyRole::Admin);
    assert_eq!(gw.api_keys[1].role, ApiKeyRole::Viewer);

    assert_eq!(config.history.path, "/var/lib/stepgraph/history.db");
    assert_eq!(config.history.default_limit, 5);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPGRAPH_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[[gateway.api_keys]]
name = "ops"
key = "${STEPGRAPH_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let gw = config.gateway.expect("gateway present");
    assert_eq!(gw.api_keys[0].key, "expanded-key-value");
    assert_eq!(gw.api_keys[0].role, ApiKeyRole::Operator);
    assert_eq!(gw.bind, "127.0.0.1:8000");

    std::env::remove_var("STEPGRAPH_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
max_steps = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 3);
    assert_eq!(config.engine.node_timeout_ms, 30_000);
    assert_eq!(config.engine.retry.max_retries, 2);
    assert_eq!(config.engine.retry.backoff, BackoffKind::Fixed);
    assert!(config.engine.entry_node.is_none());
    assert_eq!(config.runs.max_concurrent_runs, 8);
    assert_eq!(config.runs.admission, AdmissionPolicy::Queue);
    assert!(config.gateway.is_none());
    assert_eq!(config.history.path, ":memory:");
}

#[test]
fn test_missing_file_and_bad_toml() {
    let missing = AppConfig::load(std::path::Path::new("/nonexistent/stepgraph.toml"));
    assert!(matches!(missing, Err(StepgraphError::ConfigNotFound(_))));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[runs]\nadmission = \"sometimes\"\n")
        .expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(StepgraphError::Config(_))
    ));
}
