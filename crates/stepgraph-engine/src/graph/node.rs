use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use stepgraph_core::error::NodeError;
use stepgraph_core::state::{State, StateUpdate};
use stepgraph_core::traits::NodeHandler;
use stepgraph_core::types::NodeContext;

/// Optional metadata declared alongside a node.
#[derive(Debug, Clone, Default)]
pub struct NodeMetadata {
    /// Free-form capability tags (e.g. "llm", "tool").
    pub tags: Vec<String>,
    /// Per-node deadline; falls back to the engine default.
    pub timeout: Option<Duration>,
    /// Retry budget for recoverable failures; falls back to the engine default.
    pub max_retries: Option<u32>,
}

impl NodeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capability tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// A node in the execution graph.
///
/// Registered once at graph construction and never mutated afterwards.
pub struct Node {
    /// Unique name within the graph.
    pub name: String,
    pub handler: Arc<dyn NodeHandler>,
    pub metadata: NodeMetadata,
}

impl Node {
    pub fn new(name: impl Into<String>, handler: impl NodeHandler) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            metadata: NodeMetadata::default(),
        }
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Adapter turning an async closure into a `NodeHandler`.
pub struct FnNode<F>(F);

impl<F, Fut> NodeHandler for FnNode<F>
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    fn execute(
        &self,
        state: State,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<StateUpdate, NodeError>> {
        Box::pin((self.0)(state, ctx))
    }
}

/// Wrap an async closure as a node handler.
pub fn node_fn<F, Fut>(f: F) -> FnNode<F>
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    FnNode(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepgraph_core::types::RunId;

    #[test]
    fn test_metadata_builder() {
        let meta = NodeMetadata::new()
            .with_tags(vec!["tool".into()])
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(3);

        assert_eq!(meta.tags, vec!["tool"]);
        assert_eq!(meta.timeout, Some(Duration::from_secs(5)));
        assert_eq!(meta.max_retries, Some(3));
    }

    #[tokio::test]
    async fn test_fn_node_executes_closure() {
        let node = Node::new(
            "greet",
            node_fn(|state: State, _ctx| async move {
                let name = state.require("name")?.as_str().unwrap_or("stranger").to_string();
                Ok::<_, NodeError>(
                    StateUpdate::new().with("greeting", json!(format!("hello {}", name))),
                )
            }),
        );

        let state = State::from_map([("name".to_string(), json!("Ada"))]);
        let ctx = NodeContext::new(RunId::new(), "greet");
        let update = node.handler.execute(state, ctx).await.unwrap();
        assert_eq!(update.get("greeting"), Some(&json!("hello Ada")));
    }

    #[tokio::test]
    async fn test_fn_node_missing_field_is_fatal() {
        let node = Node::new(
            "greet",
            node_fn(|state: State, _ctx| async move {
                state.require("name")?;
                Ok::<_, NodeError>(StateUpdate::new())
            }),
        );

        let ctx = NodeContext::new(RunId::new(), "greet");
        let err = node.handler.execute(State::new(), ctx).await.unwrap_err();
        assert!(!err.recoverable);
    }
}
