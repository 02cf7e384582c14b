use std::collections::HashMap;
use std::sync::Arc;

use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::traits::NodeHandler;

use super::node::{Node, NodeMetadata};

/// Registry of named nodes. Read-only once the graph is built.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a node under `name`. Fails if the name is taken; the
    /// existing registration is left untouched.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl NodeHandler,
        metadata: NodeMetadata,
    ) -> Result<()> {
        let name = name.into();
        self.register_node(Node::new(name, handler).with_metadata(metadata))
    }

    /// Register a pre-built node.
    pub fn register_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.name) {
            return Err(StepgraphError::DuplicateNode(node.name));
        }
        self.nodes.insert(node.name.clone(), Arc::new(node));
        Ok(())
    }

    /// Look up a node by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| StepgraphError::NodeNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
