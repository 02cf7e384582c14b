use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use stepgraph_core::config::EngineConfig;
use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::state::State;
use stepgraph_core::traits::NodeHandler;

use super::edge::{Edge, EdgeResolver, Next};
use super::node::{Node, NodeMetadata};
use super::registry::NodeRegistry;

/// Collects nodes and edges, then validates them into a `Graph`.
///
/// Node names are checked for uniqueness on registration; every other
/// reference (entry, edge targets, terminals) is checked in `build`, so a
/// malformed workflow fails before any run starts.
#[derive(Default)]
pub struct GraphBuilder {
    registry: NodeRegistry,
    resolver: EdgeResolver,
    entry: Option<String>,
    terminals: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node with default metadata.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        handler: impl NodeHandler,
    ) -> Result<&mut Self> {
        self.add_node_with(name, handler, NodeMetadata::default())
    }

    /// Register a node with metadata.
    pub fn add_node_with(
        &mut self,
        name: impl Into<String>,
        handler: impl NodeHandler,
        metadata: NodeMetadata,
    ) -> Result<&mut Self> {
        self.registry.register(name, handler, metadata)?;
        Ok(self)
    }

    /// Register a pre-built node.
    pub fn add(&mut self, node: Node) -> Result<&mut Self> {
        self.registry.register_node(node)?;
        Ok(self)
    }

    /// Linear edge `source → target`.
    pub fn add_edge(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<&mut Self> {
        self.resolver.add(source, Edge::to(target))?;
        Ok(self)
    }

    /// Conditional edge: `predicate` must pick one of `candidates`.
    pub fn add_conditional_edge<I, S, F>(
        &mut self,
        source: impl Into<String>,
        candidates: I,
        predicate: F,
    ) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&State) -> String + Send + Sync + 'static,
    {
        self.resolver
            .add(source, Edge::conditional(candidates, predicate))?;
        Ok(self)
    }

    /// Fan-out edge: all `targets` run concurrently after `source`.
    pub fn add_fan_out<I, S>(&mut self, source: impl Into<String>, targets: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resolver.add(source, Edge::fan_out(targets))?;
        Ok(self)
    }

    /// Set the entry node.
    pub fn set_entry(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry = Some(name.into());
        self
    }

    /// Designate a terminal node.
    pub fn add_terminal(&mut self, name: impl Into<String>) -> &mut Self {
        self.terminals.push(name.into());
        self
    }

    /// Apply the entry/terminal overrides from engine configuration.
    pub fn apply_config(&mut self, config: &EngineConfig) -> &mut Self {
        if let Some(ref entry) = config.entry_node {
            self.entry = Some(entry.clone());
        }
        self.terminals.extend(config.terminal_nodes.iter().cloned());
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Graph> {
        let Self {
            registry,
            mut resolver,
            entry,
            terminals,
        } = self;

        if registry.is_empty() {
            return Err(StepgraphError::InvalidGraph("graph has no nodes".into()));
        }

        let entry = entry.ok_or_else(|| StepgraphError::InvalidGraph("no entry node set".into()))?;
        if !registry.contains(&entry) {
            return Err(StepgraphError::NodeNotFound(entry));
        }

        for (source, edge) in resolver.edges() {
            if !registry.contains(source) {
                return Err(StepgraphError::NodeNotFound(source.to_string()));
            }
            let targets = edge.targets();
            if targets.is_empty() {
                return Err(StepgraphError::InvalidGraph(format!(
                    "{} edge from '{}' has no targets",
                    edge.kind(),
                    source
                )));
            }
            if matches!(edge, Edge::FanOut { .. }) && targets.len() < 2 {
                return Err(StepgraphError::InvalidGraph(format!(
                    "fan-out from '{}' needs at least two targets",
                    source
                )));
            }
            let mut seen = HashSet::new();
            for target in targets {
                if !registry.contains(target) {
                    return Err(StepgraphError::NodeNotFound(target.clone()));
                }
                if !seen.insert(target.as_str()) {
                    return Err(StepgraphError::InvalidGraph(format!(
                        "edge from '{}' lists '{}' more than once",
                        source, target
                    )));
                }
            }
        }

        for name in &terminals {
            if !registry.contains(name) {
                return Err(StepgraphError::NodeNotFound(name.clone()));
            }
            if resolver.outgoing(name).is_some() {
                return Err(StepgraphError::InvalidGraph(format!(
                    "terminal node '{}' has an outgoing edge",
                    name
                )));
            }
        }
        for name in terminals {
            resolver.mark_terminal(name);
        }

        Ok(Graph {
            registry,
            resolver,
            entry,
        })
    }
}

/// A validated, immutable workflow graph. Shared read-only across runs.
#[derive(Debug)]
pub struct Graph {
    registry: NodeRegistry,
    resolver: EdgeResolver,
    entry: String,
}

impl Graph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &EdgeResolver {
        &self.resolver
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Result<Arc<Node>> {
        self.registry.resolve(name)
    }

    /// Resolve the successor(s) of `source` against `state`.
    pub fn next(&self, source: &str, state: &State) -> Result<Next> {
        self.resolver.resolve(source, state)
    }

    /// Structural summary for display and the HTTP API.
    pub fn describe(&self) -> GraphDescription {
        let nodes = self
            .registry
            .names()
            .into_iter()
            .filter_map(|name| self.registry.resolve(name).ok())
            .map(|node| {
                let edge = self.resolver.outgoing(&node.name);
                NodeDescription {
                    name: node.name.clone(),
                    tags: node.metadata.tags.clone(),
                    terminal: self.resolver.is_terminal(&node.name),
                    edge: edge.map(|e| e.kind()),
                    targets: edge.map(|e| e.targets().to_vec()).unwrap_or_default(),
                }
            })
            .collect();

        GraphDescription {
            entry: self.entry.clone(),
            nodes,
        }
    }
}

/// Serializable structure of a graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphDescription {
    pub entry: String,
    pub nodes: Vec<NodeDescription>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDescription {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

impl std::fmt::Display for GraphDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "entry: {}", self.entry)?;
        for node in &self.nodes {
            let arrow = match node.edge {
                Some("conditional") => format!(" -?-> {{{}}}", node.targets.join(", ")),
                Some("fan_out") => format!(" ==> [{}]", node.targets.join(", ")),
                Some(_) => format!(" --> {}", node.targets.join(", ")),
                None => String::new(),
            };
            let terminal = if node.terminal { " (terminal)" } else { "" };
            writeln!(f, "  {}{}{}", node.name, arrow, terminal)?;
        }
        Ok(())
    }
}
