use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::state::State;

/// Routing function for a conditional edge. Must return one of the edge's
/// candidate names.
pub type Predicate = Arc<dyn Fn(&State) -> String + Send + Sync>;

/// Outgoing transition rule of a node.
#[derive(Clone)]
pub enum Edge {
    /// Always continue to `target`.
    Unconditional { target: String },
    /// Continue to whichever candidate `predicate` selects.
    Conditional {
        candidates: Vec<String>,
        predicate: Predicate,
    },
    /// Run every target concurrently; updates merge in declaration order.
    FanOut { targets: Vec<String> },
}

impl Edge {
    /// Create an unconditional edge.
    pub fn to(target: impl Into<String>) -> Self {
        Self::Unconditional {
            target: target.into(),
        }
    }

    /// Create a conditional edge over a candidate set.
    pub fn conditional<I, S, F>(candidates: I, predicate: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&State) -> String + Send + Sync + 'static,
    {
        Self::Conditional {
            candidates: candidates.into_iter().map(Into::into).collect(),
            predicate: Arc::new(predicate),
        }
    }

    /// Create a fan-out edge.
    pub fn fan_out<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::FanOut {
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    /// Every node this edge may lead to.
    pub fn targets(&self) -> &[String] {
        match self {
            Self::Unconditional { target } => std::slice::from_ref(target),
            Self::Conditional { candidates, .. } => candidates,
            Self::FanOut { targets } => targets,
        }
    }

    /// Short label used in graph descriptions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unconditional { .. } => "unconditional",
            Self::Conditional { .. } => "conditional",
            Self::FanOut { .. } => "fan_out",
        }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("kind", &self.kind())
            .field("targets", &self.targets())
            .finish()
    }
}

/// Route on a boolean field: `if_true` when set, `if_false` when cleared.
///
/// A missing or non-bool field selects no candidate, which the resolver
/// reports as a routing error.
pub fn route_on_bool(
    field: impl Into<String>,
    if_true: impl Into<String>,
    if_false: impl Into<String>,
) -> impl Fn(&State) -> String + Send + Sync + 'static {
    let field = field.into();
    let if_true = if_true.into();
    let if_false = if_false.into();
    move |state: &State| match state.get_bool(&field) {
        Some(true) => if_true.clone(),
        Some(false) => if_false.clone(),
        None => String::new(),
    }
}

/// Route on a string field through a value → target table, with an
/// optional fallback target.
pub fn route_on_field<I, K, V>(
    field: impl Into<String>,
    routes: I,
    default: Option<&str>,
) -> impl Fn(&State) -> String + Send + Sync + 'static
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let field = field.into();
    let routes: HashMap<String, String> = routes
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    let default = default.map(str::to_string);
    move |state: &State| {
        state
            .get_str(&field)
            .and_then(|value| routes.get(value))
            .or(default.as_ref())
            .cloned()
            .unwrap_or_default()
    }
}

/// Where control goes after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// The node is terminal; this branch of the run is done.
    End,
    /// Run these nodes next (more than one for a fan-out).
    Nodes(Vec<String>),
}

/// Holds the outgoing edge of every node and resolves transitions.
#[derive(Debug, Default, Clone)]
pub struct EdgeResolver {
    edges: HashMap<String, Edge>,
    terminals: HashSet<String>,
}

impl EdgeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the outgoing edge of `source`. A node has at most one edge
    /// declaration; use a conditional or fan-out edge for several targets.
    pub fn add(&mut self, source: impl Into<String>, edge: Edge) -> Result<()> {
        let source = source.into();
        if self.edges.contains_key(&source) {
            return Err(StepgraphError::InvalidGraph(format!(
                "node '{}' already has an outgoing edge",
                source
            )));
        }
        self.edges.insert(source, edge);
        Ok(())
    }

    /// Designate a node as terminal: reaching it ends the run.
    pub fn mark_terminal(&mut self, name: impl Into<String>) {
        self.terminals.insert(name.into());
    }

    /// Terminal if designated so, or if it has no outgoing edge.
    pub fn is_terminal(&self, name: &str) -> bool {
        self.terminals.contains(name) || !self.edges.contains_key(name)
    }

    pub fn outgoing(&self, source: &str) -> Option<&Edge> {
        self.edges.get(source)
    }

    /// Iterate over `(source, edge)` pairs.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &Edge)> {
        self.edges.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Designated terminal nodes, sorted.
    pub fn terminals(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.terminals.iter().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve the next node(s) after `source` ran, against the freshly
    /// merged state.
    pub fn resolve(&self, source: &str, state: &State) -> Result<Next> {
        if self.terminals.contains(source) {
            return Ok(Next::End);
        }

        match self.edges.get(source) {
            None => Ok(Next::End),
            Some(Edge::Unconditional { target }) => Ok(Next::Nodes(vec![target.clone()])),
            Some(Edge::FanOut { targets }) => Ok(Next::Nodes(targets.clone())),
            Some(Edge::Conditional {
                candidates,
                predicate,
            }) => {
                let choice = predicate(state);
                if candidates.iter().any(|c| *c == choice) {
                    Ok(Next::Nodes(vec![choice]))
                } else {
                    Err(StepgraphError::Routing {
                        node: source.to_string(),
                        message: format!(
                            "predicate selected '{}', expected one of [{}]",
                            choice,
                            candidates.join(", ")
                        ),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flag_state(flag: bool) -> State {
        State::from_map([("flag".to_string(), json!(flag))])
    }

    #[test]
    fn test_edge_builders() {
        let e = Edge::to("b");
        assert_eq!(e.targets(), ["b".to_string()]);
        assert_eq!(e.kind(), "unconditional");

        let e = Edge::conditional(["c", "d"], |_: &State| "c".to_string());
        assert_eq!(e.targets().len(), 2);
        assert_eq!(e.kind(), "conditional");

        let e = Edge::fan_out(["x", "y"]);
        assert_eq!(e.targets(), ["x".to_string(), "y".to_string()]);
        assert_eq!(e.kind(), "fan_out");
    }

    #[test]
    fn test_resolve_unconditional() {
        let mut resolver = EdgeResolver::new();
        resolver.add("a", Edge::to("b")).unwrap();
        assert_eq!(
            resolver.resolve("a", &State::new()).unwrap(),
            Next::Nodes(vec!["b".into()])
        );
    }

    #[test]
    fn test_resolve_conditional_on_flag() {
        let mut resolver = EdgeResolver::new();
        resolver
            .add("b", Edge::conditional(["c", "d"], route_on_bool("flag", "d", "c")))
            .unwrap();

        assert_eq!(
            resolver.resolve("b", &flag_state(true)).unwrap(),
            Next::Nodes(vec!["d".into()])
        );
        assert_eq!(
            resolver.resolve("b", &flag_state(false)).unwrap(),
            Next::Nodes(vec!["c".into()])
        );
    }

    #[test]
    fn test_predicate_outside_candidates_is_routing_error() {
        let mut resolver = EdgeResolver::new();
        resolver
            .add("b", Edge::conditional(["c", "d"], |_: &State| "z".to_string()))
            .unwrap();

        match resolver.resolve("b", &State::new()) {
            Err(StepgraphError::Routing { node, message }) => {
                assert_eq!(node, "b");
                assert!(message.contains("'z'"));
            }
            other => panic!("expected routing error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_flag_is_routing_error() {
        let mut resolver = EdgeResolver::new();
        resolver
            .add("b", Edge::conditional(["c", "d"], route_on_bool("flag", "d", "c")))
            .unwrap();
        assert!(resolver.resolve("b", &State::new()).is_err());
    }

    #[test]
    fn test_no_outgoing_edge_is_terminal() {
        let resolver = EdgeResolver::new();
        assert!(resolver.is_terminal("leaf"));
        assert_eq!(resolver.resolve("leaf", &State::new()).unwrap(), Next::End);
    }

    #[test]
    fn test_designated_terminal_ends_run() {
        let mut resolver = EdgeResolver::new();
        resolver.add("a", Edge::to("b")).unwrap();
        resolver.mark_terminal("a");
        assert!(resolver.is_terminal("a"));
        assert_eq!(resolver.resolve("a", &State::new()).unwrap(), Next::End);
        assert_eq!(resolver.terminals(), vec!["a"]);
    }

    #[test]
    fn test_duplicate_edge_declaration_rejected() {
        let mut resolver = EdgeResolver::new();
        resolver.add("a", Edge::to("b")).unwrap();
        let err = resolver.add("a", Edge::to("c")).unwrap_err();
        assert!(matches!(err, StepgraphError::InvalidGraph(_)));
        assert_eq!(
            resolver.resolve("a", &State::new()).unwrap(),
            Next::Nodes(vec!["b".into()])
        );
    }

    #[test]
    fn test_route_on_field() {
        let route = route_on_field(
            "intent",
            [("search", "web"), ("math", "calculator")],
            Some("chat"),
        );

        let state = State::from_map([("intent".to_string(), json!("math"))]);
        assert_eq!(route(&state), "calculator");

        let state = State::from_map([("intent".to_string(), json!("smalltalk"))]);
        assert_eq!(route(&state), "chat");

        let strict = route_on_field("intent", [("search", "web")], None);
        assert_eq!(strict(&State::new()), "");
    }

    #[test]
    fn test_fan_out_resolves_all_targets_in_order() {
        let mut resolver = EdgeResolver::new();
        resolver.add("split", Edge::fan_out(["left", "right"])).unwrap();
        assert_eq!(
            resolver.resolve("split", &State::new()).unwrap(),
            Next::Nodes(vec!["left".into(), "right".into()])
        );
    }
}
