//! Built-in assistant workflow: `analyze_input` → `generate_response`.

use futures::future::BoxFuture;
use serde_json::json;

use stepgraph_core::config::EngineConfig;
use stepgraph_core::error::{NodeError, Result};
use stepgraph_core::state::{State, StateUpdate};
use stepgraph_core::traits::NodeHandler;
use stepgraph_core::types::NodeContext;
use stepgraph_engine::{Graph, GraphBuilder, NodeMetadata};

pub const ANALYZE_INPUT: &str = "analyze_input";
pub const GENERATE_RESPONSE: &str = "generate_response";

const QUESTION_WORDS: &[&str] = &[
    "who", "what", "when", "where", "why", "how", "which", "can", "could", "should", "is", "are",
    "do", "does",
];

/// Normalises the raw `user_input` and derives simple features from it.
pub struct AnalyzeInput;

impl NodeHandler for AnalyzeInput {
    fn execute(
        &self,
        state: State,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let raw = state
                .require("user_input")?
                .as_str()
                .ok_or_else(|| NodeError::fatal("user_input must be a string"))?;

            let words: Vec<&str> = raw.split_whitespace().collect();
            if words.is_empty() {
                return Err(NodeError::fatal("user_input is empty"));
            }
            let processed = words.join(" ");
            let first = words[0].to_lowercase();
            let is_question = processed.ends_with('?') || QUESTION_WORDS.contains(&first.as_str());

            Ok(StateUpdate::new()
                .with("processed_input", json!(processed))
                .with("word_count", json!(words.len()))
                .with("is_question", json!(is_question)))
        })
    }
}

/// Writes the user-facing `final_output` from the analysed input.
pub struct GenerateResponse;

impl NodeHandler for GenerateResponse {
    fn execute(
        &self,
        state: State,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let processed = state
                .require("processed_input")?
                .as_str()
                .ok_or_else(|| NodeError::fatal("processed_input must be a string"))?;
            let words = state.get("word_count").and_then(|v| v.as_u64()).unwrap_or(0);

            let output = if state.get_bool("is_question").unwrap_or(false) {
                format!(
                    "You asked: \"{}\". Here is what I understood from your question.",
                    processed
                )
            } else {
                format!("You said: \"{}\" ({} words). Noted.", processed, words)
            };

            Ok(StateUpdate::new().with("final_output", json!(output)))
        })
    }
}

/// Build the assistant graph, applying entry/terminal overrides from config.
pub fn build_graph(config: &EngineConfig) -> Result<Graph> {
    let mut builder = GraphBuilder::new();
    builder
        .add_node_with(
            ANALYZE_INPUT,
            AnalyzeInput,
            NodeMetadata::new().with_tags(vec!["analysis".into()]),
        )?
        .add_node_with(
            GENERATE_RESPONSE,
            GenerateResponse,
            NodeMetadata::new().with_tags(vec!["generation".into()]),
        )?
        .add_edge(ANALYZE_INPUT, GENERATE_RESPONSE)?
        .set_entry(ANALYZE_INPUT)
        .add_terminal(GENERATE_RESPONSE)
        .apply_config(config);
    builder.build()
}
