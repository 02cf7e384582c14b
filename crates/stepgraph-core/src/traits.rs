use futures::future::BoxFuture;

use crate::error::{NodeError, Result};
use crate::state::{State, StateUpdate};
use crate::types::{HistoryEntry, NodeContext};

/// A unit of computation in a workflow graph.
///
/// Receives the current snapshot and returns only the fields it changed.
/// The snapshot is immutable; the update lands through the engine's merge.
pub trait NodeHandler: Send + Sync + 'static {
    fn execute(
        &self,
        state: State,
        ctx: NodeContext,
    ) -> BoxFuture<'_, std::result::Result<StateUpdate, NodeError>>;
}

/// Conversation history store: persistence backend for the service boundary.
pub trait HistoryStore: Send + Sync + 'static {
    /// Append one exchange to a thread.
    fn append(
        &self,
        thread_id: &str,
        user_input: &str,
        agent_response: Option<&str>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Load the most recent `limit` entries for a thread, oldest first.
    fn load(&self, thread_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryEntry>>>;
}
