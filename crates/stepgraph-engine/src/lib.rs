pub mod graph;
pub mod retry;
pub mod run_manager;

pub use graph::{
    node_fn, route_on_bool, route_on_field, Edge, EdgeResolver, ExecutionObserver,
    ExecutionResult, Executor, FnNode, Graph, GraphBuilder, GraphDescription, Next, Node,
    NodeMetadata, NodeRegistry, Predicate, StepRecord,
};
pub use run_manager::{RunManager, RunSnapshot};
