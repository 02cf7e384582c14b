//! Graph Execution Engine: stateful multi-step workflow orchestration.
//!
//! A workflow is a directed graph of named `Node`s connected by `Edge`s.
//! Each node is a function from the current `State` snapshot to a partial
//! update. Edges define transitions: unconditional, conditional (a predicate
//! over state picks one of a declared candidate set), or fan-out (several
//! branches run concurrently and their updates are merged in declaration order).
//!
//! The `Executor` walks the graph from the entry node, executing each node
//! under a timeout and retry budget, merging its update into a fresh snapshot
//! and following edges until a terminal node, a failure, cancellation, or the
//! step budget ends the run.

pub mod builder;
pub mod edge;
pub mod executor;
pub mod node;
pub mod registry;

pub use builder::{Graph, GraphBuilder, GraphDescription};
pub use edge::{route_on_bool, route_on_field, Edge, EdgeResolver, Next, Predicate};
pub use executor::{ExecutionObserver, ExecutionResult, Executor, StepRecord};
pub use node::{node_fn, FnNode, Node, NodeMetadata};
pub use registry::NodeRegistry;
