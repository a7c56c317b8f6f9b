/// nodeloom: flow execution engine for node/edge automation graphs
///
/// This library plans stored flows into deterministic step lists, walks them
/// node by node with conditional routing and fan-in gating, records every step
/// transition, and keeps cron-triggered flows scheduled.

// Core configuration and setup
pub mod config;

// Flow definitions, run records and storage collaborators
pub mod workflow;

// Planner, dispatcher, engine, orchestration and cron reconciliation
pub mod runtime;

// Service wiring and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use runtime::{ExecutionEngine, NodeExecutor, RunReport};
pub use server::start_server;
pub use workflow::{FlowDefinition, FlowEdge, FlowNode};
