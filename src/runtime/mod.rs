/// Runtime Execution Engine
///
/// This module turns stored flows into executed runs:
/// - Deterministic DAG planning with petgraph
/// - Sequential depth-first walk with merge gating and if-routing
/// - Node dispatch (HTTP, integrations, conditions, triggers)
/// - Run orchestration with bounded retries and cancellation
/// - Background cron reconciliation

// Run-scoped output store and lookup scope
pub mod context;

// Typed condition evaluator for if nodes
pub mod condition;

// Deterministic step planning over the flow graph
pub mod planner;

// Decryptor and connector seams for integration actions
pub mod integrations;

// Individual node execution handlers
pub mod executor;

// Graph walk and step-state recording
pub mod engine;

// Run lifecycle, retry policy and in-process orchestrator
pub mod orchestrator;

// Background cron reconciliation for cron-triggered flows
pub mod scheduler;

// Re-export main types
pub use condition::{ConditionError, ConditionEvaluator};
pub use engine::{EngineError, ExecutionEngine, RunReport, RunSummary};
pub use executor::{NodeError, NodeExecutor, NodeOutcome};
pub use integrations::{Connector, ConnectorRegistry, ConnectorResponse, Decryptor, JsonPayloadDecryptor};
pub use orchestrator::{FlowRunner, LocalOrchestrator, RetryPolicy, RunDispatcher, RunRequest, WorkflowOrchestrator};
pub use planner::ExecutionPlan;
pub use scheduler::{CronReconciler, Reconciliation, SchedulerHandle};
