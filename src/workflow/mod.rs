/// Flow Definition Layer
///
/// This module handles flow definitions, run/step records, and persistence:
/// - Type definitions (FlowDefinition, FlowNode, FlowEdge)
/// - Run and step records with their lifecycle states
/// - Storage collaborator traits plus SQLite and in-memory implementations

// Flow graph types parsed from stored React Flow JSON
pub mod types;

// Typed accessors over dynamic JSON config/output values
pub mod value;

// Run and step records
pub mod run;

// Storage collaborator traits
pub mod store;

// SQLite persistence layer
pub mod storage;

// In-memory registry and run ledger
pub mod registry;

// Re-export commonly used types
pub use registry::MemoryStore;
pub use run::{PlannedStep, Run, RunStatus, RunStep, StepStatus, StepUpdate};
pub use storage::SqliteStore;
pub use store::{Credential, CredentialStore, FlowStore, RunStore};
pub use types::{FlowDefinition, FlowEdge, FlowNode, FlowRecord, NodeKind, PlanningError};
pub use value::ValueExt;
