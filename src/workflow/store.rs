/// Storage collaborator traits
///
/// The engine and scheduler never talk to a database directly. They go through
/// these traits, implemented by `SqliteStore` for the service and by
/// `MemoryStore` for tests and embedding.

use crate::workflow::{
    run::{PlannedStep, Run, RunStatus, StepUpdate},
    types::FlowRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Read access to stored flow definitions
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Raw definition JSON for one flow; errors if the flow does not exist
    async fn load_flow_definition(&self, flow_id: &str) -> Result<String>;

    /// Every stored flow, archived ones included
    async fn list_flows(&self) -> Result<Vec<FlowRecord>>;
}

/// Run and step persistence
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run in `queued` status
    async fn create_run(&self, flow_id: &str, workflow_id: &str) -> Result<Run>;

    /// Upsert the planned steps of a run, keyed by step id
    ///
    /// Re-creating an existing step resets it to `queued` so a replayed run
    /// starts from a clean slate.
    async fn create_steps(&self, run_id: &str, steps: &[PlannedStep]) -> Result<()>;

    /// Apply one state transition to a step
    async fn update_step_state(&self, update: StepUpdate) -> Result<()>;

    /// Mark every `queued`/`running` step of a run as `canceled`
    async fn cancel_open_steps(&self, run_id: &str, message: &str) -> Result<u64>;

    async fn update_run_status(&self, run_id: &str, status: RunStatus, log: &str) -> Result<()>;
}

/// A stored credential; the payload is opaque until decrypted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// Provider the credential was issued for (e.g. "google", "github")
    pub provider: String,
    pub encrypted_payload: String,
}

/// Credential lookup
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, credential_id: &str) -> Result<Option<Credential>>;
}
