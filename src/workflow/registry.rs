/// In-memory flow registry and run ledger
///
/// Flow definitions live behind an `ArcSwap` so readers (the scheduler tick,
/// run loaders) never block writers: every change clones the map and swaps the
/// pointer. Runs and steps are mutated under an async mutex and every step
/// transition is appended to an ordered ledger, which is what tests use to
/// assert on execution order.

use crate::workflow::{
    run::{PlannedStep, Run, RunStatus, RunStep, StepStatus, StepUpdate},
    store::{Credential, CredentialStore, FlowStore, RunStore},
    types::FlowRecord,
};
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// One recorded step transition
#[derive(Debug, Clone, PartialEq)]
pub struct StepTransition {
    pub run_id: String,
    pub step_key: String,
    pub node_id: Option<String>,
    pub status: StepStatus,
}

#[derive(Debug, Default)]
struct Ledger {
    runs: HashMap<String, Run>,
    /// Steps in creation order
    steps: Vec<RunStep>,
    transitions: Vec<StepTransition>,
}

impl Ledger {
    fn step_mut(&mut self, step_id: &str) -> Option<&mut RunStep> {
        self.steps.iter_mut().find(|step| step.id == step_id)
    }

    fn record(&mut self, step: &RunStep) {
        self.transitions.push(StepTransition {
            run_id: step.run_id.clone(),
            step_key: step.step_key.clone(),
            node_id: step.node_id.clone(),
            status: step.status,
        });
    }
}

/// Lock-free flow registry plus an in-memory run/step ledger
#[derive(Debug)]
pub struct MemoryStore {
    flows: ArcSwap<HashMap<String, FlowRecord>>,
    credentials: ArcSwap<HashMap<String, Credential>>,
    ledger: Mutex<Ledger>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            flows: ArcSwap::new(Arc::new(HashMap::new())),
            credentials: ArcSwap::new(Arc::new(HashMap::new())),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Insert or replace a flow (atomic pointer swap)
    pub fn upsert_flow(&self, record: FlowRecord) {
        let current = self.flows.load();
        let mut next = (**current).clone();
        next.insert(record.id.clone(), record);
        self.flows.store(Arc::new(next));
    }

    /// Remove a flow from the registry
    pub fn remove_flow(&self, flow_id: &str) {
        let current = self.flows.load();
        let mut next = (**current).clone();
        if next.remove(flow_id).is_some() {
            self.flows.store(Arc::new(next));
        }
    }

    pub fn insert_credential(&self, credential: Credential) {
        let current = self.credentials.load();
        let mut next = (**current).clone();
        next.insert(credential.id.clone(), credential);
        self.credentials.store(Arc::new(next));
    }

    pub async fn run(&self, run_id: &str) -> Option<Run> {
        self.ledger.lock().await.runs.get(run_id).cloned()
    }

    /// Steps of a run in creation (plan) order
    pub async fn steps(&self, run_id: &str) -> Vec<RunStep> {
        self.ledger
            .lock()
            .await
            .steps
            .iter()
            .filter(|step| step.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Every transition recorded for a run, oldest first
    pub async fn transitions(&self, run_id: &str) -> Vec<StepTransition> {
        self.ledger
            .lock()
            .await
            .transitions
            .iter()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn load_flow_definition(&self, flow_id: &str) -> Result<String> {
        self.flows
            .load()
            .get(flow_id)
            .map(|record| record.definition.clone())
            .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", flow_id))
    }

    async fn list_flows(&self) -> Result<Vec<FlowRecord>> {
        let mut flows: Vec<FlowRecord> = self.flows.load().values().cloned().collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(flows)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, flow_id: &str, workflow_id: &str) -> Result<Run> {
        let run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            status: RunStatus::Queued,
            workflow_id: workflow_id.to_string(),
            log: String::new(),
        };
        self.ledger
            .lock()
            .await
            .runs
            .insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn create_steps(&self, run_id: &str, steps: &[PlannedStep]) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        for planned in steps {
            let fresh = RunStep::queued(run_id, planned);
            match ledger.step_mut(&planned.step_id) {
                Some(existing) => *existing = fresh,
                None => ledger.steps.push(fresh),
            }
        }
        Ok(())
    }

    async fn update_step_state(&self, update: StepUpdate) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let step = ledger
            .step_mut(&update.step_id)
            .ok_or_else(|| anyhow::anyhow!("Step not found: {}", update.step_id))?;
        step.apply(&update, Utc::now());
        let snapshot = step.clone();
        ledger.record(&snapshot);
        Ok(())
    }

    async fn cancel_open_steps(&self, run_id: &str, message: &str) -> Result<u64> {
        let mut ledger = self.ledger.lock().await;
        let now = Utc::now();
        let mut canceled = Vec::new();
        for step in ledger
            .steps
            .iter_mut()
            .filter(|step| step.run_id == run_id && !step.status.is_terminal())
        {
            let update = StepUpdate::new(step.id.clone(), StepStatus::Canceled).with_error(message);
            step.apply(&update, now);
            canceled.push(step.clone());
        }
        for step in &canceled {
            ledger.record(step);
        }
        Ok(canceled.len() as u64)
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus, log: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let run = ledger
            .runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;
        run.status = status;
        run.log = log.to_string();
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, credential_id: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.load().get(credential_id).cloned())
    }
}
