/// Run orchestration
///
/// `FlowRunner` is the body of one run: mark it running, load and parse the
/// definition, execute it under a bounded retry policy with a per-attempt
/// deadline, then record the final status. `LocalOrchestrator` hosts runners
/// as tokio tasks keyed by workflow id, and `RunDispatcher` is what triggers
/// (the cron scheduler, an API layer) call to create and start a run.

use crate::{
    config::EngineConfig,
    runtime::engine::{EngineError, ExecutionEngine},
    workflow::{
        run::{Run, RunStatus},
        store::{FlowStore, RunStore},
        types::FlowDefinition,
    },
};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Input handed to a workflow start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub flow_id: String,
    /// What started the run ("cron", "webhook", "manual", ...)
    pub trigger: String,
    /// Caller input passed to the start nodes
    pub input: Value,
}

/// Bounded retry around the whole execution activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.retry_backoff_ms),
            attempt_timeout: Duration::from_secs(config.activity_timeout_secs),
        }
    }

    /// Delay before retrying after `attempt` (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

/// Executes one run end to end
pub struct FlowRunner {
    engine: Arc<ExecutionEngine>,
    flows: Arc<dyn FlowStore>,
    runs: Arc<dyn RunStore>,
    policy: RetryPolicy,
}

impl FlowRunner {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        flows: Arc<dyn FlowStore>,
        runs: Arc<dyn RunStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            flows,
            runs,
            policy,
        }
    }

    /// Run a request to completion and return the final run status
    ///
    /// Errors are only returned when the run status itself cannot be written.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunStatus> {
        let run_id = request.run_id.as_str();
        tracing::info!("▶️ Running flow {} as run {} (trigger: {})", request.flow_id, run_id, request.trigger);
        self.runs
            .update_run_status(run_id, RunStatus::Running, "")
            .await?;

        let raw = match self.flows.load_flow_definition(&request.flow_id).await {
            Ok(raw) => raw,
            Err(e) => {
                let log = format!("failed to load flow {}: {}", request.flow_id, e);
                return self.finish(run_id, RunStatus::Failed, &log).await;
            }
        };
        let flow = match FlowDefinition::parse(&raw) {
            Ok(flow) => flow,
            Err(e) => {
                let log = EngineError::Planning(e).to_string();
                return self.finish(run_id, RunStatus::Failed, &log).await;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempt_token = cancel.child_token();
            let deadline = {
                let token = attempt_token.clone();
                let timeout = self.policy.attempt_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    token.cancel();
                })
            };

            let report = self
                .engine
                .execute(run_id, &flow, request.input.clone(), &attempt_token)
                .await;
            deadline.abort();

            let Some(error) = &report.error else {
                return self.finish(run_id, RunStatus::Success, &report.log()).await;
            };
            if cancel.is_cancelled() {
                return self.finish(run_id, RunStatus::Canceled, &report.log()).await;
            }

            let timed_out = matches!(error, EngineError::Canceled);
            if attempt >= self.policy.max_attempts {
                let log = if timed_out {
                    format!("{}; attempt deadline of {:?} exceeded", report.log(), self.policy.attempt_timeout)
                } else {
                    report.log()
                };
                tracing::error!("❌ Run {} failed after {} attempt(s)", run_id, attempt);
                return self.finish(run_id, RunStatus::Failed, &log).await;
            }

            let backoff = self.policy.backoff(attempt);
            tracing::warn!("🔄 Run {} attempt {}/{} failed ({}), retrying in {:?}",
                run_id, attempt, self.policy.max_attempts, error, backoff);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.finish(run_id, RunStatus::Canceled, &report.log()).await;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn finish(&self, run_id: &str, status: RunStatus, log: &str) -> Result<RunStatus> {
        tracing::info!("🏁 Run {} finished: {} ({})", run_id, status, log);
        self.runs.update_run_status(run_id, status, log).await?;
        Ok(status)
    }
}

/// Durable-execution seam: start and cancel workflows by id
#[async_trait]
pub trait WorkflowOrchestrator: Send + Sync {
    async fn start_workflow(&self, workflow_id: &str, task_queue: &str, request: RunRequest) -> Result<()>;

    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()>;
}

struct WorkflowHandle {
    /// Distinguishes reuses of the same workflow id
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<Result<RunStatus>>,
}

type WorkflowMap = Arc<Mutex<HashMap<String, WorkflowHandle>>>;

/// In-process orchestrator running each workflow as a tokio task
///
/// A workflow's handle is tracked only while it runs: the task removes its
/// own entry when the run finishes.
pub struct LocalOrchestrator {
    runner: Arc<FlowRunner>,
    task_queue: String,
    workflows: WorkflowMap,
    generations: AtomicU64,
    idle: Arc<Notify>,
}

impl LocalOrchestrator {
    pub fn new(runner: Arc<FlowRunner>, task_queue: impl Into<String>) -> Self {
        Self {
            runner,
            task_queue: task_queue.into(),
            workflows: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Wait for a tracked workflow to finish and return its final run status
    ///
    /// Returns `None` when the id is unknown or the workflow already finished
    /// and released its handle; the run record holds the status then.
    pub async fn wait(&self, workflow_id: &str) -> Result<Option<RunStatus>> {
        let Some(handle) = self.workflows.lock().await.remove(workflow_id) else {
            return Ok(None);
        };
        let status = handle
            .join
            .await
            .map_err(|e| anyhow::anyhow!("Workflow task {} panicked or was aborted: {}", workflow_id, e))??;
        Ok(Some(status))
    }

    /// Wait until no workflow is tracked
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.workflows.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Number of workflow handles currently held
    pub async fn tracked(&self) -> usize {
        self.workflows.lock().await.len()
    }

    /// Ids of workflows that have not finished yet
    pub async fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workflows
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| !handle.join.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl WorkflowOrchestrator for LocalOrchestrator {
    async fn start_workflow(&self, workflow_id: &str, task_queue: &str, request: RunRequest) -> Result<()> {
        if task_queue != self.task_queue {
            return Err(anyhow::anyhow!(
                "No worker polls task queue '{}' (this worker serves '{}')",
                task_queue,
                self.task_queue
            ));
        }

        let mut workflows = self.workflows.lock().await;
        if workflows
            .get(workflow_id)
            .is_some_and(|handle| !handle.join.is_finished())
        {
            return Err(anyhow::anyhow!("Workflow already running: {}", workflow_id));
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let runner = Arc::clone(&self.runner);
        let tracked = Arc::clone(&self.workflows);
        let idle = Arc::clone(&self.idle);
        let token = cancel.clone();
        let id = workflow_id.to_string();
        // The entry is inserted before this lock is released, so the task
        // always finds its own handle to remove
        let join = tokio::spawn(async move {
            let result = runner.run(&request, &token).await;
            if let Err(e) = &result {
                tracing::error!("❌ Workflow {} could not record its result: {}", id, e);
            }

            let mut workflows = tracked.lock().await;
            if workflows.get(&id).is_some_and(|handle| handle.generation == generation) {
                workflows.remove(&id);
            }
            if workflows.is_empty() {
                idle.notify_waiters();
            }
            result
        });

        tracing::info!("📨 Started workflow {} on task queue {}", workflow_id, task_queue);
        workflows.insert(
            workflow_id.to_string(),
            WorkflowHandle {
                generation,
                cancel,
                join,
            },
        );
        Ok(())
    }

    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflows = self.workflows.lock().await;
        let handle = workflows
            .get(workflow_id)
            .ok_or_else(|| anyhow::anyhow!("Workflow not found: {}", workflow_id))?;
        tracing::info!("🛑 Canceling workflow {}", workflow_id);
        handle.cancel.cancel();
        Ok(())
    }
}

/// Creates runs and hands them to the orchestrator
pub struct RunDispatcher {
    runs: Arc<dyn RunStore>,
    orchestrator: Arc<dyn WorkflowOrchestrator>,
    task_queue: String,
}

impl RunDispatcher {
    pub fn new(
        runs: Arc<dyn RunStore>,
        orchestrator: Arc<dyn WorkflowOrchestrator>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            runs,
            orchestrator,
            task_queue: task_queue.into(),
        }
    }

    /// Correlated workflow id for a new run of a flow
    pub fn workflow_id(flow_id: &str) -> String {
        format!("flow-{}-{}", flow_id, uuid::Uuid::new_v4())
    }

    /// Create a queued run and start its workflow
    ///
    /// If the orchestrator refuses the start, the run is marked failed and the
    /// error is returned; nothing is retried here.
    pub async fn dispatch(&self, flow_id: &str, trigger: &str, input: Value) -> Result<Run> {
        let workflow_id = Self::workflow_id(flow_id);
        let run = self.runs.create_run(flow_id, &workflow_id).await?;
        let request = RunRequest {
            run_id: run.id.clone(),
            flow_id: flow_id.to_string(),
            trigger: trigger.to_string(),
            input,
        };

        if let Err(e) = self
            .orchestrator
            .start_workflow(&workflow_id, &self.task_queue, request)
            .await
        {
            tracing::error!("❌ Failed to start workflow {} for flow {}: {}", workflow_id, flow_id, e);
            let log = format!("failed to start workflow: {}", e);
            self.runs
                .update_run_status(&run.id, RunStatus::Failed, &log)
                .await?;
            return Err(e);
        }

        tracing::info!("🚀 Dispatched run {} for flow {} ({})", run.id, flow_id, trigger);
        Ok(run)
    }
}
