/// Flow execution engine
///
/// Plans a flow, creates its steps, then walks the plan depth-first from the
/// trigger/root nodes. The walk is strictly sequential: one node at a time,
/// with an explicit stack instead of recursion so large graphs cannot blow
/// the call stack. Per-run state (visited set, output store, counters) lives
/// in `WalkState` and is dropped when the run ends.

use crate::runtime::{
    condition::IF_RESULT_FIELD,
    context::{OutputStore, Scope},
    executor::{NodeContext, NodeError, NodeExecutor},
    planner::{self, ExecutionPlan, PlannedEdge},
};
use crate::workflow::{
    run::{PlannedStep, RunStatus, StepStatus, StepUpdate},
    store::RunStore,
    types::{FlowDefinition, FlowNode, NodeKind, PlanningError},
};
use serde_json::{json, Map, Value};
use std::{collections::HashSet, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Message stored on steps closed by a run cancellation
pub const CANCELED_MESSAGE: &str = "run canceled";

/// Why a run did not finish successfully
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error("node {node_id} ({step_key}) failed: {source}")]
    NodeFailed {
        node_id: String,
        step_key: String,
        #[source]
        source: NodeError,
    },

    #[error("run canceled")]
    Canceled,

    #[error("run store error: {0:#}")]
    Store(anyhow::Error),
}

impl EngineError {
    /// Run status this error maps to
    pub fn run_status(&self) -> RunStatus {
        match self {
            EngineError::Canceled => RunStatus::Canceled,
            _ => RunStatus::Failed,
        }
    }
}

/// Counters reported for a finished walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: usize,
    pub continued: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn log(&self) -> String {
        format!(
            "executed {} node(s), {} continued after failure, {} skipped",
            self.executed, self.continued, self.skipped
        )
    }
}

/// Outcome of one `execute` call
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub error: Option<EngineError>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        self.error
            .as_ref()
            .map_or(RunStatus::Success, EngineError::run_status)
    }

    /// Run log: summary counters plus the error, if any
    pub fn log(&self) -> String {
        match &self.error {
            Some(e) => format!("{}; {}", self.summary.log(), e),
            None => self.summary.log(),
        }
    }
}

/// Mutable per-run walk state
#[derive(Debug, Default)]
struct WalkState {
    visited: HashSet<String>,
    outputs: OutputStore,
    summary: RunSummary,
}

/// Walks planned flows and records step transitions
pub struct ExecutionEngine {
    /// Node executor for handling individual node execution
    executor: Arc<NodeExecutor>,
    store: Arc<dyn RunStore>,
}

impl ExecutionEngine {
    /// Create new execution engine with node executor and step store
    pub fn new(executor: Arc<NodeExecutor>, store: Arc<dyn RunStore>) -> Self {
        Self { executor, store }
    }

    /// Plan, create steps and execute a flow for one run
    ///
    /// Safe to call again for the same run: step creation is an upsert keyed
    /// by deterministic step ids, so a replay starts from freshly queued steps.
    pub async fn execute(
        &self,
        run_id: &str,
        flow: &FlowDefinition,
        trigger_input: Value,
        cancel: &CancellationToken,
    ) -> RunReport {
        let workflow_start_time = std::time::Instant::now();
        tracing::info!("🚀 Starting run execution: {} ({} node(s), {} edge(s))",
            run_id, flow.nodes.len(), flow.edges.len());

        let plan = planner::plan(run_id, flow);
        if let Err(e) = self.store.create_steps(run_id, &plan.steps).await {
            tracing::error!("❌ Failed to create steps for run {}: {}", run_id, e);
            return RunReport {
                summary: RunSummary::default(),
                error: Some(EngineError::Store(e)),
            };
        }

        let mut state = WalkState::default();
        let walked = if flow.nodes.is_empty() {
            self.run_manual_trigger(run_id, &plan.steps[0], &trigger_input, cancel, &mut state)
                .await
        } else {
            self.walk(run_id, flow, &plan, trigger_input, cancel, &mut state)
                .await
        };

        let error = match walked {
            Err(EngineError::Canceled) => {
                match self.store.cancel_open_steps(run_id, CANCELED_MESSAGE).await {
                    Ok(count) => {
                        tracing::warn!("🛑 Run {} canceled, closed {} open step(s)", run_id, count);
                        Some(EngineError::Canceled)
                    }
                    Err(e) => Some(EngineError::Store(e)),
                }
            }
            Err(store_error @ EngineError::Store(_)) => Some(store_error),
            other => match self.skip_unvisited(&plan, &mut state).await {
                Ok(()) => other.err(),
                Err(e) => Some(other.err().unwrap_or(e)),
            },
        };

        let report = RunReport {
            summary: state.summary,
            error,
        };
        let duration = workflow_start_time.elapsed();
        match &report.error {
            None => tracing::info!("✅ Run {} completed in {:?}: {}", run_id, duration, report.summary.log()),
            Some(e) => tracing::error!("❌ Run {} ended in {:?}: {}", run_id, duration, e),
        }
        report
    }

    async fn walk(
        &self,
        run_id: &str,
        flow: &FlowDefinition,
        plan: &ExecutionPlan,
        trigger_input: Value,
        cancel: &CancellationToken,
        state: &mut WalkState,
    ) -> Result<(), EngineError> {
        let start_nodes = plan.start_nodes();
        tracing::debug!("🎯 Start nodes: {:?}", start_nodes);

        // Reverse push keeps the same pre-order as a recursive walk
        let mut stack: Vec<(String, Value)> = start_nodes
            .into_iter()
            .rev()
            .map(|node_id| (node_id, trigger_input.clone()))
            .collect();

        while let Some((node_id, input)) = stack.pop() {
            if node_id.is_empty() || state.visited.contains(&node_id) {
                continue;
            }
            let (Some(step), Some(node)) = (plan.step_for(&node_id), plan.node(flow, &node_id)) else {
                continue;
            };

            if node.kind() == NodeKind::Merge {
                let waiting: Vec<&String> = plan
                    .predecessors(&node_id)
                    .iter()
                    .filter(|p| !state.visited.contains(*p))
                    .collect();
                if !waiting.is_empty() {
                    tracing::debug!("⏳ Merge {} waiting on {:?}", node_id, waiting);
                    continue;
                }
            }

            if cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }

            let next_input = self
                .execute_step(run_id, plan, node, step, &input, cancel, state)
                .await?;

            for edge in select_edges(node, plan.successors(&node_id), &next_input)
                .into_iter()
                .rev()
            {
                stack.push((edge.target.clone(), next_input.clone()));
            }
        }
        Ok(())
    }

    /// Run one node and record its transitions; returns the outputs handed to
    /// successors
    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        run_id: &str,
        plan: &ExecutionPlan,
        node: &FlowNode,
        step: &PlannedStep,
        input: &Value,
        cancel: &CancellationToken,
        state: &mut WalkState,
    ) -> Result<Value, EngineError> {
        state.visited.insert(node.id.clone());
        state.summary.executed += 1;

        let scope = Scope::new(input, &state.outputs);
        let ctx = NodeContext {
            run_id,
            step_key: &step.step_key,
            input,
            outputs: &state.outputs,
            predecessors: plan.predecessors(&node.id),
            scope: &scope,
        };
        let mut envelope = step_envelope(run_id, &step.step_key, &node.node_type, input);
        envelope.extend(self.executor.describe_input(node, &ctx));

        self.transition(
            StepUpdate::new(&step.step_id, StepStatus::Running).with_inputs(Value::Object(envelope)),
        )
        .await?;

        let outcome = self.executor.execute_node(node, ctx, cancel).await;
        state.outputs.record(&node.id, outcome.outputs.clone());

        match outcome.error {
            Some(error) if error.is_cancellation() => {
                self.transition(
                    StepUpdate::new(&step.step_id, StepStatus::Canceled)
                        .with_outputs(outcome.outputs)
                        .with_log(outcome.log)
                        .with_error(error.to_string()),
                )
                .await?;
                Err(EngineError::Canceled)
            }
            Some(error) => {
                self.transition(
                    StepUpdate::new(&step.step_id, StepStatus::Failed)
                        .with_outputs(outcome.outputs.clone())
                        .with_log(outcome.log)
                        .with_error(error.to_string()),
                )
                .await?;
                if !node.continue_on_fail() {
                    return Err(EngineError::NodeFailed {
                        node_id: node.id.clone(),
                        step_key: step.step_key.clone(),
                        source: error,
                    });
                }
                tracing::warn!("⚠️ Node {} failed but continueOnFail is set: {}", node.id, error);
                state.summary.continued += 1;
                Ok(outcome.outputs)
            }
            None => {
                self.transition(
                    StepUpdate::new(&step.step_id, StepStatus::Success)
                        .with_outputs(outcome.outputs.clone())
                        .with_log(outcome.log),
                )
                .await?;
                Ok(outcome.outputs)
            }
        }
    }

    /// A flow without nodes still runs its synthetic manual-trigger step
    async fn run_manual_trigger(
        &self,
        run_id: &str,
        step: &PlannedStep,
        input: &Value,
        cancel: &CancellationToken,
        state: &mut WalkState,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }
        state.summary.executed += 1;
        let envelope = step_envelope(run_id, &step.step_key, "manual", input);
        self.transition(
            StepUpdate::new(&step.step_id, StepStatus::Running).with_inputs(Value::Object(envelope)),
        )
        .await?;
        let payload = if input.is_null() { json!({}) } else { input.clone() };
        self.transition(
            StepUpdate::new(&step.step_id, StepStatus::Success)
                .with_outputs(json!({"trigger": "manual", "payload": payload}))
                .with_log("manual trigger"),
        )
        .await
    }

    /// Mark every planned step whose node was never reached as skipped
    async fn skip_unvisited(&self, plan: &ExecutionPlan, state: &mut WalkState) -> Result<(), EngineError> {
        for step in &plan.steps {
            let Some(node_id) = &step.node_id else {
                continue;
            };
            if state.visited.contains(node_id) {
                continue;
            }
            state.summary.skipped += 1;
            self.transition(
                StepUpdate::new(&step.step_id, StepStatus::Skipped).with_log("node was not reached"),
            )
            .await?;
        }
        Ok(())
    }

    async fn transition(&self, update: StepUpdate) -> Result<(), EngineError> {
        tracing::debug!("📝 Step {} → {}", update.step_id, update.status);
        self.store
            .update_step_state(update)
            .await
            .map_err(EngineError::Store)
    }
}

/// Base step-input envelope shared by every node type
fn step_envelope(run_id: &str, step_key: &str, node_type: &str, input: &Value) -> Map<String, Value> {
    let mut envelope = Map::new();
    envelope.insert("run_id".into(), json!(run_id));
    envelope.insert("step".into(), json!(step_key));
    envelope.insert("node_type".into(), json!(node_type));
    envelope.insert("generated_at".into(), json!(chrono::Utc::now().to_rfc3339()));
    if !input.is_null() {
        envelope.insert("input".into(), input.clone());
    }
    envelope
}

/// Outgoing edges to follow after a node ran
///
/// `if` nodes keep only the branch matching their result; an edge without a
/// handle counts as a true-branch edge.
fn select_edges<'p>(node: &FlowNode, edges: &'p [PlannedEdge], outputs: &Value) -> Vec<&'p PlannedEdge> {
    if node.kind() != NodeKind::If {
        return edges.iter().collect();
    }
    let result = outputs
        .get(IF_RESULT_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    edges
        .iter()
        .filter(|edge| match edge.handle.as_str() {
            "" | "true" => result,
            "false" => !result,
            _ => false,
        })
        .collect()
}
