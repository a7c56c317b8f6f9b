/// Run and step records
///
/// A run is one execution of a flow; each planned node gets a step record that
/// moves `queued -> running -> {success, failed, canceled}` or straight to
/// `skipped`. Both are persisted by the storage layer and mutated only through
/// the `RunStore` trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle state of a run step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    Canceled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(StepStatus::Queued),
            "running" => Some(StepStatus::Running),
            "success" => Some(StepStatus::Success),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            "canceled" => Some(StepStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal states are never left during a run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Queued | StepStatus::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution instance of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub flow_id: String,
    pub status: RunStatus,
    /// Correlated workflow id in the orchestrator
    pub workflow_id: String,
    pub log: String,
}

/// A step produced by the planner, before it is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// `STEP_NN`, 1-based and zero-padded
    pub step_key: String,
    /// Deterministic id derived from `(run_id, step_key)`
    pub step_id: String,
    /// Absent only for the synthetic manual-trigger step of an empty flow
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub name: String,
}

/// Persisted record of one node's execution within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub step_key: String,
    pub name: String,
    pub status: StepStatus,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub log: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStep {
    /// Fresh `queued` record for a planned step
    pub fn queued(run_id: &str, planned: &PlannedStep) -> Self {
        Self {
            id: planned.step_id.clone(),
            run_id: run_id.to_string(),
            step_key: planned.step_key.clone(),
            name: planned.name.clone(),
            status: StepStatus::Queued,
            node_id: planned.node_id.clone(),
            node_type: planned.node_type.clone(),
            inputs: None,
            outputs: None,
            log: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a state transition, stamping start/finish times
    pub fn apply(&mut self, update: &StepUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        if let Some(inputs) = &update.inputs {
            self.inputs = Some(inputs.clone());
        }
        if let Some(outputs) = &update.outputs {
            self.outputs = Some(outputs.clone());
        }
        if let Some(log) = &update.log {
            self.log = Some(log.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if update.status == StepStatus::Running {
            self.started_at = Some(now);
        }
        if update.status.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}

/// A state transition for one step; `None` fields are left untouched
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub step_id: String,
    pub status: StepStatus,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub log: Option<String>,
    pub error: Option<String>,
}

impl StepUpdate {
    pub fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            inputs: None,
            outputs: None,
            log: None,
            error: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        let log = log.into();
        if !log.is_empty() {
            self.log = Some(log);
        }
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn planned() -> PlannedStep {
        PlannedStep {
            step_key: "STEP_01".into(),
            step_id: "id-1".into(),
            node_id: Some("n1".into()),
            node_type: Some("httpRequest".into()),
            name: "Fetch".into(),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            StepStatus::Queued,
            StepStatus::Running,
            StepStatus::Success,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Canceled,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("canceled"), Some(RunStatus::Canceled));
        assert_eq!(RunStatus::parse("skipped"), None);
    }

    #[test]
    fn test_apply_stamps_times() {
        let mut step = RunStep::queued("run-1", &planned());
        let now = Utc::now();

        step.apply(
            &StepUpdate::new("id-1", StepStatus::Running).with_inputs(json!({"a": 1})),
            now,
        );
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.started_at, Some(now));
        assert!(step.finished_at.is_none());

        step.apply(
            &StepUpdate::new("id-1", StepStatus::Failed).with_error("boom"),
            now,
        );
        assert_eq!(step.finished_at, Some(now));
        assert_eq!(step.inputs, Some(json!({"a": 1})));
        assert_eq!(step.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_empty_log_is_not_recorded() {
        let update = StepUpdate::new("id", StepStatus::Success).with_log("");
        assert!(update.log.is_none());
    }
}
