//! Document types shared by the planner, the executor and the runner.
//!
//! These mirror the on-disk JSON documents one to one. Enumerated values use
//! `SCREAMING_SNAKE_CASE` so files stay readable by external tooling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative task graph for one unit of work (`plan.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Workspace-relative paths that must exist before the task runs.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Workspace-relative paths the task promises to produce.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Handler-specific arguments.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl Task {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Draft,
    Running,
    Failed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pending,
    Executing,
    Blocked,
    Halted,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Done,
    Failed,
}

/// Resource usage attributed to one task outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub cpu_seconds: f64,
    pub mem_bytes: u64,
    pub tokens: u64,
    pub usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    pub task_id_ref: String,
    pub status: TaskOutcome,
    pub g_last_update: u64,
    pub cost_record: CostRecord,
}

/// Per-plan execution ledger (`status.json`), owned by the plan runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatus {
    pub plan_id: String,
    pub status: RunStatus,
    pub status_details: StatusDetails,
    #[serde(default)]
    pub tasks_status: Vec<TaskStatusEntry>,
}

impl PlanStatus {
    pub fn draft(plan_id: &str) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            status: RunStatus::Draft,
            status_details: StatusDetails {
                phase: Phase::Pending,
                failed_task: None,
                reason: None,
            },
            tasks_status: Vec::new(),
        }
    }

    pub fn entry(&self, task_id: &str) -> Option<&TaskStatusEntry> {
        self.tasks_status
            .iter()
            .find(|entry| entry.task_id_ref == task_id)
    }

    pub fn is_done(&self, task_id: &str) -> bool {
        self.entry(task_id)
            .is_some_and(|entry| entry.status == TaskOutcome::Done)
    }

    /// Insert or replace the entry for `entry.task_id_ref`.
    ///
    /// A DONE entry is never replaced; only a FAILED one can be superseded by a
    /// later attempt.
    pub fn upsert(&mut self, entry: TaskStatusEntry) {
        match self
            .tasks_status
            .iter_mut()
            .find(|existing| existing.task_id_ref == entry.task_id_ref)
        {
            Some(existing) if existing.status == TaskOutcome::Done => {}
            Some(existing) => *existing = entry,
            None => self.tasks_status.push(entry),
        }
    }

    pub fn total_cost(&self) -> CostRecord {
        self.tasks_status
            .iter()
            .fold(CostRecord::default(), |acc, entry| CostRecord {
                cpu_seconds: acc.cpu_seconds + entry.cost_record.cpu_seconds,
                mem_bytes: acc.mem_bytes + entry.cost_record.mem_bytes,
                tokens: acc.tokens + entry.cost_record.tokens,
                usd: acc.usd + entry.cost_record.usd,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub g: u64,
    pub action: String,
    pub filepath: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub primary_filepath: String,
    pub g_created_in_registry: u64,
    #[serde(default)]
    pub history: Vec<RegistryEvent>,
}

/// Cross-process artifact map (`artifact_id -> entry`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalRegistry {
    pub artifacts: BTreeMap<String, RegistryEntry>,
}

impl GlobalRegistry {
    /// Register `artifact_id` or, if already known, append a history event and
    /// move its primary path.
    pub fn record(&mut self, artifact_id: &str, filepath: &str, g: u64, action: &str) {
        let event = RegistryEvent {
            g,
            action: action.to_string(),
            filepath: filepath.to_string(),
        };
        let entry = self
            .artifacts
            .entry(artifact_id.to_string())
            .or_insert_with(|| RegistryEntry {
                primary_filepath: filepath.to_string(),
                g_created_in_registry: g,
                history: Vec::new(),
            });
        entry.primary_filepath = filepath.to_string();
        entry.history.push(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    Blocker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueState {
    Open,
}

/// Why a run escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    TaskFailed,
    MissingInputs,
    BudgetExceeded,
}

impl ReasonCode {
    pub fn priority(self) -> Priority {
        match self {
            Self::BudgetExceeded => Priority::Critical,
            Self::TaskFailed => Priority::High,
            Self::MissingInputs => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Medium,
    High,
    Critical,
}

/// Durable record of one escalation; never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub status: IssueState,
    pub g_created: u64,
    pub linked_plan_id: String,
    pub task_id: String,
    pub reason: String,
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanAttentionQueueEntry {
    pub issue_id: String,
    pub priority: Priority,
    pub reason_code: ReasonCode,
    pub timestamp: String,
    pub g_event: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task_id: &str, status: TaskOutcome, g: u64) -> TaskStatusEntry {
        TaskStatusEntry {
            task_id_ref: task_id.to_string(),
            status,
            g_last_update: g,
            cost_record: CostRecord {
                cpu_seconds: 1.5,
                ..CostRecord::default()
            },
        }
    }

    #[test]
    fn task_params_default_to_empty_object() {
        let task: Task =
            serde_json::from_str(r#"{"task_id":"t1","type":"CREATE_DIRECTORY"}"#).expect("parse");
        assert!(task.params.as_object().is_some_and(|map| map.is_empty()));
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn status_serializes_screaming_case() {
        let status = PlanStatus::draft("p1");
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["status"], "DRAFT");
        assert_eq!(json["status_details"]["phase"], "PENDING");
        assert!(json["status_details"].get("reason").is_none());
    }

    #[test]
    fn upsert_replaces_failed_but_keeps_done() {
        let mut status = PlanStatus::draft("p1");
        status.upsert(entry("a", TaskOutcome::Failed, 1));
        status.upsert(entry("a", TaskOutcome::Done, 2));
        assert!(status.is_done("a"));
        assert_eq!(status.tasks_status.len(), 1);

        status.upsert(entry("a", TaskOutcome::Failed, 3));
        assert_eq!(status.entry("a").map(|e| e.g_last_update), Some(2));
    }

    #[test]
    fn registry_record_appends_history() {
        let mut registry = GlobalRegistry::default();
        registry.record("doc", "out/a.md", 3, "created");
        registry.record("doc", "out/b.md", 5, "moved");

        let entry = &registry.artifacts["doc"];
        assert_eq!(entry.g_created_in_registry, 3);
        assert_eq!(entry.primary_filepath, "out/b.md");
        assert_eq!(entry.history.len(), 2);

        let json = serde_json::to_value(&registry).expect("serialize");
        assert!(json.get("doc").is_some());
    }
}
