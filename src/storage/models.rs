//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Event kind recorded when a contact enters an automation.
pub const AUTOMATION_START: &str = "automation.start";
/// Event kind recorded when a run reaches a terminal state.
pub const AUTOMATION_END: &str = "automation.end";

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Exited,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Active)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "exited" => Ok(Self::Exited),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    FilteredOut,
    Failed,
    AutomationDeleted,
}

impl ExitReason {
    /// Terminal run status that goes with this reason.
    pub fn status(&self) -> RunStatus {
        match self {
            ExitReason::Completed => RunStatus::Completed,
            ExitReason::FilteredOut | ExitReason::AutomationDeleted => RunStatus::Exited,
            ExitReason::Failed => RunStatus::Failed,
        }
    }

    /// Stats counter bumped when a run ends for this reason.
    pub fn counter(&self) -> StatCounter {
        match self.status() {
            RunStatus::Completed => StatCounter::Completed,
            RunStatus::Failed => StatCounter::Failed,
            _ => StatCounter::Exited,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::FilteredOut => write!(f, "filtered_out"),
            Self::Failed => write!(f, "failed"),
            Self::AutomationDeleted => write!(f, "automation_deleted"),
        }
    }
}

impl std::str::FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "filtered_out" => Ok(Self::FilteredOut),
            "failed" => Ok(Self::Failed),
            "automation_deleted" => Ok(Self::AutomationDeleted),
            _ => Err(format!("Unknown exit reason: {}", s)),
        }
    }
}

/// Automation stats counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatCounter {
    Enrolled,
    Completed,
    Exited,
    Failed,
}

impl StatCounter {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            StatCounter::Enrolled => "stats_enrolled",
            StatCounter::Completed => "stats_completed",
            StatCounter::Exited => "stats_exited",
            StatCounter::Failed => "stats_failed",
        }
    }
}

/// One contact's execution of an automation (a "run").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactAutomation {
    pub id: String,
    pub automation_id: String,
    pub workspace_id: String,
    pub contact_email: String,
    pub status: RunStatus,
    /// `None` once the walk has run off the end of the graph.
    pub current_node_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub entered_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Snapshot of the triggering event; never modified.
    pub context: Value,
    pub exit_reason: Option<ExitReason>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContactAutomation {
    pub fn new(
        automation_id: &str,
        workspace_id: &str,
        contact_email: &str,
        root_node_id: &str,
        context: Value,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            automation_id: automation_id.to_string(),
            workspace_id: workspace_id.to_string(),
            contact_email: contact_email.to_string(),
            status: RunStatus::Active,
            current_node_id: Some(root_node_id.to_string()),
            scheduled_at: Some(now),
            entered_at: now,
            retry_count: 0,
            max_retries,
            context,
            exit_reason: None,
            last_error: None,
            updated_at: now,
        }
    }
}

/// What happened at a node, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    /// Executed and handed control to a successor.
    Advanced,
    /// Executed and suspended the run until a later time.
    Waiting,
    /// Run completed at this node.
    Completed,
    /// Run exited at this node.
    Exited,
    /// Execution failed; a retry is scheduled.
    Retrying,
    /// Execution failed permanently.
    Failed,
}

impl std::fmt::Display for NodeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advanced => write!(f, "advanced"),
            Self::Waiting => write!(f, "waiting"),
            Self::Completed => write!(f, "completed"),
            Self::Exited => write!(f, "exited"),
            Self::Retrying => write!(f, "retrying"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for NodeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advanced" => Ok(Self::Advanced),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "exited" => Ok(Self::Exited),
            "retrying" => Ok(Self::Retrying),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown node action: {}", s)),
        }
    }
}

/// Append-only audit record of a node visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub contact_automation_id: String,
    pub node_id: String,
    pub node_type: String,
    pub action: NodeAction,
    pub created_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new(run_id: &str, node_id: &str, node_type: &str, action: NodeAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            contact_automation_id: run_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            action,
            created_at: Utc::now(),
        }
    }
}

/// A run together with its audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrace {
    pub run: ContactAutomation,
    pub nodes: Vec<NodeExecution>,
}

/// Contact activity record: trigger input and progress output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub workspace_id: String,
    pub contact_email: String,
    pub kind: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub changes: Value,
    pub occurred_at: DateTime<Utc>,
}

impl TimelineEvent {
    pub fn new(workspace_id: &str, contact_email: &str, kind: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            contact_email: contact_email.to_string(),
            kind: kind.to_string(),
            entity_type: None,
            entity_id: None,
            changes: json!({}),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_entity(mut self, entity_type: &str, entity_id: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn with_changes(mut self, changes: Value) -> Self {
        self.changes = changes;
        self
    }

    /// Emitted when a contact enters an automation.
    pub fn automation_start(run: &ContactAutomation, root_node_id: &str) -> Self {
        Self::new(&run.workspace_id, &run.contact_email, AUTOMATION_START)
            .with_entity("automation", &run.automation_id)
            .with_changes(json!({
                "automation_id": run.automation_id,
                "root_node_id": root_node_id,
                "run_id": run.id,
            }))
    }

    /// Emitted when a run reaches a terminal state.
    pub fn automation_end(run: &ContactAutomation, reason: ExitReason) -> Self {
        Self::new(&run.workspace_id, &run.contact_email, AUTOMATION_END)
            .with_entity("automation", &run.automation_id)
            .with_changes(json!({
                "automation_id": run.automation_id,
                "run_id": run.id,
                "exit_reason": reason,
            }))
    }

    /// Snapshot stored on a run as its immutable context.
    pub fn to_context(&self) -> Value {
        json!({
            "event_id": self.id,
            "workspace_id": self.workspace_id,
            "email": self.contact_email,
            "kind": self.kind,
            "entity_type": self.entity_type,
            "entity_id": self.entity_id,
            "changes": self.changes,
            "occurred_at": self.occurred_at,
        })
    }
}

/// Database health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub foreign_keys_enabled: bool,
    pub integrity_check: String,
    pub journal_mode: String,
    pub busy_timeout_ms: i64,
    pub active_runs: u64,
    pub due_runs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_maps_to_status_and_counter() {
        assert_eq!(ExitReason::Completed.status(), RunStatus::Completed);
        assert_eq!(ExitReason::FilteredOut.status(), RunStatus::Exited);
        assert_eq!(ExitReason::AutomationDeleted.counter(), StatCounter::Exited);
        assert_eq!(ExitReason::Failed.counter(), StatCounter::Failed);
    }

    #[test]
    fn test_new_run_defaults() {
        let run = ContactAutomation::new("auto-1", "ws-1", "a@x.com", "start", json!({}), 3);
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.current_node_id.as_deref(), Some("start"));
        assert_eq!(run.retry_count, 0);
        assert_eq!(run.max_retries, 3);
        assert_eq!(run.scheduled_at, Some(run.entered_at));
    }

    #[test]
    fn test_event_context_snapshot() {
        let event = TimelineEvent::new("ws-1", "a@x.com", "list.subscribed")
            .with_entity("list", "newsletter")
            .with_changes(json!({"country": "FR"}));
        let ctx = event.to_context();
        assert_eq!(ctx["email"], "a@x.com");
        assert_eq!(ctx["entity_id"], "newsletter");
        assert_eq!(ctx["changes"]["country"], "FR");
    }

    #[test]
    fn test_progress_events() {
        let run = ContactAutomation::new("auto-1", "ws-1", "a@x.com", "start", json!({}), 3);
        let start = TimelineEvent::automation_start(&run, "start");
        assert_eq!(start.kind, AUTOMATION_START);
        assert_eq!(start.entity_id.as_deref(), Some("auto-1"));
        assert_eq!(start.changes["root_node_id"], "start");

        let end = TimelineEvent::automation_end(&run, ExitReason::AutomationDeleted);
        assert_eq!(end.kind, AUTOMATION_END);
        assert_eq!(end.changes["exit_reason"], "automation_deleted");
        assert_eq!(end.changes["run_id"], run.id.as_str());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("exited".parse::<RunStatus>().unwrap(), RunStatus::Exited);
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Active.is_terminal());
        assert_eq!(
            "automation_deleted".parse::<ExitReason>().unwrap(),
            ExitReason::AutomationDeleted
        );
    }
}
