//! Automation lifecycle and read-only run inspection.
//!
//! Automations are created as drafts, go live through `activate`, and can be
//! paused and resumed. Pausing touches no runs: the scheduler's due-set
//! predicate excludes them until the automation is live again. Deleting is a
//! soft delete that exits every active run.

use chrono::Utc;
use tracing::{info, instrument};

use crate::automation::{
    parse_automation, validate_automation, Automation, AutomationDefinition, AutomationStats,
    AutomationStatus,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{
    ContactAutomation, ExitReason, RunStatus, RunTrace, SqliteStorage, StatCounter, TimelineEvent,
};

/// Management surface over stored automations.
#[derive(Clone)]
pub struct LifecycleController {
    storage: SqliteStorage,
}

impl LifecycleController {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Validate and store a new draft automation.
    pub async fn create(
        &self,
        workspace_id: &str,
        definition: AutomationDefinition,
    ) -> Result<Automation> {
        validate_automation(&definition)?;
        let automation = Automation::from_definition(workspace_id, definition);
        self.storage.save_automation(&automation).await?;
        info!(automation_id = %automation.id, name = %automation.name, "Automation created");
        Ok(automation)
    }

    /// Create from a YAML or JSON authoring document.
    pub async fn create_from_yaml(&self, workspace_id: &str, document: &str) -> Result<Automation> {
        self.create(workspace_id, parse_automation(document)?).await
    }

    /// Replace the definition of a draft or paused automation.
    ///
    /// Runs already in flight keep walking by node id, so a live automation
    /// has to be paused first.
    pub async fn update(&self, id: &str, definition: AutomationDefinition) -> Result<Automation> {
        let mut automation = self.get(id).await?;
        if automation.status == AutomationStatus::Live {
            return Err(Error::Validation(format!(
                "Automation '{}' is live; pause it before editing",
                id
            )));
        }

        validate_automation(&definition)?;
        automation.name = definition.name;
        automation.trigger = definition.trigger;
        automation.root_node_id = definition.root_node_id;
        automation.nodes = definition.nodes;
        automation.updated_at = Utc::now();
        self.storage.save_automation(&automation).await?;

        info!(automation_id = %id, "Automation updated");
        Ok(automation)
    }

    /// Move a draft or paused automation to live.
    ///
    /// The stored definition is validated again, cycles included, since it
    /// may predate the current rules.
    #[instrument(skip(self))]
    pub async fn activate(&self, id: &str) -> Result<Automation> {
        let automation = self.get(id).await?;
        if automation.status == AutomationStatus::Live {
            return Ok(automation);
        }

        validate_automation(&automation.definition())?;
        self.set_status(automation, AutomationStatus::Live).await
    }

    /// Stop scheduling a live automation. Its runs keep their position.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: &str) -> Result<Automation> {
        let automation = self.get(id).await?;
        match automation.status {
            AutomationStatus::Paused => Ok(automation),
            AutomationStatus::Live => self.set_status(automation, AutomationStatus::Paused).await,
            AutomationStatus::Draft => Err(Error::Validation(format!(
                "Automation '{}' is a draft and cannot be paused",
                id
            ))),
        }
    }

    /// Soft-delete and exit every active run with `automation_deleted`.
    ///
    /// Returns the runs that were exited. A walk already in progress is not
    /// interrupted; its next write loses against the exit.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<Vec<ContactAutomation>> {
        self.get(id).await?;
        if !self.storage.mark_automation_deleted(id, Utc::now()).await? {
            return Ok(Vec::new());
        }

        let reason = ExitReason::AutomationDeleted;
        let exited = self.storage.exit_active_runs(id, reason).await?;
        for run in &exited {
            self.storage
                .save_timeline_event(&TimelineEvent::automation_end(run, reason))
                .await?;
            self.storage.increment_stat(id, StatCounter::Exited).await?;
            metrics::record_run_finished(&reason.to_string());
        }

        info!(automation_id = %id, exited = exited.len(), "Automation deleted");
        Ok(exited)
    }

    /// Fetch a non-deleted automation.
    pub async fn get(&self, id: &str) -> Result<Automation> {
        self.storage
            .get_automation(id)
            .await?
            .filter(|a| !a.is_deleted())
            .ok_or_else(|| Error::NotFound(format!("Automation not found: {}", id)))
    }

    pub async fn list(&self, workspace_id: &str) -> Result<Vec<Automation>> {
        self.storage.list_automations(Some(workspace_id), false).await
    }

    pub async fn stats(&self, id: &str) -> Result<AutomationStats> {
        let automation = self
            .storage
            .get_automation(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Automation not found: {}", id)))?;
        Ok(automation.stats)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<ContactAutomation> {
        self.storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run not found: {}", run_id)))
    }

    pub async fn list_runs(
        &self,
        automation_id: &str,
        status: Option<RunStatus>,
    ) -> Result<Vec<ContactAutomation>> {
        self.storage.list_runs(automation_id, status, None).await
    }

    /// Every run of a contact across the workspace's automations, oldest first.
    pub async fn list_contact_runs(
        &self,
        workspace_id: &str,
        contact_email: &str,
    ) -> Result<Vec<ContactAutomation>> {
        self.storage
            .list_runs_for_contact(workspace_id, contact_email)
            .await
    }

    /// A run together with its node executions, oldest first.
    pub async fn run_history(&self, run_id: &str) -> Result<RunTrace> {
        self.storage
            .get_run_trace(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run not found: {}", run_id)))
    }

    pub async fn list_timeline(
        &self,
        workspace_id: &str,
        contact_email: &str,
    ) -> Result<Vec<TimelineEvent>> {
        self.storage
            .list_timeline_events(workspace_id, Some(contact_email), None, None)
            .await
    }

    async fn set_status(
        &self,
        mut automation: Automation,
        status: AutomationStatus,
    ) -> Result<Automation> {
        self.storage.set_automation_status(&automation.id, status).await?;
        info!(automation_id = %automation.id, from = %automation.status, to = %status, "Automation status changed");
        automation.status = status;
        automation.updated_at = Utc::now();
        Ok(automation)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use serde_json::json;

    use super::*;
    use crate::conditions::ConditionEvaluator;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::nodes::Services;
    use crate::services::testing::RecordingSender;
    use crate::storage::{NodeAction, AUTOMATION_END};

    const DRIP: &str = r#"
name: drip
trigger:
  event_kind: list.subscribed
root_node_id: start
nodes:
  - id: start
    type: trigger
    next_node_id: wait
  - id: wait
    type: delay
    next_node_id: send
    config: { duration: 1, unit: days }
  - id: send
    type: email
    config: { template_id: T }
"#;

    const CYCLE: &str = r#"
name: loop
trigger:
  event_kind: list.subscribed
root_node_id: start
nodes:
  - id: start
    type: trigger
    next_node_id: a
  - id: a
    type: delay
    next_node_id: b
    config: { duration: 1, unit: hours }
  - id: b
    type: delay
    next_node_id: a
    config: { duration: 1, unit: hours }
"#;

    fn setup() -> (LifecycleController, Engine, SqliteStorage) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let services = Services {
            sender: Arc::new(RecordingSender::default()),
            lists: Arc::new(storage.clone()),
            evaluator: ConditionEvaluator::default(),
            send_timeout: StdDuration::from_secs(5),
        };
        let engine = Engine::new(storage.clone(), services, &Config::default());
        (LifecycleController::new(storage.clone()), engine, storage)
    }

    #[tokio::test]
    async fn test_create_starts_as_draft() {
        let (lifecycle, _, _) = setup();
        let automation = lifecycle.create_from_yaml("ws-1", DRIP).await.unwrap();
        assert_eq!(automation.status, AutomationStatus::Draft);
        assert_eq!(lifecycle.list("ws-1").await.unwrap().len(), 1);
        assert!(lifecycle.list("ws-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_cycle() {
        let (lifecycle, _, _) = setup();
        let err = lifecycle.create_from_yaml("ws-1", CYCLE).await.unwrap_err();
        assert!(matches!(err, Error::Graph(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_activate_revalidates_stored_definition() {
        let (lifecycle, _, storage) = setup();
        let definition = parse_automation(CYCLE).unwrap();
        let automation = Automation::from_definition("ws-1", definition);
        storage.save_automation(&automation).await.unwrap();

        let err = lifecycle.activate(&automation.id).await.unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
        assert_eq!(
            lifecycle.get(&automation.id).await.unwrap().status,
            AutomationStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (lifecycle, _, _) = setup();
        let automation = lifecycle.create_from_yaml("ws-1", DRIP).await.unwrap();

        assert!(matches!(
            lifecycle.pause(&automation.id).await,
            Err(Error::Validation(_))
        ));

        let live = lifecycle.activate(&automation.id).await.unwrap();
        assert_eq!(live.status, AutomationStatus::Live);
        let paused = lifecycle.pause(&automation.id).await.unwrap();
        assert_eq!(paused.status, AutomationStatus::Paused);
        let resumed = lifecycle.activate(&automation.id).await.unwrap();
        assert_eq!(resumed.status, AutomationStatus::Live);
        assert_eq!(
            lifecycle.get(&automation.id).await.unwrap().status,
            AutomationStatus::Live
        );
    }

    #[tokio::test]
    async fn test_update_requires_pause() {
        let (lifecycle, _, _) = setup();
        let automation = lifecycle.create_from_yaml("ws-1", DRIP).await.unwrap();
        lifecycle.activate(&automation.id).await.unwrap();

        let mut definition = parse_automation(DRIP).unwrap();
        definition.name = "drip v2".into();
        assert!(matches!(
            lifecycle.update(&automation.id, definition.clone()).await,
            Err(Error::Validation(_))
        ));

        lifecycle.pause(&automation.id).await.unwrap();
        let updated = lifecycle.update(&automation.id, definition).await.unwrap();
        assert_eq!(updated.name, "drip v2");
        assert_eq!(updated.status, AutomationStatus::Paused);
    }

    #[tokio::test]
    async fn test_delete_exits_active_runs() {
        let (lifecycle, engine, storage) = setup();
        let automation = lifecycle.create_from_yaml("ws-1", DRIP).await.unwrap();
        let automation = lifecycle.activate(&automation.id).await.unwrap();

        for email in ["a@x.com", "b@x.com"] {
            let run = engine.enroll(&automation, email, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Active);
        }

        let exited = lifecycle.delete(&automation.id).await.unwrap();
        assert_eq!(exited.len(), 2);

        let stored = storage.get_automation(&automation.id).await.unwrap().unwrap();
        assert!(stored.deleted_at.is_some());
        assert_eq!(stored.stats.exited, 2);

        for run in lifecycle.list_runs(&automation.id, None).await.unwrap() {
            assert_eq!(run.status, RunStatus::Exited);
            assert_eq!(run.exit_reason, Some(ExitReason::AutomationDeleted));
        }

        let ends = storage
            .list_timeline_events("ws-1", None, Some(AUTOMATION_END), None)
            .await
            .unwrap();
        assert_eq!(ends.len(), 2);
        assert!(ends
            .iter()
            .all(|e| e.changes["exit_reason"] == "automation_deleted"));

        assert!(matches!(
            lifecycle.get(&automation.id).await,
            Err(Error::NotFound(_))
        ));
        // Deleted automations leave the management surface.
        assert!(matches!(
            lifecycle.delete(&automation.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_history_and_timeline() {
        let (lifecycle, engine, _) = setup();
        let automation = lifecycle.create_from_yaml("ws-1", DRIP).await.unwrap();
        let automation = lifecycle.activate(&automation.id).await.unwrap();
        let run = engine.enroll(&automation, "a@x.com", json!({})).await.unwrap();

        let trace = lifecycle.run_history(&run.id).await.unwrap();
        assert_eq!(trace.run.id, run.id);
        let actions: Vec<_> = trace.nodes.iter().map(|n| n.action).collect();
        assert_eq!(actions, vec![NodeAction::Advanced, NodeAction::Waiting]);

        let timeline = lifecycle.list_timeline("ws-1", "a@x.com").await.unwrap();
        assert_eq!(timeline.len(), 1);

        let runs = lifecycle.list_contact_runs("ws-1", "a@x.com").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run.id);
        assert!(lifecycle
            .list_contact_runs("ws-2", "a@x.com")
            .await
            .unwrap()
            .is_empty());

        assert_eq!(lifecycle.stats(&automation.id).await.unwrap().enrolled, 1);
        assert!(matches!(
            lifecycle.get_run("missing").await,
            Err(Error::NotFound(_))
        ));
    }
}
