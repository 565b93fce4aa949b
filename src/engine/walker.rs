//! Enrollment and the graph-walk loop.
//!
//! A walk executes nodes back to back until the run suspends (delay or
//! retry), ends, or hits the hop cap. Only the suspension point is
//! persisted; the NodeExecution trail records every step in between.
//!
//! The walker owns a lease on the run for the whole walk. Enrollment takes
//! the lease when it inserts the row; the scheduler takes it when it claims
//! a due run and renews it right before walking. The walk itself renews it
//! before every further node, and stops without executing anything once it
//! finds the lease lost. Every write of run state is conditional on still
//! holding the lease and the row still being active, so a run that was
//! exited by a delete, or reclaimed after an expired lease, is left alone.

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::retry::RetryPolicy;
use crate::automation::{Automation, Node};
use crate::config::Config;
use crate::error::{Error, ErrorCategory, Result};
use crate::metrics;
use crate::nodes::{ExecutorRegistry, NodeContext, Services, StepOutcome};
use crate::storage::{
    ContactAutomation, ExitReason, NodeAction, NodeExecution, SqliteStorage, StatCounter,
    TimelineEvent,
};

/// Drives runs through their automation graph.
pub struct Engine {
    storage: SqliteStorage,
    registry: ExecutorRegistry,
    services: Services,
    retry: RetryPolicy,
    max_hops: u32,
    default_max_retries: u32,
    worker_id: String,
    lease: Duration,
}

impl Engine {
    pub fn new(storage: SqliteStorage, services: Services, config: &Config) -> Self {
        Self {
            storage,
            registry: ExecutorRegistry::new(),
            services,
            retry: config.retry.clone(),
            max_hops: config.engine.max_hops_per_walk.max(1),
            default_max_retries: config.engine.default_max_retries,
            worker_id: config.scheduler.worker_id.clone(),
            lease: Duration::seconds(config.scheduler.lease_seconds.min(i64::MAX as u64 / 1000) as i64),
        }
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Identity under which this engine leases runs.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// How long a lease taken by this engine lasts.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Enroll a contact and walk the new run until it suspends or ends.
    #[instrument(skip(self, automation, context), fields(automation_id = %automation.id))]
    pub async fn enroll(
        &self,
        automation: &Automation,
        contact_email: &str,
        context: Value,
    ) -> Result<ContactAutomation> {
        let run = ContactAutomation::new(
            &automation.id,
            &automation.workspace_id,
            contact_email,
            &automation.root_node_id,
            context,
            self.default_max_retries,
        );

        // The lease covers the eager walk. If this process dies before the
        // walk persists, the lease lapses and the scheduler picks the run up
        // from the root.
        let lease_until = Utc::now() + self.lease;
        self.storage
            .insert_run(&run, Some((&self.worker_id, lease_until)))
            .await?;

        self.storage
            .save_timeline_event(&TimelineEvent::automation_start(&run, &automation.root_node_id))
            .await?;
        self.storage
            .increment_stat(&automation.id, StatCounter::Enrolled)
            .await?;
        metrics::record_enrollment(&automation.id);

        info!(run_id = %run.id, contact_email = %contact_email, "Contact enrolled");
        self.walk(automation, run).await
    }

    /// Walk a run from its current node. The caller must hold a fresh lease.
    #[instrument(skip(self, automation, run), fields(automation_id = %automation.id, run_id = %run.id))]
    pub async fn walk(
        &self,
        automation: &Automation,
        mut run: ContactAutomation,
    ) -> Result<ContactAutomation> {
        let mut hops = 0u32;

        loop {
            let Some(node_id) = run.current_node_id.clone() else {
                return self.finish(automation, run, ExitReason::Completed).await;
            };

            if hops >= self.max_hops {
                debug!(hops, "Hop limit reached; yielding to scheduler");
                run.scheduled_at = Some(Utc::now());
                return self.persist(run).await;
            }
            hops += 1;

            let Some(node) = automation.nodes.get(&node_id) else {
                let err = Error::Configuration(format!("Node not found: {}", node_id));
                return self.fail(automation, run, &node_id, "unknown", err).await;
            };

            if hops > 1 && !self.renew_lease(&run.id).await? {
                return self.reload_after_conflict(run).await;
            }

            let outcome = match self.execute(automation, &run, node).await {
                Ok(outcome) => outcome,
                Err(err) => return self.handle_error(automation, run, node, err).await,
            };
            run.retry_count = 0;
            run.last_error = None;

            match outcome {
                StepOutcome::Advance { next: Some(next) } => {
                    self.record(&run, node, NodeAction::Advanced).await?;
                    run.current_node_id = Some(next);
                }
                StepOutcome::Advance { next: None } => {
                    self.record(&run, node, NodeAction::Completed).await?;
                    run.current_node_id = None;
                    return self.finish(automation, run, ExitReason::Completed).await;
                }
                StepOutcome::Wait { next, until } => {
                    self.record(&run, node, NodeAction::Waiting).await?;
                    debug!(node_id = %node.id, until = %until, "Run suspended");
                    run.current_node_id = next;
                    run.scheduled_at = Some(until);
                    return self.persist(run).await;
                }
                StepOutcome::Exit { reason } => {
                    self.record(&run, node, NodeAction::Exited).await?;
                    return self.finish(automation, run, reason).await;
                }
            }
        }
    }

    async fn execute(
        &self,
        automation: &Automation,
        run: &ContactAutomation,
        node: &Node,
    ) -> Result<StepOutcome> {
        let executor = self.registry.get(node.node_type()).ok_or_else(|| {
            Error::Configuration(format!("No executor for node type {}", node.node_type()))
        })?;
        let ctx = NodeContext {
            automation,
            run,
            node,
            now: Utc::now(),
            services: &self.services,
        };
        executor.execute(&ctx).await
    }

    async fn handle_error(
        &self,
        automation: &Automation,
        mut run: ContactAutomation,
        node: &Node,
        err: Error,
    ) -> Result<ContactAutomation> {
        match err.category() {
            ErrorCategory::Transient => {
                run.retry_count += 1;
                if run.retry_count >= run.max_retries {
                    return self
                        .fail(automation, run, &node.id, node.node_type().as_str(), err)
                        .await;
                }
                let delay = self.retry.backoff(run.retry_count);
                warn!(
                    node_id = %node.id,
                    attempt = run.retry_count,
                    retry_in_secs = delay.num_seconds(),
                    error = %err,
                    "Node failed; retry scheduled"
                );
                self.record(&run, node, NodeAction::Retrying).await?;
                metrics::record_retry();
                run.last_error = Some(err.to_string());
                run.scheduled_at = Some(Utc::now() + delay);
                self.persist(run).await
            }
            ErrorCategory::Conflict => {
                debug!(node_id = %node.id, error = %err, "Conflict while executing node; skipping");
                self.storage.release_run(&run.id, &self.worker_id).await?;
                Ok(run)
            }
            ErrorCategory::ClientError | ErrorCategory::Permanent => {
                self.fail(automation, run, &node.id, node.node_type().as_str(), err)
                    .await
            }
        }
    }

    async fn fail(
        &self,
        automation: &Automation,
        mut run: ContactAutomation,
        node_id: &str,
        node_type: &str,
        err: Error,
    ) -> Result<ContactAutomation> {
        warn!(node_id = %node_id, error = %err, "Run failed");
        self.storage
            .save_node_execution(&NodeExecution::new(
                &run.id,
                node_id,
                node_type,
                NodeAction::Failed,
            ))
            .await?;
        metrics::record_node_execution(node_type, "failed");
        run.last_error = Some(err.to_string());
        self.finish(automation, run, ExitReason::Failed).await
    }

    /// Move a run into its terminal state and publish the outcome.
    async fn finish(
        &self,
        automation: &Automation,
        mut run: ContactAutomation,
        reason: ExitReason,
    ) -> Result<ContactAutomation> {
        run.status = reason.status();
        run.exit_reason = Some(reason);
        run.scheduled_at = None;
        run.updated_at = Utc::now();

        if !self.storage.save_run(&run, &self.worker_id).await? {
            return self.reload_after_conflict(run).await;
        }

        self.storage
            .save_timeline_event(&TimelineEvent::automation_end(&run, reason))
            .await?;
        self.storage
            .increment_stat(&automation.id, reason.counter())
            .await?;
        metrics::record_run_finished(&reason.to_string());

        info!(run_id = %run.id, exit_reason = %reason, "Run finished");
        Ok(run)
    }

    /// Push this engine's lease on `run_id` one lease period past now.
    ///
    /// `false` means the lease lapsed or was taken over and the run must not
    /// be touched.
    pub async fn renew_lease(&self, run_id: &str) -> Result<bool> {
        let now = Utc::now();
        self.storage
            .renew_lease(run_id, &self.worker_id, now, now + self.lease)
            .await
    }

    /// Save a suspended run and release the lease.
    async fn persist(&self, mut run: ContactAutomation) -> Result<ContactAutomation> {
        run.updated_at = Utc::now();
        if !self.storage.save_run(&run, &self.worker_id).await? {
            return self.reload_after_conflict(run).await;
        }
        Ok(run)
    }

    /// Someone else changed the row (delete cascade, lost lease). Their
    /// version wins.
    async fn reload_after_conflict(&self, run: ContactAutomation) -> Result<ContactAutomation> {
        debug!(run_id = %run.id, "Run changed concurrently; discarding local progress");
        Ok(self.storage.get_run(&run.id).await?.unwrap_or(run))
    }

    async fn record(&self, run: &ContactAutomation, node: &Node, action: NodeAction) -> Result<()> {
        let node_type = node.node_type().as_str();
        self.storage
            .save_node_execution(&NodeExecution::new(&run.id, &node.id, node_type, action))
            .await?;
        metrics::record_node_execution(node_type, &action.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::automation::{parse_automation, AutomationStatus};
    use crate::conditions::ConditionEvaluator;
    use crate::services::testing::{FailingSender, RecordingSender};
    use crate::services::MessageSender;
    use crate::storage::{RunStatus, AUTOMATION_END, AUTOMATION_START};
    use serde_json::json;

    struct Harness {
        engine: Engine,
        storage: SqliteStorage,
        sender: Arc<RecordingSender>,
    }

    fn harness_with(sender: Option<Arc<dyn MessageSender>>, config: Config) -> Harness {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let recording = Arc::new(RecordingSender::default());
        let services = Services {
            sender: sender.unwrap_or_else(|| recording.clone() as Arc<dyn MessageSender>),
            lists: Arc::new(storage.clone()),
            evaluator: ConditionEvaluator::default(),
            send_timeout: StdDuration::from_secs(5),
        };
        Harness {
            engine: Engine::new(storage.clone(), services, &config),
            storage,
            sender: recording,
        }
    }

    fn harness() -> Harness {
        harness_with(None, Config::default())
    }

    async fn live(storage: &SqliteStorage, yaml: &str) -> Automation {
        let mut automation = Automation::from_definition("ws-1", parse_automation(yaml).unwrap());
        automation.status = AutomationStatus::Live;
        storage.save_automation(&automation).await.unwrap();
        automation
    }

    /// Claim every active run as if the clock were `ahead` in the future.
    async fn claim_ahead(h: &Harness, ahead: Duration) -> Vec<ContactAutomation> {
        let now = Utc::now() + ahead;
        h.storage
            .claim_due_runs(now, h.engine.worker_id(), now + h.engine.lease(), 100)
            .await
            .unwrap()
    }

    const WELCOME: &str = r#"
name: welcome
trigger:
  event_kind: list.subscribed
root_node_id: start
nodes:
  - id: start
    type: trigger
    next_node_id: send
  - id: send
    type: email
    config:
      template_id: T
"#;

    #[tokio::test]
    async fn test_enroll_walks_to_completion() {
        let h = harness();
        let automation = live(&h.storage, WELCOME).await;

        let run = h
            .engine
            .enroll(&automation, "a@x.com", json!({"email": "a@x.com"}))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.exit_reason, Some(ExitReason::Completed));
        assert_eq!(h.sender.sent().len(), 1);
        assert_eq!(h.sender.sent()[0].template_id, "T");

        let stored = h.storage.get_automation(&automation.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.enrolled, 1);
        assert_eq!(stored.stats.completed, 1);

        let trail = h.storage.get_node_executions(&run.id).await.unwrap();
        let steps: Vec<_> = trail.iter().map(|n| (n.node_id.as_str(), n.action)).collect();
        assert_eq!(
            steps,
            vec![("start", NodeAction::Advanced), ("send", NodeAction::Completed)]
        );

        let events = h
            .storage
            .list_timeline_events("ws-1", Some("a@x.com"), None, None)
            .await
            .unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec![AUTOMATION_START, AUTOMATION_END]);
        assert_eq!(events[0].changes["root_node_id"], "start");
        assert_eq!(events[1].changes["exit_reason"], "completed");
    }

    #[tokio::test]
    async fn test_delay_suspends_eagerly() {
        let h = harness();
        let automation = live(
            &h.storage,
            r#"
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
    config: { duration: 5, unit: minutes }
    next_node_id: send
  - id: send
    type: email
    config: { template_id: T }
"#,
        )
        .await;

        let run = h.engine.enroll(&automation, "a@x.com", json!({})).await.unwrap();

        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.current_node_id.as_deref(), Some("send"));
        let scheduled = run.scheduled_at.unwrap();
        assert!(scheduled >= run.entered_at + Duration::minutes(4));
        assert!(scheduled <= run.entered_at + Duration::minutes(6));
        assert!(h.sender.sent().is_empty());

        let stored = h.storage.get_run(&run.id).await.unwrap().unwrap();
        let drift = stored.scheduled_at.unwrap() - scheduled;
        assert!(drift.num_milliseconds().abs() < 1);

        // Once the delay has elapsed the run finishes the graph.
        let due = claim_ahead(&h, Duration::minutes(6)).await;
        assert_eq!(due.len(), 1);
        let done = h.engine.walk(&automation, due.into_iter().next().unwrap()).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(h.sender.sent().len(), 1);
    }

    const FILTER: &str = r#"
name: fr-only
trigger:
  event_kind: contact.updated
root_node_id: start
nodes:
  - id: start
    type: trigger
    next_node_id: only-fr
  - id: only-fr
    type: filter
    config:
      conditions: { operator: equals, field: country, value: FR }
      continue_node_id: fr
      exit_node_id: other
  - id: fr
    type: email
    config: { template_id: tpl-fr }
  - id: other
    type: email
    config: { template_id: tpl-other }
"#;

    #[tokio::test]
    async fn test_filter_routes_by_country() {
        let h = harness();
        let automation = live(&h.storage, FILTER).await;

        h.engine
            .enroll(&automation, "fr@x.com", json!({"changes": {"country": "FR"}}))
            .await
            .unwrap();
        h.engine
            .enroll(&automation, "de@x.com", json!({"changes": {"country": "DE"}}))
            .await
            .unwrap();

        let sent: Vec<_> = h
            .sender
            .sent()
            .into_iter()
            .map(|m| (m.contact_email, m.template_id))
            .collect();
        assert_eq!(
            sent,
            vec![
                ("fr@x.com".to_string(), "tpl-fr".to_string()),
                ("de@x.com".to_string(), "tpl-other".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_without_exit_path_exits_run() {
        let h = harness();
        let yaml = FILTER.replace("      exit_node_id: other\n", "");
        let automation = live(&h.storage, &yaml).await;

        let run = h
            .engine
            .enroll(&automation, "de@x.com", json!({"changes": {"country": "DE"}}))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Exited);
        assert_eq!(run.exit_reason, Some(ExitReason::FilteredOut));
        let stored = h.storage.get_automation(&automation.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.exited, 1);
        let ends = h
            .storage
            .list_timeline_events("ws-1", None, Some(AUTOMATION_END), None)
            .await
            .unwrap();
        assert_eq!(ends[0].changes["exit_reason"], "filtered_out");
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_fails() {
        let h = harness_with(
            Some(Arc::new(FailingSender { transient: true })),
            Config::default(),
        );
        let automation = live(&h.storage, WELCOME).await;

        let run = h.engine.enroll(&automation, "a@x.com", json!({})).await.unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.retry_count, 1);
        assert_eq!(run.current_node_id.as_deref(), Some("send"));
        assert!(run.last_error.as_deref().unwrap().contains("provider unavailable"));
        let wait = run.scheduled_at.unwrap() - run.updated_at;
        assert!(wait >= Duration::seconds(59) && wait <= Duration::seconds(61));

        // Second attempt.
        let due = claim_ahead(&h, Duration::hours(2)).await;
        let run = h.engine.walk(&automation, due.into_iter().next().unwrap()).await.unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.retry_count, 2);

        // Third attempt exhausts the default budget of 3.
        let due = claim_ahead(&h, Duration::hours(4)).await;
        let run = h.engine.walk(&automation, due.into_iter().next().unwrap()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_reason, Some(ExitReason::Failed));

        let stored = h.storage.get_automation(&automation.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.failed, 1);
        let ends = h
            .storage
            .list_timeline_events("ws-1", None, Some(AUTOMATION_END), None)
            .await
            .unwrap();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].changes["exit_reason"], "failed");
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness_with(
            Some(Arc::new(FailingSender { transient: false })),
            Config::default(),
        );
        let automation = live(&h.storage, WELCOME).await;

        let run = h.engine.enroll(&automation, "a@x.com", json!({})).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.retry_count, 0);

        let trail = h.storage.get_node_executions(&run.id).await.unwrap();
        assert_eq!(trail.last().unwrap().action, NodeAction::Failed);
    }

    #[tokio::test]
    async fn test_missing_list_fails_run() {
        let h = harness();
        let automation = live(
            &h.storage,
            r#"
name: subscribe
trigger:
  event_kind: custom_event
  custom_event_name: signup
root_node_id: start
nodes:
  - id: start
    type: trigger
    next_node_id: add
  - id: add
    type: add_to_list
    config: { list_id: deleted-list }
"#,
        )
        .await;

        let run = h.engine.enroll(&automation, "a@x.com", json!({})).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.last_error.unwrap().contains("List not found"));
    }

    #[tokio::test]
    async fn test_hop_cap_yields_to_scheduler() {
        let mut config = Config::default();
        config.engine.max_hops_per_walk = 2;
        let h = harness_with(None, config);
        h.storage.create_list("ws-1", "news", "News").await.unwrap();
        let automation = live(
            &h.storage,
            r#"
name: chain
trigger:
  event_kind: list.subscribed
root_node_id: start
nodes:
  - id: start
    type: trigger
    next_node_id: add
  - id: add
    type: add_to_list
    config: { list_id: news }
    next_node_id: send
  - id: send
    type: email
    config: { template_id: T }
"#,
        )
        .await;

        let run = h.engine.enroll(&automation, "a@x.com", json!({})).await.unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.current_node_id.as_deref(), Some("send"));
        assert!(run.scheduled_at.unwrap() <= Utc::now());

        let due = claim_ahead(&h, Duration::zero()).await;
        let run = h.engine.walk(&automation, due.into_iter().next().unwrap()).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_walk_stops_once_lease_is_taken_over() {
        let h = harness();
        let automation = live(&h.storage, WELCOME).await;
        let run = ContactAutomation::new(&automation.id, "ws-1", "a@x.com", "start", json!({}), 3);
        h.storage
            .insert_run(&run, Some(("other-worker", Utc::now() + Duration::minutes(1))))
            .await
            .unwrap();

        let result = h.engine.walk(&automation, run.clone()).await.unwrap();
        assert!(h.sender.sent().is_empty());
        assert_eq!(result.status, RunStatus::Active);
        assert_eq!(result.current_node_id.as_deref(), Some("start"));
        assert!(!h.engine.renew_lease(&run.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_walk_after_delete_keeps_deleted_state() {
        let h = harness();
        let automation = live(&h.storage, WELCOME).await;
        let run = ContactAutomation::new(&automation.id, "ws-1", "a@x.com", "start", json!({}), 3);
        h.storage
            .insert_run(&run, Some((h.engine.worker_id(), Utc::now() + Duration::minutes(1))))
            .await
            .unwrap();

        // Delete lands while the walk is in flight.
        h.storage
            .exit_active_runs(&automation.id, ExitReason::AutomationDeleted)
            .await
            .unwrap();

        let result = h.engine.walk(&automation, run).await.unwrap();
        assert_eq!(result.status, RunStatus::Exited);
        assert_eq!(result.exit_reason, Some(ExitReason::AutomationDeleted));
        let stored = h.storage.get_automation(&automation.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.completed, 0);
    }
}
