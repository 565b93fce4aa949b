//! Fixed-interval scheduler for suspended runs.
//!
//! Each poll claims a batch of due runs under a lease and resumes their walk.
//! The due-set predicate joins on the owning automation, so runs of paused or
//! deleted automations are never claimed and need no mutation to freeze.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::automation::Automation;
use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Rows leased by this poll
    pub claimed: usize,
    /// Runs walked until they suspended or ended
    pub walked: usize,
    /// Runs released because their automation stopped being schedulable
    pub skipped: usize,
    /// Runs whose lease ran out before their turn in the batch
    pub lost: usize,
    /// Runs that failed to load or walk; a later poll retries them
    pub errors: usize,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    poll_interval: Duration,
    batch_size: usize,
    shutdown: ShutdownCoordinator,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            batch_size: config.batch_size.max(1),
            shutdown: ShutdownCoordinator::new(),
            handle: None,
        }
    }

    /// Stop the loop when `shutdown` is requested, e.g. by a signal.
    pub fn with_shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run a single pass over the runs due now.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        poll(&self.engine, self.batch_size, Utc::now()).await
    }

    /// Run a single pass as if the clock read `now`.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        poll(&self.engine, self.batch_size, now).await
    }

    /// Spawn the polling loop.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Scheduler already running");
            return;
        }

        let engine = self.engine.clone();
        let shutdown = self.shutdown.clone();
        let batch_size = self.batch_size;
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => {
                        info!("Scheduler received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        // A full batch means more work is probably due; keep
                        // draining instead of sleeping.
                        loop {
                            match poll(&engine, batch_size, Utc::now()).await {
                                Ok(summary) if summary.claimed >= batch_size => {}
                                Ok(_) => break,
                                Err(e) => {
                                    error!("Scheduler poll failed: {}", e);
                                    break;
                                }
                            }
                            if shutdown.is_shutdown_requested() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            batch_size, "Scheduler started"
        );
    }

    /// Request shutdown and wait for the in-flight poll to finish.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.request_shutdown();

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| Error::Internal(format!("Scheduler task failed: {}", e)))?;
        }

        info!("Scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Start, block until shutdown is requested, then stop.
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        self.start();
        self.shutdown.wait_for_shutdown().await;
        self.stop().await
    }
}

#[instrument(skip(engine), fields(worker_id = %engine.worker_id()))]
async fn poll(engine: &Engine, batch_size: usize, now: DateTime<Utc>) -> Result<PollSummary> {
    let started = Instant::now();
    let storage = engine.storage();

    let claimed = storage
        .claim_due_runs(now, engine.worker_id(), now + engine.lease(), batch_size)
        .await?;
    metrics::record_claimed(claimed.len());

    let mut summary = PollSummary {
        claimed: claimed.len(),
        ..Default::default()
    };
    let mut automations: HashMap<String, Option<Automation>> = HashMap::new();

    for run in claimed {
        if !automations.contains_key(&run.automation_id) {
            match storage.get_automation(&run.automation_id).await {
                Ok(loaded) => {
                    automations.insert(run.automation_id.clone(), loaded);
                }
                Err(e) => {
                    error!(
                        run_id = %run.id,
                        automation_id = %run.automation_id,
                        "Failed to load automation: {}",
                        e
                    );
                    release(engine, &run.id).await;
                    summary.errors += 1;
                    continue;
                }
            }
        }

        // Paused or deleted between the claim and the load.
        let Some(automation) = automations
            .get(&run.automation_id)
            .and_then(|a| a.as_ref())
            .filter(|a| a.is_schedulable())
        else {
            release(engine, &run.id).await;
            summary.skipped += 1;
            continue;
        };

        // Earlier runs of the batch may have outlasted this run's lease.
        match engine.renew_lease(&run.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(run_id = %run.id, "Lease lapsed before the walk; leaving run");
                summary.lost += 1;
                continue;
            }
            Err(e) => {
                error!(run_id = %run.id, "Failed to renew lease: {}", e);
                summary.errors += 1;
                continue;
            }
        }

        let run_id = run.id.clone();
        match engine.walk(automation, run).await {
            Ok(_) => summary.walked += 1,
            Err(e) => {
                error!(run_id = %run_id, automation_id = %automation.id, "Walk failed: {}", e);
                summary.errors += 1;
            }
        }
    }

    metrics::record_poll_duration(started.elapsed());
    if summary.claimed > 0 {
        debug!(
            claimed = summary.claimed,
            walked = summary.walked,
            skipped = summary.skipped,
            lost = summary.lost,
            errors = summary.errors,
            "Scheduler poll complete"
        );
    }
    Ok(summary)
}

/// Hand a claimed run back. Failures only delay the run until its lease lapses.
async fn release(engine: &Engine, run_id: &str) {
    if let Err(e) = engine.storage().release_run(run_id, engine.worker_id()).await {
        warn!(run_id = %run_id, "Failed to release run: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::automation::{parse_automation, AutomationStatus};
    use crate::conditions::ConditionEvaluator;
    use crate::config::Config;
    use crate::nodes::Services;
    use crate::services::testing::{RecordingSender, SlowSender};
    use crate::storage::{
        ContactAutomation, ExitReason, RunStatus, SqliteStorage, TimelineEvent, AUTOMATION_END,
    };
    use crate::triggers::TriggerMatcher;

    struct Harness {
        engine: Arc<Engine>,
        storage: SqliteStorage,
        sender: Arc<RecordingSender>,
        scheduler: Scheduler,
    }

    fn harness() -> Harness {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let sender = Arc::new(RecordingSender::default());
        let services = Services {
            sender: sender.clone(),
            lists: Arc::new(storage.clone()),
            evaluator: ConditionEvaluator::default(),
            send_timeout: StdDuration::from_secs(5),
        };
        let mut config = Config::default();
        config.scheduler.poll_interval_ms = 10;
        let engine = Arc::new(Engine::new(storage.clone(), services, &config));
        let scheduler = Scheduler::new(engine.clone(), &config.scheduler);
        Harness {
            engine,
            storage,
            sender,
            scheduler,
        }
    }

    async fn live(storage: &SqliteStorage, yaml: &str) -> Automation {
        let mut automation = Automation::from_definition("ws-1", parse_automation(yaml).unwrap());
        automation.status = AutomationStatus::Live;
        storage.save_automation(&automation).await.unwrap();
        automation
    }

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
    config:
      duration: 5
      unit: minutes
  - id: send
    type: email
    config:
      template_id: T
"#;

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

    async fn waiting_run(h: &Harness) -> (Automation, ContactAutomation) {
        let automation = live(&h.storage, DRIP).await;
        let run = h
            .engine
            .enroll(&automation, "a@x.com", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(run.current_node_id.as_deref(), Some("send"));
        (automation, run)
    }

    #[tokio::test]
    async fn test_nothing_due_before_delay_elapses() {
        let h = harness();
        waiting_run(&h).await;

        let summary = h.scheduler.poll_once().await.unwrap();
        assert_eq!(summary, PollSummary::default());
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_resumes_run_after_delay() {
        let h = harness();
        let (automation, run) = waiting_run(&h).await;

        let later = Utc::now() + ChronoDuration::minutes(10);
        let summary = h.scheduler.poll_at(later).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.walked, 1);

        let stored = h.storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(h.sender.sent().len(), 1);

        let stats = h.storage.get_automation(&automation.id).await.unwrap().unwrap().stats;
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_pause_removes_runs_from_due_set_and_resume_restores() {
        let h = harness();
        let (automation, run) = waiting_run(&h).await;
        let later = Utc::now() + ChronoDuration::minutes(10);
        let before = h.storage.get_run(&run.id).await.unwrap().unwrap();

        h.storage
            .set_automation_status(&automation.id, AutomationStatus::Paused)
            .await
            .unwrap();
        let summary = h.scheduler.poll_at(later).await.unwrap();
        assert_eq!(summary.claimed, 0);

        let frozen = h.storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(frozen.status, RunStatus::Active);
        assert_eq!(frozen.current_node_id.as_deref(), Some("send"));
        assert_eq!(frozen.scheduled_at, before.scheduled_at);

        h.storage
            .set_automation_status(&automation.id, AutomationStatus::Live)
            .await
            .unwrap();
        let summary = h.scheduler.poll_at(later).await.unwrap();
        assert_eq!(summary.walked, 1);
        let resumed = h.storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_deleted_automation_is_never_scheduled() {
        let h = harness();
        let (automation, _) = waiting_run(&h).await;
        h.storage
            .mark_automation_deleted(&automation.id, Utc::now())
            .await
            .unwrap();

        let later = Utc::now() + ChronoDuration::minutes(10);
        assert_eq!(h.scheduler.poll_at(later).await.unwrap().claimed, 0);
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_trigger_to_completion() {
        let h = harness();
        let automation = live(&h.storage, WELCOME).await;
        let matcher = TriggerMatcher::new(h.engine.clone());

        let event = TimelineEvent::new("ws-1", "a@x.com", "list.subscribed")
            .with_entity("list", "news");
        let runs = matcher.ingest(&event).await.unwrap();
        assert_eq!(runs.len(), 1);

        h.scheduler.poll_once().await.unwrap();

        let run = h.storage.get_run(&runs[0].id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.exit_reason, Some(ExitReason::Completed));

        let stats = h.storage.get_automation(&automation.id).await.unwrap().unwrap().stats;
        assert_eq!(stats.completed, 1);

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_id, "T");

        let ends = h
            .storage
            .list_timeline_events("ws-1", Some("a@x.com"), Some(AUTOMATION_END), None)
            .await
            .unwrap();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].changes["exit_reason"], "completed");
    }

    fn worker(storage: &SqliteStorage, sender: Arc<SlowSender>, worker_id: &str) -> Scheduler {
        let services = Services {
            sender,
            lists: Arc::new(storage.clone()),
            evaluator: ConditionEvaluator::default(),
            send_timeout: StdDuration::from_secs(5),
        };
        let mut config = Config::default();
        config.scheduler.worker_id = worker_id.into();
        config.scheduler.lease_seconds = 1;
        let engine = Arc::new(Engine::new(storage.clone(), services, &config));
        Scheduler::new(engine, &config.scheduler)
    }

    async fn due_at_send(storage: &SqliteStorage, automation: &Automation, email: &str, ago: i64) {
        let mut run = ContactAutomation::new(
            &automation.id,
            &automation.workspace_id,
            email,
            "send",
            serde_json::json!({}),
            3,
        );
        run.scheduled_at = Some(Utc::now() - ChronoDuration::seconds(ago));
        storage.insert_run(&run, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_workers_send_each_email_once() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let sender = Arc::new(SlowSender::new(StdDuration::from_millis(700)));
        let automation = live(&storage, WELCOME).await;
        for (i, email) in ["1@x.com", "2@x.com", "3@x.com"].into_iter().enumerate() {
            due_at_send(&storage, &automation, email, 10 - i as i64).await;
        }

        // A walks its batch slower than the 1 s lease; B polls once the
        // batch lease has lapsed but while A still has runs queued.
        let a = worker(&storage, sender.clone(), "worker-a");
        let b = worker(&storage, sender.clone(), "worker-b");
        let (first, second) = tokio::join!(a.poll_once(), async {
            tokio::time::sleep(StdDuration::from_millis(1100)).await;
            b.poll_once().await
        });
        let (first, second) = (first.unwrap(), second.unwrap());

        let mut sent: Vec<_> = sender.sent().into_iter().map(|m| m.contact_email).collect();
        sent.sort();
        assert_eq!(sent, vec!["1@x.com", "2@x.com", "3@x.com"]);

        assert_eq!(first.claimed, 3);
        assert!(second.claimed >= 1);
        assert_eq!(first.walked + second.walked, 3);
        assert_eq!(first.lost, second.claimed);

        let runs = storage.list_runs(&automation.id, None, None).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
        let stats = storage.get_automation(&automation.id).await.unwrap().unwrap().stats;
        assert_eq!(stats.completed, 3);
    }

    #[tokio::test]
    async fn test_unloadable_automation_does_not_stop_the_batch() {
        let h = harness();
        let broken = live(&h.storage, WELCOME).await;
        let healthy = live(&h.storage, WELCOME).await;
        due_at_send(&h.storage, &broken, "a@x.com", 10).await;
        due_at_send(&h.storage, &healthy, "b@x.com", 5).await;
        h.storage
            .conn
            .lock()
            .await
            .execute(
                "UPDATE automations SET nodes = 'not json' WHERE id = ?1",
                [&broken.id],
            )
            .unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.walked, 1);

        let sent: Vec<_> = h.sender.sent().into_iter().map(|m| m.contact_email).collect();
        assert_eq!(sent, vec!["b@x.com".to_string()]);

        // The failed run is handed back, not left leased.
        let locked_by: Option<String> = h
            .storage
            .conn
            .lock()
            .await
            .query_row(
                "SELECT locked_by FROM contact_automations WHERE automation_id = ?1",
                [&broken.id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(locked_by.is_none());
    }

    #[tokio::test]
    async fn test_loop_starts_and_stops() {
        let mut h = harness();
        assert!(!h.scheduler.is_running());

        h.scheduler.start();
        assert!(h.scheduler.is_running());
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        h.scheduler.stop().await.unwrap();
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_shared_shutdown_ends_run_loop() {
        let h = harness();
        let shutdown = ShutdownCoordinator::new();
        let mut scheduler = Scheduler::new(h.engine.clone(), &Config::default().scheduler)
            .with_shutdown(shutdown.clone());

        let task = tokio::spawn(async move { scheduler.run_until_shutdown().await });
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        shutdown.request_shutdown();

        tokio::time::timeout(StdDuration::from_secs(1), task)
            .await
            .expect("scheduler should stop")
            .unwrap()
            .unwrap();
    }
}
