//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::models::*;
use crate::automation::{Automation, AutomationStats, AutomationStatus, ListStatus};
use crate::error::{Error, Result};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

/// Fixed-width UTC timestamps so that text comparison in SQL orders correctly.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json_column<T: DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum_column<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

const AUTOMATION_COLUMNS: &str = "id, workspace_id, name, status, trigger, root_node_id, nodes,
     stats_enrolled, stats_completed, stats_exited, stats_failed,
     created_at, updated_at, deleted_at";

const RUN_COLUMNS: &str = "id, automation_id, workspace_id, contact_email, status,
     current_node_id, scheduled_at, entered_at, retry_count, max_retries,
     context, exit_reason, last_error, updated_at";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                trigger TEXT NOT NULL,
                root_node_id TEXT NOT NULL,
                nodes TEXT NOT NULL,
                stats_enrolled INTEGER NOT NULL DEFAULT 0,
                stats_completed INTEGER NOT NULL DEFAULT 0,
                stats_exited INTEGER NOT NULL DEFAULT 0,
                stats_failed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_automations_trigger
                ON automations(workspace_id, event_kind, status);

            CREATE TABLE IF NOT EXISTS contact_automations (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                status TEXT NOT NULL,
                current_node_id TEXT,
                scheduled_at TEXT,
                entered_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                context TEXT NOT NULL,
                exit_reason TEXT,
                last_error TEXT,
                locked_by TEXT,
                locked_until TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (automation_id) REFERENCES automations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_runs_due
                ON contact_automations(status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_runs_automation
                ON contact_automations(automation_id, status);
            CREATE INDEX IF NOT EXISTS idx_runs_contact
                ON contact_automations(workspace_id, contact_email);

            CREATE TABLE IF NOT EXISTS trigger_logs (
                automation_id TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (automation_id, contact_email),
                FOREIGN KEY (automation_id) REFERENCES automations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                contact_automation_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                action TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (contact_automation_id) REFERENCES contact_automations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_node_executions_run
                ON node_executions(contact_automation_id, created_at);

            CREATE TABLE IF NOT EXISTS timeline_events (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                kind TEXT NOT NULL,
                entity_type TEXT,
                entity_id TEXT,
                changes TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_timeline_contact
                ON timeline_events(workspace_id, contact_email, occurred_at);
            CREATE INDEX IF NOT EXISTS idx_timeline_kind
                ON timeline_events(workspace_id, kind);

            CREATE TABLE IF NOT EXISTS contact_lists (
                workspace_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, id)
            );

            CREATE TABLE IF NOT EXISTS list_memberships (
                workspace_id TEXT NOT NULL,
                list_id TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, list_id, contact_email),
                FOREIGN KEY (workspace_id, list_id)
                    REFERENCES contact_lists(workspace_id, id) ON DELETE CASCADE
            );
            "#,
        )?;
        Ok(())
    }

    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: i64 =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let busy_timeout_ms: i64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;

        let active_runs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM contact_automations WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        let due_runs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM contact_automations
             WHERE status = 'active' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
            [ts(&Utc::now())],
            |row| row.get(0),
        )?;

        Ok(DatabaseHealth {
            foreign_keys_enabled: foreign_keys_enabled == 1,
            integrity_check,
            journal_mode,
            busy_timeout_ms,
            active_runs: active_runs.max(0) as u64,
            due_runs: due_runs.max(0) as u64,
        })
    }

    // ========================================================================
    // Automation operations
    // ========================================================================

    /// Insert or update an automation's definition and status.
    ///
    /// Stats are owned by [`increment_stat`](Self::increment_stat) and are
    /// never overwritten here.
    pub async fn save_automation(&self, automation: &Automation) -> Result<()> {
        let trigger = serde_json::to_string(&automation.trigger)?;
        let nodes = serde_json::to_string(&automation.nodes)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO automations
             (id, workspace_id, name, status, event_kind, trigger, root_node_id, nodes,
              created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                event_kind = excluded.event_kind,
                trigger = excluded.trigger,
                root_node_id = excluded.root_node_id,
                nodes = excluded.nodes,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at",
            params![
                automation.id,
                automation.workspace_id,
                automation.name,
                automation.status.to_string(),
                automation.trigger.event_kind,
                trigger,
                automation.root_node_id,
                nodes,
                ts(&automation.created_at),
                ts(&automation.updated_at),
                automation.deleted_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    pub async fn get_automation(&self, id: &str) -> Result<Option<Automation>> {
        let conn = self.conn.lock().await;
        let automation = conn
            .query_row(
                &format!("SELECT {} FROM automations WHERE id = ?1", AUTOMATION_COLUMNS),
                [id],
                Self::row_to_automation,
            )
            .optional()?;
        Ok(automation)
    }

    /// List automations, newest first. Soft-deleted ones are skipped unless asked for.
    pub async fn list_automations(
        &self,
        workspace_id: Option<&str>,
        include_deleted: bool,
    ) -> Result<Vec<Automation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM automations
             WHERE (?1 IS NULL OR workspace_id = ?1)
               AND (?2 = 1 OR deleted_at IS NULL)
             ORDER BY created_at DESC",
            AUTOMATION_COLUMNS
        ))?;
        let automations = stmt
            .query_map(params![workspace_id, include_deleted], Self::row_to_automation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(automations)
    }

    /// Live, non-deleted automations in a workspace listening for `event_kind`.
    pub async fn list_live_automations_for_event(
        &self,
        workspace_id: &str,
        event_kind: &str,
    ) -> Result<Vec<Automation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM automations
             WHERE workspace_id = ?1 AND event_kind = ?2
               AND status = 'live' AND deleted_at IS NULL
             ORDER BY created_at",
            AUTOMATION_COLUMNS
        ))?;
        let automations = stmt
            .query_map(params![workspace_id, event_kind], Self::row_to_automation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(automations)
    }

    pub async fn set_automation_status(&self, id: &str, status: AutomationStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE automations SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            params![status.to_string(), ts(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Automation not found: {}", id)));
        }
        Ok(())
    }

    /// Soft-delete. Returns `false` if the automation was already deleted.
    pub async fn mark_automation_deleted(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE automations SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![ts(&at), id],
        )?;
        Ok(changed == 1)
    }

    /// Atomic counter increment, safe under concurrent workers.
    pub async fn increment_stat(&self, automation_id: &str, counter: StatCounter) -> Result<()> {
        let conn = self.conn.lock().await;
        let column = counter.column();
        conn.execute(
            &format!(
                "UPDATE automations SET {column} = {column} + 1 WHERE id = ?1",
                column = column
            ),
            [automation_id],
        )?;
        Ok(())
    }

    fn row_to_automation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Automation> {
        let status: String = row.get(3)?;
        let trigger: String = row.get(4)?;
        let nodes: String = row.get(6)?;
        let counter = |idx: usize| -> rusqlite::Result<u64> {
            Ok(row.get::<_, i64>(idx)?.max(0) as u64)
        };

        Ok(Automation {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            name: row.get(2)?,
            status: parse_enum_column(3, &status)?,
            trigger: parse_json_column(4, &trigger)?,
            root_node_id: row.get(5)?,
            nodes: parse_json_column(6, &nodes)?,
            stats: AutomationStats {
                enrolled: counter(7)?,
                completed: counter(8)?,
                exited: counter(9)?,
                failed: counter(10)?,
            },
            created_at: parse_datetime_utc(&row.get::<_, String>(11)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(12)?)?,
            deleted_at: parse_optional_datetime(row.get(13)?)?,
        })
    }

    // ========================================================================
    // Trigger log
    // ========================================================================

    /// Record that a contact was enrolled.
    ///
    /// Returns `true` only for the first call per (automation, contact); the
    /// primary key makes this a single atomic check-and-insert.
    pub async fn record_trigger(&self, automation_id: &str, contact_email: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO trigger_logs (automation_id, contact_email, created_at)
             VALUES (?1, ?2, ?3)",
            params![automation_id, contact_email, ts(&Utc::now())],
        )?;
        Ok(inserted == 1)
    }

    // ========================================================================
    // Run operations
    // ========================================================================

    /// Insert a new run, optionally leased to `owner` until `lease_until`.
    pub async fn insert_run(
        &self,
        run: &ContactAutomation,
        lease: Option<(&str, DateTime<Utc>)>,
    ) -> Result<()> {
        let context = serde_json::to_string(&run.context)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO contact_automations
             (id, automation_id, workspace_id, contact_email, status, current_node_id,
              scheduled_at, entered_at, retry_count, max_retries, context, exit_reason,
              last_error, locked_by, locked_until, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                run.id,
                run.automation_id,
                run.workspace_id,
                run.contact_email,
                run.status.to_string(),
                run.current_node_id,
                run.scheduled_at.as_ref().map(ts),
                ts(&run.entered_at),
                run.retry_count,
                run.max_retries,
                context,
                run.exit_reason.map(|r| r.to_string()),
                run.last_error,
                lease.map(|(owner, _)| owner),
                lease.map(|(_, until)| ts(&until)),
                ts(&run.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Persist a run's progress and release its lease.
    ///
    /// The write only lands if the stored row is still active and still held
    /// by `owner`. Returns `false` when someone else got there first (the run
    /// was exited by a delete, or the lease was lost), in which case the
    /// caller must drop its copy.
    pub async fn save_run(&self, run: &ContactAutomation, owner: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE contact_automations SET
                status = ?1,
                current_node_id = ?2,
                scheduled_at = ?3,
                retry_count = ?4,
                exit_reason = ?5,
                last_error = ?6,
                updated_at = ?7,
                locked_by = NULL,
                locked_until = NULL
             WHERE id = ?8 AND status = 'active' AND locked_by = ?9",
            params![
                run.status.to_string(),
                run.current_node_id,
                run.scheduled_at.as_ref().map(ts),
                run.retry_count,
                run.exit_reason.map(|r| r.to_string()),
                run.last_error,
                ts(&run.updated_at),
                run.id,
                owner,
            ],
        )?;
        Ok(changed == 1)
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<ContactAutomation>> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM contact_automations WHERE id = ?1", RUN_COLUMNS),
                [id],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Runs of one automation, most recent first.
    pub async fn list_runs(
        &self,
        automation_id: &str,
        status: Option<RunStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ContactAutomation>> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contact_automations
             WHERE automation_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY entered_at DESC
             LIMIT ?3",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(
                params![automation_id, status.map(|s| s.to_string()), limit as i64],
                Self::row_to_run,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Every run for a contact in a workspace, oldest first.
    pub async fn list_runs_for_contact(
        &self,
        workspace_id: &str,
        contact_email: &str,
    ) -> Result<Vec<ContactAutomation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contact_automations
             WHERE workspace_id = ?1 AND contact_email = ?2
             ORDER BY entered_at",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![workspace_id, contact_email], Self::row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Claim up to `limit` due runs for `owner`.
    ///
    /// A run is due when it is active, its `scheduled_at` has passed, its
    /// automation is live and not deleted, and nobody holds an unexpired
    /// lease on it. Each row is claimed with a conditional update, so two
    /// workers polling at once never both own the same run.
    pub async fn claim_due_runs(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContactAutomation>> {
        let now_s = ts(&now);
        let until_s = ts(&lease_until);

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT r.id FROM contact_automations r
                 JOIN automations a ON a.id = r.automation_id
                 WHERE r.status = 'active'
                   AND r.scheduled_at IS NOT NULL
                   AND r.scheduled_at <= ?1
                   AND (r.locked_until IS NULL OR r.locked_until <= ?1)
                   AND a.status = 'live'
                   AND a.deleted_at IS NULL
                 ORDER BY r.scheduled_at
                 LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![now_s, limit as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let changed = tx.execute(
                "UPDATE contact_automations SET locked_by = ?1, locked_until = ?2
                 WHERE id = ?3 AND status = 'active'
                   AND (locked_until IS NULL OR locked_until <= ?4)",
                params![owner, until_s, id, now_s],
            )?;
            if changed == 1 {
                let run = tx.query_row(
                    &format!("SELECT {} FROM contact_automations WHERE id = ?1", RUN_COLUMNS),
                    [&id],
                    Self::row_to_run,
                )?;
                claimed.push(run);
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Extend `owner`'s lease on an active run to `lease_until`.
    ///
    /// Only succeeds while the lease is still held and unexpired at `now`.
    /// Returns `false` when it lapsed or another worker has reclaimed the
    /// run; the caller must then leave the run alone.
    pub async fn renew_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE contact_automations SET locked_until = ?1
             WHERE id = ?2 AND status = 'active'
               AND locked_by = ?3 AND locked_until > ?4",
            params![ts(&lease_until), id, owner, ts(&now)],
        )?;
        Ok(changed == 1)
    }

    /// Give up a lease without changing the run.
    pub async fn release_run(&self, id: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE contact_automations SET locked_by = NULL, locked_until = NULL
             WHERE id = ?1 AND locked_by = ?2",
            params![id, owner],
        )?;
        Ok(())
    }

    /// Move every active run of an automation to its terminal state for
    /// `reason`, returning the runs as they now stand.
    pub async fn exit_active_runs(
        &self,
        automation_id: &str,
        reason: ExitReason,
    ) -> Result<Vec<ContactAutomation>> {
        let now_s = ts(&Utc::now());
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM contact_automations
                 WHERE automation_id = ?1 AND status = 'active'",
            )?;
            let ids = stmt
                .query_map([automation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        let mut exited = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE contact_automations SET
                    status = ?1, exit_reason = ?2, scheduled_at = NULL,
                    locked_by = NULL, locked_until = NULL, updated_at = ?3
                 WHERE id = ?4 AND status = 'active'",
                params![reason.status().to_string(), reason.to_string(), now_s, id],
            )?;
            let run = tx.query_row(
                &format!("SELECT {} FROM contact_automations WHERE id = ?1", RUN_COLUMNS),
                [&id],
                Self::row_to_run,
            )?;
            exited.push(run);
        }

        tx.commit()?;
        Ok(exited)
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactAutomation> {
        let status: String = row.get(4)?;
        let context: String = row.get(10)?;
        let exit_reason: Option<String> = row.get(11)?;

        Ok(ContactAutomation {
            id: row.get(0)?,
            automation_id: row.get(1)?,
            workspace_id: row.get(2)?,
            contact_email: row.get(3)?,
            status: parse_enum_column(4, &status)?,
            current_node_id: row.get(5)?,
            scheduled_at: parse_optional_datetime(row.get(6)?)?,
            entered_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            retry_count: row.get(8)?,
            max_retries: row.get(9)?,
            context: parse_json_column(10, &context)?,
            exit_reason: exit_reason
                .as_deref()
                .map(|s| parse_enum_column(11, s))
                .transpose()?,
            last_error: row.get(12)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(13)?)?,
        })
    }

    // ========================================================================
    // Node execution audit trail
    // ========================================================================

    pub async fn save_node_execution(&self, record: &NodeExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO node_executions
             (id, contact_automation_id, node_id, node_type, action, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.contact_automation_id,
                record.node_id,
                record.node_type,
                record.action.to_string(),
                ts(&record.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_node_executions(&self, run_id: &str) -> Result<Vec<NodeExecution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, contact_automation_id, node_id, node_type, action, created_at
             FROM node_executions
             WHERE contact_automation_id = ?1
             ORDER BY created_at, rowid",
        )?;
        let records = stmt
            .query_map([run_id], |row| {
                let action: String = row.get(4)?;
                Ok(NodeExecution {
                    id: row.get(0)?,
                    contact_automation_id: row.get(1)?,
                    node_id: row.get(2)?,
                    node_type: row.get(3)?,
                    action: parse_enum_column(4, &action)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// A run together with its node history.
    pub async fn get_run_trace(&self, run_id: &str) -> Result<Option<RunTrace>> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let nodes = self.get_node_executions(run_id).await?;
        Ok(Some(RunTrace { run, nodes }))
    }

    // ========================================================================
    // Timeline events
    // ========================================================================

    pub async fn save_timeline_event(&self, event: &TimelineEvent) -> Result<()> {
        let changes = serde_json::to_string(&event.changes)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO timeline_events
             (id, workspace_id, contact_email, kind, entity_type, entity_id, changes, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id,
                event.workspace_id,
                event.contact_email,
                event.kind,
                event.entity_type,
                event.entity_id,
                changes,
                ts(&event.occurred_at),
            ],
        )?;
        Ok(())
    }

    /// Timeline of a contact, oldest first, optionally restricted to one kind.
    pub async fn list_timeline_events(
        &self,
        workspace_id: &str,
        contact_email: Option<&str>,
        kind: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<TimelineEvent>> {
        let limit = limit.unwrap_or(MAX_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, contact_email, kind, entity_type, entity_id, changes, occurred_at
             FROM timeline_events
             WHERE workspace_id = ?1
               AND (?2 IS NULL OR contact_email = ?2)
               AND (?3 IS NULL OR kind = ?3)
             ORDER BY occurred_at, rowid
             LIMIT ?4",
        )?;
        let events = stmt
            .query_map(
                params![workspace_id, contact_email, kind, limit as i64],
                |row| {
                    let changes: String = row.get(6)?;
                    Ok(TimelineEvent {
                        id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        contact_email: row.get(2)?,
                        kind: row.get(3)?,
                        entity_type: row.get(4)?,
                        entity_id: row.get(5)?,
                        changes: parse_json_column(6, &changes)?,
                        occurred_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ========================================================================
    // Contact lists
    // ========================================================================

    pub async fn create_list(&self, workspace_id: &str, list_id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO contact_lists (workspace_id, id, name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(workspace_id, id) DO UPDATE SET name = excluded.name",
            params![workspace_id, list_id, name, ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub async fn list_exists(&self, workspace_id: &str, list_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM contact_lists WHERE workspace_id = ?1 AND id = ?2",
                params![workspace_id, list_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Membership status, `Ok(None)` when the contact is not on the list.
    pub async fn get_membership(
        &self,
        workspace_id: &str,
        list_id: &str,
        contact_email: &str,
    ) -> Result<Option<ListStatus>> {
        if !self.list_exists(workspace_id, list_id).await? {
            return Err(Error::Configuration(format!("List not found: {}", list_id)));
        }
        let conn = self.conn.lock().await;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM list_memberships
                 WHERE workspace_id = ?1 AND list_id = ?2 AND contact_email = ?3",
                params![workspace_id, list_id, contact_email],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|s| s.parse().map_err(Error::Storage))
            .transpose()
    }

    /// Upsert a membership. Idempotent for a given status.
    pub async fn set_membership(
        &self,
        workspace_id: &str,
        list_id: &str,
        contact_email: &str,
        status: ListStatus,
    ) -> Result<()> {
        if !self.list_exists(workspace_id, list_id).await? {
            return Err(Error::Configuration(format!("List not found: {}", list_id)));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO list_memberships
             (workspace_id, list_id, contact_email, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(workspace_id, list_id, contact_email) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                workspace_id,
                list_id,
                contact_email,
                status.to_string(),
                ts(&Utc::now())
            ],
        )?;
        Ok(())
    }
}
