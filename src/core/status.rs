//! Status store: per-job status rows, the append-only timeline, the
//! per-owner document index, idempotent completion counters, and the
//! memory compare-and-swap.
//!
//! Backed by SQLite through a single connection behind a mutex; every
//! public operation is one transaction.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::memory::JobMemory;
use crate::core::message::{EventDetails, Phase, StatusEvent};

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub owner_id: String,
    pub job_id: String,
    pub title: String,
    pub audience: String,
    pub stage: String,
    pub message: String,
    pub artifact: Option<String>,
    pub cycles_requested: u32,
    pub cycles_completed: u32,
    pub has_error: bool,
    pub last_error: Option<String>,
    pub cancelled: bool,
    pub created_ts: f64,
    pub updated_ts: f64,
    pub schema_version: i64,
}

/// One persisted timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub job_id: String,
    pub stage: String,
    pub phase: Phase,
    pub ts: f64,
    pub cycle: Option<u32>,
    pub artifact: Option<String>,
    pub message: Option<String>,
    pub details: EventDetails,
}

pub struct StatusStore {
    conn: Arc<Mutex<Connection>>,
}

const JOB_COLUMNS: &str = "owner_id, job_id, title, audience, stage, message, artifact, \
     cycles_requested, cycles_completed, has_error, last_error, cancelled, \
     created_ts, updated_ts, schema_version";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        owner_id: row.get(0)?,
        job_id: row.get(1)?,
        title: row.get(2)?,
        audience: row.get(3)?,
        stage: row.get(4)?,
        message: row.get(5)?,
        artifact: row.get(6)?,
        cycles_requested: row.get::<_, i64>(7)? as u32,
        cycles_completed: row.get::<_, i64>(8)? as u32,
        has_error: row.get::<_, i64>(9)? != 0,
        last_error: row.get(10)?,
        cancelled: row.get::<_, i64>(11)? != 0,
        created_ts: row.get(12)?,
        updated_ts: row.get(13)?,
        schema_version: row.get(14)?,
    })
}

impl StatusStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening status db at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        for table in ["jobs", "documents"] {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        owner_id TEXT NOT NULL,
                        job_id TEXT NOT NULL,
                        title TEXT NOT NULL DEFAULT '',
                        audience TEXT NOT NULL DEFAULT '',
                        stage TEXT NOT NULL DEFAULT 'ENQUEUED',
                        message TEXT NOT NULL DEFAULT '',
                        artifact TEXT,
                        cycles_requested INTEGER NOT NULL DEFAULT 1,
                        cycles_completed INTEGER NOT NULL DEFAULT 0,
                        has_error INTEGER NOT NULL DEFAULT 0,
                        last_error TEXT,
                        cancelled INTEGER NOT NULL DEFAULT 0,
                        created_ts REAL NOT NULL,
                        updated_ts REAL NOT NULL,
                        schema_version INTEGER NOT NULL,
                        PRIMARY KEY (owner_id, job_id)
                    )"
                ),
                [],
            )?;
        }
        conn.execute(
            "CREATE TABLE IF NOT EXISTS timeline (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                phase TEXT NOT NULL,
                ts REAL NOT NULL,
                cycle INTEGER,
                artifact TEXT,
                message TEXT,
                details TEXT,
                UNIQUE (job_id, stage, phase, ts)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS completions (
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (job_id, kind, name)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS job_memory (
                job_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS stage_inputs (
                job_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_ts REAL NOT NULL,
                PRIMARY KEY (job_id, stage)
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the job row and index row at admission time.
    pub async fn admit(
        &self,
        owner_id: &str,
        job_id: &str,
        title: &str,
        audience: &str,
        cycles: u32,
        ts: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        for table in ["jobs", "documents"] {
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {table}
                     (owner_id, job_id, title, audience, stage, message,
                      cycles_requested, cycles_completed, created_ts, updated_ts, schema_version)
                     VALUES (?1, ?2, ?3, ?4, 'ENQUEUED', 'Job submitted', ?5, 0, ?6, ?6, ?7)"
                ),
                params![owner_id, job_id, title, audience, cycles as i64, ts, SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    /// Persist one status event: append to the timeline (idempotent on
    /// `(job_id, stage, phase, ts)`), refresh the job row and the document
    /// index row, and trim the timeline to `cap` entries.
    pub async fn record(&self, event: &StatusEvent, cap: usize) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let details = serde_json::to_string(&event.details)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO timeline
             (job_id, owner_id, stage, phase, ts, cycle, artifact, message, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.job_id,
                event.owner_id,
                event.stage,
                event.phase.as_str(),
                event.ts,
                event.cycle.map(|c| c as i64),
                event.artifact,
                event.message,
                details,
            ],
        )?;
        if inserted == 0 {
            // Replayed event; the snapshot was already updated.
            tx.commit()?;
            return Ok(());
        }

        let failed = event.phase == Phase::Failed;
        let succeeded = event.phase == Phase::Done;
        for table in ["jobs", "documents"] {
            tx.execute(
                &format!(
                    "INSERT INTO {table}
                     (owner_id, job_id, stage, message, artifact, created_ts, updated_ts, schema_version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
                     ON CONFLICT(owner_id, job_id) DO UPDATE SET
                        stage = excluded.stage,
                        message = excluded.message,
                        artifact = COALESCE(excluded.artifact, {table}.artifact),
                        updated_ts = excluded.updated_ts
                     WHERE excluded.updated_ts >= {table}.updated_ts"
                ),
                params![
                    event.owner_id,
                    event.job_id,
                    event.stage,
                    event.message.clone().unwrap_or_default(),
                    event.artifact,
                    event.ts,
                    SCHEMA_VERSION,
                ],
            )?;
            if failed {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET has_error = 1, last_error = ?3
                         WHERE owner_id = ?1 AND job_id = ?2"
                    ),
                    params![event.owner_id, event.job_id, event.message],
                )?;
            } else if succeeded {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET has_error = 0
                         WHERE owner_id = ?1 AND job_id = ?2"
                    ),
                    params![event.owner_id, event.job_id],
                )?;
            }
            if let (Some(req), Some(done)) = (
                event.details.cycles_requested,
                event.details.cycles_completed,
            ) {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET cycles_requested = ?3, cycles_completed = ?4
                         WHERE owner_id = ?1 AND job_id = ?2"
                    ),
                    params![event.owner_id, event.job_id, req as i64, done as i64],
                )?;
            }
        }

        tx.execute(
            "DELETE FROM timeline WHERE job_id = ?1 AND id NOT IN (
                SELECT id FROM timeline WHERE job_id = ?1 ORDER BY ts DESC, id DESC LIMIT ?2
            )",
            params![event.job_id, cap as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn job(&self, owner_id: &str, job_id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = ?1 AND job_id = ?2"),
                params![owner_id, job_id],
                row_to_job,
            )
            .optional()?;
        Ok(record)
    }

    /// Owner of a job, regardless of caller. Used for authorization checks.
    pub async fn owner_of(&self, job_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let owner = conn
            .query_row(
                "SELECT owner_id FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    pub async fn timeline(&self, owner_id: &str, job_id: &str) -> Result<Vec<TimelineEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT job_id, stage, phase, ts, cycle, artifact, message, details
             FROM timeline WHERE owner_id = ?1 AND job_id = ?2 ORDER BY ts ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![owner_id, job_id], |row| {
            let phase: String = row.get(2)?;
            let details: Option<String> = row.get(7)?;
            Ok(TimelineEvent {
                job_id: row.get(0)?,
                stage: row.get(1)?,
                phase: match phase.as_str() {
                    "QUEUED" => Phase::Queued,
                    "START" => Phase::Start,
                    "FAILED" => Phase::Failed,
                    _ => Phase::Done,
                },
                ts: row.get(3)?,
                cycle: row.get::<_, Option<i64>>(4)?.map(|c| c as u32),
                artifact: row.get(5)?,
                message: row.get(6)?,
                details: details
                    .and_then(|d| serde_json::from_str(&d).ok())
                    .unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn list_documents(&self, owner_id: &str) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM documents WHERE owner_id = ?1 ORDER BY updated_ts DESC"
        ))?;
        let rows = stmt.query_map(params![owner_id], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Record that a named item of `kind` finished. Returns whether this call
    /// inserted it (false on replay) and the total recorded so far. One
    /// transaction, so concurrent callers observe distinct counts and exactly
    /// one of them sees the final total first.
    pub async fn record_completion(
        &self,
        job_id: &str,
        kind: &str,
        name: &str,
    ) -> Result<(bool, u64)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO completions (job_id, kind, name) VALUES (?1, ?2, ?3)",
            params![job_id, kind, name],
        )?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM completions WHERE job_id = ?1 AND kind = ?2",
            params![job_id, kind],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((inserted > 0, count as u64))
    }

    pub async fn completion_count(&self, job_id: &str, kind: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM completions WHERE job_id = ?1 AND kind = ?2",
            params![job_id, kind],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Current memory snapshot with its version; version 0 when absent.
    pub async fn memory(&self, job_id: &str) -> Result<(i64, JobMemory)> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, data FROM job_memory WHERE job_id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((version, data)) => Ok((version, serde_json::from_str(&data)?)),
            None => Ok((0, JobMemory::default())),
        }
    }

    /// Compare-and-swap the memory snapshot. Returns false on version
    /// conflict; the caller reloads, re-merges, and retries.
    pub async fn swap_memory(
        &self,
        owner_id: &str,
        job_id: &str,
        expected_version: i64,
        memory: &JobMemory,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let data = serde_json::to_string(memory)?;
        if expected_version == 0 {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO job_memory (job_id, owner_id, version, data)
                 VALUES (?1, ?2, 1, ?3)",
                params![job_id, owner_id, data],
            )?;
            return Ok(inserted > 0);
        }
        let updated = conn.execute(
            "UPDATE job_memory SET version = version + 1, data = ?3
             WHERE job_id = ?1 AND version = ?2",
            params![job_id, expected_version, data],
        )?;
        Ok(updated > 0)
    }

    pub async fn set_cancelled(&self, owner_id: &str, job_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut changed = 0;
        for table in ["jobs", "documents"] {
            changed = conn.execute(
                &format!("UPDATE {table} SET cancelled = 1 WHERE owner_id = ?1 AND job_id = ?2"),
                params![owner_id, job_id],
            )?;
        }
        Ok(changed > 0)
    }

    pub async fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let cancelled: Option<i64> = conn
            .query_row(
                "SELECT cancelled FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cancelled.unwrap_or(0) != 0)
    }

    /// Remember a stage's input payload so a failed stage can be re-enqueued.
    pub async fn save_stage_input(&self, job_id: &str, stage: &str, payload: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO stage_inputs (job_id, stage, payload, updated_ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id, stage) DO UPDATE SET payload = excluded.payload,
                updated_ts = excluded.updated_ts",
            params![job_id, stage, payload, crate::core::message::unix_now()],
        )?;
        Ok(())
    }

    pub async fn stage_input(&self, job_id: &str, stage: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let payload = conn
            .query_row(
                "SELECT payload FROM stage_inputs WHERE job_id = ?1 AND stage = ?2",
                params![job_id, stage],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    /// Event name of the most recent FAILED timeline entry, if any.
    pub async fn latest_failed_stage(
        &self,
        owner_id: &str,
        job_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let stage = conn
            .query_row(
                "SELECT stage FROM timeline
                 WHERE owner_id = ?1 AND job_id = ?2 AND phase = 'FAILED'
                 ORDER BY ts DESC, id DESC LIMIT 1",
                params![owner_id, job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Stage, StageMessage};

    fn msg(stage: Stage) -> StageMessage {
        StageMessage::new("j1", "u1", stage)
    }

    async fn admitted_store() -> StatusStore {
        let store = StatusStore::in_memory().unwrap();
        store
            .admit("u1", "j1", "Title", "Audience", 2, 100.0)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn admit_creates_both_rows() {
        let store = admitted_store().await;
        let job = store.job("u1", "j1").await.unwrap().unwrap();
        assert_eq!(job.stage, "ENQUEUED");
        assert_eq!(job.cycles_requested, 2);
        let docs = store.list_documents("u1").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(store.list_documents("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_updates_snapshot_and_timeline() {
        let store = admitted_store().await;
        let event = StatusEvent::done(
            &msg(Stage::Plan),
            EventDetails {
                duration_s: Some(2.0),
                tokens: Some(100),
                model: Some("m".into()),
                ..Default::default()
            },
            Some("jobs/u1/j1/plan.json".into()),
        );
        store.record(&event, 100).await.unwrap();
        let job = store.job("u1", "j1").await.unwrap().unwrap();
        assert_eq!(job.stage, "PLAN_DONE");
        assert_eq!(job.artifact.as_deref(), Some("jobs/u1/j1/plan.json"));
        let timeline = store.timeline("u1", "j1").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].details.tokens, Some(100));
    }

    #[tokio::test]
    async fn replayed_event_is_idempotent() {
        let store = admitted_store().await;
        let event = StatusEvent::done(&msg(Stage::Plan), EventDetails::default(), None);
        store.record(&event, 100).await.unwrap();
        store.record(&event, 100).await.unwrap();
        assert_eq!(store.timeline("u1", "j1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_event_does_not_regress_snapshot() {
        let store = admitted_store().await;
        let mut done = StatusEvent::done(&msg(Stage::Write), EventDetails::default(), None);
        done.ts = 200.0;
        store.record(&done, 100).await.unwrap();
        let mut late = StatusEvent::started(&msg(Stage::Plan));
        late.ts = 150.0;
        store.record(&late, 100).await.unwrap();
        let job = store.job("u1", "j1").await.unwrap().unwrap();
        assert_eq!(job.stage, "WRITE_DONE");
        // but the late event still landed in the timeline, in ts order
        let timeline = store.timeline("u1", "j1").await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].stage, "PLAN_START");
    }

    #[tokio::test]
    async fn failed_event_sets_error_and_done_clears_it() {
        let store = admitted_store().await;
        let failed = StatusEvent::failed(&msg(Stage::Write), "transient", "boom");
        store.record(&failed, 100).await.unwrap();
        let job = store.job("u1", "j1").await.unwrap().unwrap();
        assert!(job.has_error);
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        let mut done = StatusEvent::done(&msg(Stage::Write), EventDetails::default(), None);
        done.ts = failed.ts + 1.0;
        store.record(&done, 100).await.unwrap();
        let job = store.job("u1", "j1").await.unwrap().unwrap();
        assert!(!job.has_error);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cycle_counters_follow_details() {
        let store = admitted_store().await;
        let mut event = StatusEvent::done(&msg(Stage::Rewrite), EventDetails::default(), None);
        event.details.cycles_requested = Some(2);
        event.details.cycles_completed = Some(1);
        store.record(&event, 100).await.unwrap();
        let job = store.job("u1", "j1").await.unwrap().unwrap();
        assert_eq!(job.cycles_completed, 1);
    }

    #[tokio::test]
    async fn timeline_cap_trims_oldest() {
        let store = admitted_store().await;
        for i in 0..10 {
            let mut event = StatusEvent::started(&msg(Stage::Write));
            event.ts = 100.0 + i as f64;
            store.record(&event, 5).await.unwrap();
        }
        let timeline = store.timeline("u1", "j1").await.unwrap();
        assert_eq!(timeline.len(), 5);
        assert_eq!(timeline[0].ts, 105.0);
    }

    #[tokio::test]
    async fn completion_counter_is_idempotent() {
        let store = admitted_store().await;
        let (inserted, count) = store.record_completion("j1", "diagram", "d1").await.unwrap();
        assert!(inserted);
        assert_eq!(count, 1);
        let (inserted, count) = store.record_completion("j1", "diagram", "d1").await.unwrap();
        assert!(!inserted);
        assert_eq!(count, 1);
        let (_, count) = store.record_completion("j1", "diagram", "d2").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.completion_count("j1", "diagram").await.unwrap(), 2);
        assert_eq!(store.completion_count("j1", "draft").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_cas_detects_conflicts() {
        let store = admitted_store().await;
        let (version, mut memory) = store.memory("j1").await.unwrap();
        assert_eq!(version, 0);
        memory.summaries.insert("s1".into(), "- facts".into());
        assert!(store.swap_memory("u1", "j1", 0, &memory).await.unwrap());
        // Stale writer loses.
        assert!(!store.swap_memory("u1", "j1", 0, &memory).await.unwrap());
        let (version, loaded) = store.memory("j1").await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(loaded.summaries["s1"], "- facts");
        assert!(store.swap_memory("u1", "j1", 1, &loaded).await.unwrap());
    }

    #[tokio::test]
    async fn stage_input_roundtrip_and_failed_stage() {
        let store = admitted_store().await;
        store
            .save_stage_input("j1", "write", "{\"x\":1}")
            .await
            .unwrap();
        assert_eq!(
            store.stage_input("j1", "write").await.unwrap().unwrap(),
            "{\"x\":1}"
        );
        assert!(store.stage_input("j1", "plan").await.unwrap().is_none());

        let failed = StatusEvent::failed(&msg(Stage::Write), "durable", "x");
        store.record(&failed, 100).await.unwrap();
        assert_eq!(
            store.latest_failed_stage("u1", "j1").await.unwrap().unwrap(),
            "WRITE_FAILED"
        );
        assert!(store
            .latest_failed_stage("u2", "j1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cancellation_flag() {
        let store = admitted_store().await;
        assert!(!store.is_cancelled("j1").await.unwrap());
        assert!(store.set_cancelled("u1", "j1").await.unwrap());
        assert!(store.is_cancelled("j1").await.unwrap());
        assert!(!store.set_cancelled("u2", "j1").await.unwrap());
    }
}
