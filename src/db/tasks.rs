//! Task queue operations.
//!
//! Claiming is a two-step select-then-conditional-update. The `UPDATE ...
//! WHERE id = ? AND state = 'pending'` is the only concurrency control: when it
//! touches zero rows another worker won the race and the caller gets no task.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::{now, parse_timestamp, timestamp, Database};
use crate::tasks::{Task, TaskKind, TaskState};

const TASK_COLUMNS: &str = "id, kind, payload, state, priority, retry_count, last_error, \
     scheduled_at, created_at, started_at, finished_at, progress_current, progress_total, \
     cancel_requested";

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub kind: Option<TaskKind>,
    pub limit: usize,
}

/// Task counts per state, for gauges and the admin listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
    pub dead: i64,
    pub canceled: i64,
}

impl Database {
    /// Insert a pending task. `priority` defaults to the kind's priority.
    pub fn enqueue(&self, kind: TaskKind, payload: &Value, priority: Option<i64>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO tasks (kind, payload, state, priority, created_at)
            VALUES (?, ?, 'pending', ?, ?)
            "#,
            params![
                kind.as_str(),
                payload.to_string(),
                priority.unwrap_or_else(|| kind.default_priority()),
                now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a pending task unless an identical one is already pending.
    ///
    /// Running duplicates do not block: a running pass may have read its input
    /// before the caller's data landed, so a fresh pending task is still needed.
    pub fn enqueue_unique(
        &self,
        kind: TaskKind,
        payload: &Value,
        priority: Option<i64>,
    ) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let payload_text = payload.to_string();
        conn.execute(
            r#"
            INSERT INTO tasks (kind, payload, state, priority, created_at)
            SELECT ?1, ?2, 'pending', ?3, ?4
            WHERE NOT EXISTS (
                SELECT 1 FROM tasks WHERE kind = ?1 AND payload = ?2 AND state = 'pending'
            )
            "#,
            params![
                kind.as_str(),
                payload_text,
                priority.unwrap_or_else(|| kind.default_priority()),
                now(),
            ],
        )?;

        if conn.changes() == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    /// Claim the lowest (priority, id) task that is pending and due.
    pub fn claim_next_task(&self) -> Result<Option<Task>> {
        self.claim_next_task_at(Utc::now())
    }

    pub fn claim_next_task_at(&self, at: DateTime<Utc>) -> Result<Option<Task>> {
        let now_str = timestamp(at);
        let candidate: Option<i64> = self
            .conn()?
            .query_row(
                r#"
                SELECT id FROM tasks
                WHERE state = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= ?)
                ORDER BY priority ASC, id ASC
                LIMIT 1
                "#,
                [&now_str],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        if !self.try_claim(id, at)? {
            // Lost the race; the caller polls again rather than retrying this id.
            return Ok(None);
        }

        self.get_task(id)
    }

    /// Conditionally move one task from pending to running.
    pub fn try_claim(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE tasks
            SET state = 'running', started_at = ?, finished_at = NULL
            WHERE id = ? AND state = 'pending'
            "#,
            params![timestamp(at), id],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_done(&self, id: i64) -> Result<bool> {
        self.finish(id, TaskState::Done, None)
    }

    pub fn mark_canceled(&self, id: i64) -> Result<bool> {
        self.finish(id, TaskState::Canceled, None)
    }

    pub fn mark_dead(&self, id: i64, error: &str) -> Result<bool> {
        self.finish(id, TaskState::Dead, Some(error))
    }

    fn finish(&self, id: i64, state: TaskState, error: Option<&str>) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE tasks
            SET state = ?, finished_at = ?, last_error = COALESCE(?, last_error)
            WHERE id = ? AND state = 'running'
            "#,
            params![state.as_str(), now(), error, id],
        )?;
        Ok(changed == 1)
    }

    /// Return a running task to pending with a new retry count and due time.
    pub fn mark_retry(
        &self,
        id: i64,
        retry_count: u32,
        error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE tasks
            SET state = 'pending', retry_count = MAX(retry_count, ?), last_error = ?,
                scheduled_at = ?, finished_at = ?
            WHERE id = ? AND state = 'running'
            "#,
            params![retry_count, error, timestamp(scheduled_at), now(), id],
        )?;
        Ok(changed == 1)
    }

    pub fn update_progress(&self, id: i64, current: i64, total: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tasks SET progress_current = ?, progress_total = ? WHERE id = ?",
            params![current, total, id],
        )?;
        Ok(())
    }

    pub fn is_cancel_requested(&self, id: i64) -> Result<bool> {
        let flag: Option<bool> = self
            .conn()?
            .query_row(
                "SELECT cancel_requested FROM tasks WHERE id = ?",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    /// Request cancellation. Pending tasks are canceled immediately; running
    /// tasks get the flag, which only cancellable handlers poll.
    ///
    /// Returns the task's state after the request, or `None` if it does not exist.
    pub fn request_cancel(&self, id: i64) -> Result<Option<TaskState>> {
        {
            let conn = self.conn()?;
            conn.execute(
                r#"
                UPDATE tasks
                SET state = 'canceled', cancel_requested = 1, finished_at = ?
                WHERE id = ? AND state = 'pending'
                "#,
                params![now(), id],
            )?;
            conn.execute(
                "UPDATE tasks SET cancel_requested = 1 WHERE id = ? AND state = 'running'",
                [id],
            )?;
        }
        Ok(self.get_task(id)?.map(|task| task.state))
    }

    /// Move a dead, failed or canceled task back to pending with a clean slate.
    pub fn requeue(&self, id: i64) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE tasks
            SET state = 'pending', retry_count = 0, last_error = NULL,
                started_at = NULL, finished_at = NULL, scheduled_at = ?,
                cancel_requested = 0, progress_current = NULL, progress_total = NULL
            WHERE id = ? AND state IN ('dead', 'failed', 'canceled')
            "#,
            params![now(), id],
        )?;
        Ok(changed == 1)
    }

    /// Return running tasks started before `started_before` to pending.
    pub fn reap_stale_running(&self, started_before: DateTime<Utc>) -> Result<usize> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE tasks
            SET state = 'pending', retry_count = retry_count + 1,
                last_error = 'reclaimed after stale run', scheduled_at = ?
            WHERE state = 'running' AND started_at IS NOT NULL AND started_at < ?
            "#,
            params![now(), timestamp(started_before)],
        )?;
        Ok(changed)
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        let task = self
            .conn()?
            .query_row(&sql, [id], row_to_task)
            .optional()?;
        Ok(task)
    }

    /// Newest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let sql = format!(
            r#"
            SELECT {} FROM tasks
            WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR kind = ?2)
            ORDER BY id DESC
            LIMIT ?3
            "#,
            TASK_COLUMNS
        );
        let limit = if filter.limit == 0 { 100 } else { filter.limit };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(
                params![
                    filter.state.map(|s| s.as_str()),
                    filter.kind.map(|k| k.as_str()),
                    limit as i64
                ],
                row_to_task,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn count_by_state(&self) -> Result<StateCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StateCounts::default();
        for row in rows {
            let (state, count) = row?;
            match state.as_str() {
                "pending" => counts.pending = count,
                "running" => counts.running = count,
                "done" => counts.done = count,
                "failed" => counts.failed = count,
                "dead" => counts.dead = count,
                "canceled" => counts.canceled = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub fn count_tasks(&self, kind: TaskKind, state: TaskState) -> Result<i64> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM tasks WHERE kind = ? AND state = ?",
            params![kind.as_str(), state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let kind: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let state: String = row.get(3)?;

    Ok(Task {
        id: row.get(0)?,
        kind: kind.parse().map_err(|e: crate::error::TaskError| conversion_error(1, e.to_string()))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(2, e.to_string()))?,
        state: state.parse().map_err(|e: anyhow::Error| conversion_error(3, e.to_string()))?,
        priority: row.get(4)?,
        retry_count: row.get(5)?,
        last_error: row.get(6)?,
        scheduled_at: parse_timestamp(row.get(7)?),
        created_at: parse_timestamp(row.get(8)?),
        started_at: parse_timestamp(row.get(9)?),
        finished_at: parse_timestamp(row.get(10)?),
        progress_current: row.get(11)?,
        progress_total: row.get(12)?,
        cancel_requested: row.get(13)?,
    })
}
