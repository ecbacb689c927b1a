//! Claim-dispatch-record loop body.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Backoff, HandlerRegistry, Task, TaskKind, TaskState};
use crate::context::AppContext;
use crate::db::Database;
use crate::error::{classify, ErrorClass, TaskError};
use crate::faces::JobControl;

/// How a handler finished when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    /// The handler saw a cancellation request and stopped early.
    Canceled,
}

/// The task a handler is running, with access to its control flags.
pub struct TaskContext {
    pub task: Task,
    db: Arc<Database>,
}

impl TaskContext {
    pub fn new(task: Task, db: Arc<Database>) -> Self {
        Self { task, db }
    }

    pub fn is_cancel_requested(&self) -> Result<bool> {
        self.db.is_cancel_requested(self.task.id)
    }

    pub fn report_progress(&self, current: usize, total: usize) -> Result<()> {
        self.db
            .update_progress(self.task.id, current as i64, total as i64)
    }
}

impl JobControl for TaskContext {
    fn cancel_requested(&self) -> Result<bool> {
        self.is_cancel_requested()
    }

    fn checkpoint(&self, current: usize, total: usize) -> Result<()> {
        self.report_progress(current, total)
    }
}

/// Handler for one task kind.
///
/// Handlers must tolerate running again after a crash mid-task: writes are
/// upserts or replace-all, and outputs that already exist are skipped.
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome>;
}

/// What one `run_once` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub task_id: i64,
    pub kind: TaskKind,
    /// State the task was left in: done, pending (retry), dead or canceled.
    pub state: TaskState,
}

#[derive(Clone)]
pub struct Executor {
    ctx: Arc<AppContext>,
    registry: Arc<HandlerRegistry>,
    backoff: Backoff,
    max_retries: u32,
}

impl Executor {
    pub fn new(ctx: Arc<AppContext>, registry: Arc<HandlerRegistry>) -> Self {
        let backoff = Backoff::from_config(&ctx.config.retry);
        let max_retries = ctx.config.retry.max_task_retries;
        Self {
            ctx,
            registry,
            backoff,
            max_retries,
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Claim one due task, run it, and record the outcome.
    ///
    /// Returns `Ok(None)` when nothing was claimable (including a lost claim
    /// race). Handler failures and panics are recorded on the task, never
    /// returned; only store errors surface as `Err`.
    pub fn run_once(&self) -> Result<Option<RunOutcome>> {
        let Some(task) = self.ctx.db.claim_next_task()? else {
            return Ok(None);
        };

        let task_id = task.id;
        let kind = task.kind;
        let retry_count = task.retry_count;
        debug!(task_id, %kind, retry_count, "Claimed task");

        let started = Instant::now();
        let task_ctx = TaskContext::new(task, self.ctx.db.clone());
        let result = self.dispatch(&task_ctx);
        let elapsed = started.elapsed();

        let state = match result {
            Ok(HandlerOutcome::Done) => {
                self.record(self.ctx.db.mark_done(task_id)?, task_id, TaskState::Done);
                info!(task_id, %kind, elapsed_ms = elapsed.as_millis() as u64, "Task done");
                TaskState::Done
            }
            Ok(HandlerOutcome::Canceled) => {
                self.record(self.ctx.db.mark_canceled(task_id)?, task_id, TaskState::Canceled);
                info!(task_id, %kind, "Task canceled");
                TaskState::Canceled
            }
            Err(err) => self.fail(task_id, kind, retry_count, err)?,
        };

        self.ctx.metrics.record_outcome(kind, state, elapsed);
        Ok(Some(RunOutcome {
            task_id,
            kind,
            state,
        }))
    }

    /// Run until no task is due. Returns how many tasks were processed.
    pub fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once()?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    fn dispatch(&self, task_ctx: &TaskContext) -> Result<HandlerOutcome> {
        let kind = task_ctx.task.kind;
        let handler = self
            .registry
            .get(kind)
            .ok_or_else(|| TaskError::UnknownKind(kind.to_string()))?;

        match catch_unwind(AssertUnwindSafe(|| handler.run(&self.ctx, task_ctx))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("handler panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    fn fail(
        &self,
        task_id: i64,
        kind: TaskKind,
        retry_count: u32,
        err: anyhow::Error,
    ) -> Result<TaskState> {
        let message = format!("{:#}", err);
        let class = classify(&err);

        if class == ErrorClass::Transient && retry_count < self.max_retries {
            let next = retry_count + 1;
            let delay = self.backoff.delay(next, &mut rand::thread_rng());
            let scheduled_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            let applied = self.ctx.db.mark_retry(task_id, next, &message, scheduled_at)?;
            self.record(applied, task_id, TaskState::Pending);
            self.ctx.metrics.record_retry(kind);
            warn!(
                task_id,
                %kind,
                retry = next,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Task failed, retrying"
            );
            Ok(TaskState::Pending)
        } else {
            self.record(self.ctx.db.mark_dead(task_id, &message)?, task_id, TaskState::Dead);
            error!(
                task_id,
                %kind,
                retry_count,
                transient = class == ErrorClass::Transient,
                error = %message,
                "Task dead"
            );
            Ok(TaskState::Dead)
        }
    }

    /// A transition that touched no row means the task left `running` under us.
    fn record(&self, applied: bool, task_id: i64, target: TaskState) {
        if !applied {
            warn!(task_id, state = %target, "Task was no longer running; outcome not recorded");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
