//! Storage abstraction.
//!
//! [`Database`] covers every persisted record of the substrate; [`LockManager`]
//! provides named cluster-wide locks. Both have a Postgres implementation and
//! an in-memory one with the same semantics.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::automation::model::{Automation, AutomationRun, NewAutomation, NewAutomationRun};
use crate::compliance::{ComplianceCheck, ComplianceTemplate};
use crate::error::DatabaseError;
use crate::modules::config::{ModuleConfig, ModuleUpdate};
use crate::monitor::event::{
    EventOutcome, EventStatus, NewAttempt, NewEvent, WebhookEvent, WebhookEventAttempt,
};
use crate::scheduler::task::{NewScheduledTask, NewTaskRun, ScheduledTask, ScheduledTaskRun};

/// Database abstraction layer.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Scheduled tasks ---

    async fn create_task(&self, task: &NewScheduledTask) -> Result<ScheduledTask, DatabaseError>;

    async fn get_task(&self, id: i64) -> Result<Option<ScheduledTask>, DatabaseError>;

    async fn list_active_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    async fn set_task_active(&self, id: i64, active: bool) -> Result<bool, DatabaseError>;

    async fn update_task_cron(&self, id: i64, cron: &str) -> Result<bool, DatabaseError>;

    /// Deletes the task and its run history.
    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError>;

    /// Insert the run and mirror its outcome onto the task in one step.
    async fn record_task_run(&self, run: &NewTaskRun) -> Result<ScheduledTaskRun, DatabaseError>;

    async fn list_task_runs(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRun>, DatabaseError>;

    // --- Automations ---

    async fn create_automation(
        &self,
        automation: &NewAutomation,
        now: DateTime<Utc>,
    ) -> Result<Automation, DatabaseError>;

    async fn get_automation(&self, id: i64) -> Result<Option<Automation>, DatabaseError>;

    /// Active scheduled automations with `next_run_at <= now`, oldest first.
    async fn list_due_automations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Automation>, DatabaseError>;

    async fn list_scheduled_automations(&self) -> Result<Vec<Automation>, DatabaseError>;

    async fn list_event_automations(&self, event_name: &str)
        -> Result<Vec<Automation>, DatabaseError>;

    /// Set `last_run_at` and clear `last_error`.
    async fn mark_automation_started(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_automation_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    async fn set_automation_last_error(
        &self,
        id: i64,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn record_automation_run(
        &self,
        run: &NewAutomationRun,
    ) -> Result<AutomationRun, DatabaseError>;

    async fn list_automation_runs(
        &self,
        automation_id: i64,
        limit: usize,
    ) -> Result<Vec<AutomationRun>, DatabaseError>;

    // --- Webhook events ---

    async fn insert_event(
        &self,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, DatabaseError>;

    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, DatabaseError>;

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, DatabaseError>;

    /// Move due monitor-delivered events to `in_progress`, skipping rows held
    /// by other workers.
    async fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, DatabaseError>;

    /// Claim one `pending` event regardless of delivery mode or due time.
    async fn claim_event(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError>;

    async fn insert_attempt(
        &self,
        attempt: &NewAttempt,
        now: DateTime<Utc>,
    ) -> Result<WebhookEventAttempt, DatabaseError>;

    async fn list_attempts(&self, event_id: i64) -> Result<Vec<WebhookEventAttempt>, DatabaseError>;

    /// Apply an outcome if the event is still `in_progress` at
    /// `attempt_number`. Returns `None` when the guard does not hold.
    async fn finish_event(
        &self,
        id: i64,
        attempt_number: i32,
        outcome: &EventOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError>;

    /// `failed`/`succeeded` back to `pending`, extending an exhausted budget
    /// by one attempt. Returns `None` when the status guard does not hold.
    async fn requeue_event(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError>;

    /// Delete unless `in_progress`.
    async fn delete_event(&self, id: i64) -> Result<bool, DatabaseError>;

    async fn purge_events(
        &self,
        status: EventStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Return abandoned claims to `pending`.
    async fn reap_stuck_events(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // --- Modules ---

    async fn get_module(&self, slug: &str) -> Result<Option<ModuleConfig>, DatabaseError>;

    async fn list_modules(&self) -> Result<Vec<ModuleConfig>, DatabaseError>;

    /// Create or partially update a module row.
    async fn upsert_module(
        &self,
        slug: &str,
        update: &ModuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<ModuleConfig, DatabaseError>;

    // --- Compliance ---

    async fn insert_missing_compliance_checks(
        &self,
        company_id: i64,
        checks: &[ComplianceTemplate],
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    async fn list_compliance_checks(
        &self,
        company_id: i64,
    ) -> Result<Vec<ComplianceCheck>, DatabaseError>;
}

/// Named cluster-wide mutual exclusion.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take `name`, waiting at most `timeout`. `None` when another
    /// holder keeps it.
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, DatabaseError>;
}

/// Backend-specific release of a held lock.
#[async_trait]
pub trait LockRelease: Send {
    async fn release(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// A held lock. Call [`LockGuard::release`]; dropping the guard releases in
/// the background.
pub struct LockGuard {
    name: String,
    inner: Option<Box<dyn LockRelease>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, inner: Box<dyn LockRelease>) -> Self {
        Self {
            name: name.into(),
            inner: Some(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> Result<(), DatabaseError> {
        match self.inner.take() {
            Some(inner) => inner.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.release().await {
                        tracing::warn!(lock = %name, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => tracing::warn!(lock = %name, "Lock dropped outside a runtime"),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

pub fn task_lock_name(task_id: i64) -> String {
    format!("scheduled_task_{task_id}")
}

pub fn automation_lock_name(automation_id: i64) -> String {
    format!("automation_exec_{automation_id}")
}
