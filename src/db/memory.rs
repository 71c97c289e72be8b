//! In-memory [`Database`] and [`LockManager`] for tests and database-less runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use super::{Database, LockGuard, LockManager, LockRelease};
use crate::automation::model::{
    Automation, AutomationKind, AutomationRun, AutomationStatus, NewAutomation, NewAutomationRun,
};
use crate::compliance::{ComplianceCheck, ComplianceTemplate, INITIAL_STATUS};
use crate::error::DatabaseError;
use crate::modules::config::{ModuleConfig, ModuleUpdate};
use crate::monitor::event::{
    DeliveryMode, EventOutcome, EventStatus, NewAttempt, NewEvent, WebhookEvent,
    WebhookEventAttempt,
};
use crate::scheduler::task::{NewScheduledTask, NewTaskRun, ScheduledTask, ScheduledTaskRun};

#[derive(Default)]
struct State {
    next_id: i64,
    tasks: BTreeMap<i64, ScheduledTask>,
    task_runs: Vec<ScheduledTaskRun>,
    automations: BTreeMap<i64, Automation>,
    automation_runs: Vec<AutomationRun>,
    events: BTreeMap<i64, WebhookEvent>,
    attempts: Vec<WebhookEventAttempt>,
    modules: BTreeMap<String, ModuleConfig>,
    compliance: Vec<ComplianceCheck>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn has_attempt(&self, event_id: i64, attempt_number: i32) -> bool {
        self.attempts
            .iter()
            .any(|a| a.event_id == event_id && a.attempt_number == attempt_number)
    }
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    locks: Arc<std::sync::Mutex<HashSet<String>>>,
    offline: AtomicBool,
    run_records_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a pool error, as if the database were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make run-record inserts fail while everything else keeps working.
    pub fn set_run_records_failing(&self, failing: bool) {
        self.run_records_failing.store(failing, Ordering::SeqCst);
    }

    fn check_run_records(&self) -> Result<(), DatabaseError> {
        if self.run_records_failing.load(Ordering::SeqCst) {
            return Err(DatabaseError::Pool("run record insert rejected".to_string()));
        }
        Ok(())
    }

    async fn state(&self) -> Result<MutexGuard<'_, State>, DatabaseError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DatabaseError::Pool("database unavailable".to_string()));
        }
        Ok(self.state.lock().await)
    }

    fn lock_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of locks currently held.
    pub fn held_locks(&self) -> Vec<String> {
        let mut held: Vec<String> = self.lock_set().iter().cloned().collect();
        held.sort();
        held
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn create_task(&self, task: &NewScheduledTask) -> Result<ScheduledTask, DatabaseError> {
        let mut state = self.state().await?;
        let id = state.id();
        let task = ScheduledTask {
            id,
            name: task.name.clone(),
            command: task.command.clone(),
            cron: task.cron.clone(),
            company_id: task.company_id,
            description: task.description.clone(),
            active: task.active,
            max_retries: task.max_retries,
            retry_backoff_seconds: task.retry_backoff_seconds,
            last_run_at: None,
            last_status: None,
            last_error: None,
        };
        state.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Option<ScheduledTask>, DatabaseError> {
        Ok(self.state().await?.tasks.get(&id).cloned())
    }

    async fn list_active_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        Ok(self
            .state()
            .await?
            .tasks
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect())
    }

    async fn set_task_active(&self, id: i64, active: bool) -> Result<bool, DatabaseError> {
        let mut state = self.state().await?;
        Ok(state
            .tasks
            .get_mut(&id)
            .map(|t| t.active = active)
            .is_some())
    }

    async fn update_task_cron(&self, id: i64, cron: &str) -> Result<bool, DatabaseError> {
        let mut state = self.state().await?;
        Ok(state
            .tasks
            .get_mut(&id)
            .map(|t| t.cron = cron.to_string())
            .is_some())
    }

    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut state = self.state().await?;
        let removed = state.tasks.remove(&id).is_some();
        state.task_runs.retain(|r| r.task_id != id);
        Ok(removed)
    }

    async fn record_task_run(&self, run: &NewTaskRun) -> Result<ScheduledTaskRun, DatabaseError> {
        let mut state = self.state().await?;
        if !state.tasks.contains_key(&run.task_id) {
            return Err(DatabaseError::InvalidValue {
                column: "task_id",
                reason: format!("task {} does not exist", run.task_id),
            });
        }

        let id = state.id();
        let record = ScheduledTaskRun {
            id,
            task_id: run.task_id,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms(),
            details: run.details.clone(),
        };
        state.task_runs.push(record.clone());

        if let Some(task) = state.tasks.get_mut(&run.task_id) {
            task.last_run_at = Some(run.started_at);
            task.last_status = Some(run.status);
            task.last_error = run.error().map(str::to_string);
        }
        Ok(record)
    }

    async fn list_task_runs(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRun>, DatabaseError> {
        let state = self.state().await?;
        let mut runs: Vec<_> = state
            .task_runs
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn create_automation(
        &self,
        new: &NewAutomation,
        now: DateTime<Utc>,
    ) -> Result<Automation, DatabaseError> {
        let mut state = self.state().await?;
        let id = state.id();
        let automation = Automation {
            id,
            name: new.name.clone(),
            description: new.description.clone(),
            kind: new.kind,
            cadence: new.cadence,
            cron_expression: new.cron_expression.clone(),
            scheduled_time: new.scheduled_time,
            run_once: new.run_once,
            next_run_at: new.next_run_at,
            last_run_at: None,
            last_error: None,
            trigger_event: new.trigger_event.clone(),
            trigger_filters: new.trigger_filters.clone(),
            action_module: new.action_module.clone(),
            action_payload: new.action_payload.clone(),
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        state.automations.insert(id, automation.clone());
        Ok(automation)
    }

    async fn get_automation(&self, id: i64) -> Result<Option<Automation>, DatabaseError> {
        Ok(self.state().await?.automations.get(&id).cloned())
    }

    async fn list_due_automations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Automation>, DatabaseError> {
        let state = self.state().await?;
        let mut due: Vec<_> = state
            .automations
            .values()
            .filter(|a| a.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_scheduled_automations(&self) -> Result<Vec<Automation>, DatabaseError> {
        Ok(self
            .state()
            .await?
            .automations
            .values()
            .filter(|a| a.status == AutomationStatus::Active && a.kind == AutomationKind::Scheduled)
            .cloned()
            .collect())
    }

    async fn list_event_automations(
        &self,
        event_name: &str,
    ) -> Result<Vec<Automation>, DatabaseError> {
        Ok(self
            .state()
            .await?
            .automations
            .values()
            .filter(|a| {
                a.status == AutomationStatus::Active
                    && a.kind == AutomationKind::Event
                    && a.trigger_event.as_deref() == Some(event_name)
            })
            .cloned()
            .collect())
    }

    async fn mark_automation_started(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state().await?;
        if let Some(a) = state.automations.get_mut(&id) {
            a.last_run_at = Some(at);
            a.last_error = None;
            a.updated_at = at;
        }
        Ok(())
    }

    async fn set_automation_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state().await?;
        if let Some(a) = state.automations.get_mut(&id) {
            a.next_run_at = next_run_at;
        }
        Ok(())
    }

    async fn set_automation_last_error(
        &self,
        id: i64,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state().await?;
        if let Some(a) = state.automations.get_mut(&id) {
            a.last_error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn record_automation_run(
        &self,
        run: &NewAutomationRun,
    ) -> Result<AutomationRun, DatabaseError> {
        self.check_run_records()?;
        let mut state = self.state().await?;
        let id = state.id();
        let record = AutomationRun {
            id,
            automation_id: run.automation_id,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms(),
            result_payload: run.result_payload.clone(),
            error_message: run.error_message.clone(),
        };
        state.automation_runs.push(record.clone());
        Ok(record)
    }

    async fn list_automation_runs(
        &self,
        automation_id: i64,
        limit: usize,
    ) -> Result<Vec<AutomationRun>, DatabaseError> {
        let state = self.state().await?;
        let mut runs: Vec<_> = state
            .automation_runs
            .iter()
            .filter(|r| r.automation_id == automation_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn insert_event(
        &self,
        new: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, DatabaseError> {
        let mut state = self.state().await?;
        let id = state.id();
        let event = WebhookEvent {
            id,
            name: new.name.clone(),
            target_url: new.target_url.clone(),
            headers: new.headers.clone(),
            payload: new.payload.clone(),
            delivery: new.delivery,
            status: EventStatus::Pending,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            backoff_seconds: new.backoff_seconds,
            next_attempt_at: now + new.hold,
            claimed_at: None,
            last_error: None,
            response_status: None,
            response_body: None,
            created_at: now,
            updated_at: now,
        };
        state.events.insert(id, event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, DatabaseError> {
        Ok(self.state().await?.events.get(&id).cloned())
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let state = self.state().await?;
        Ok(state
            .events
            .values()
            .rev()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let mut state = self.state().await?;
        let mut due: Vec<(DateTime<Utc>, i64)> = state
            .events
            .values()
            .filter(|e| {
                e.status == EventStatus::Pending
                    && e.delivery == DeliveryMode::Monitor
                    && e.next_attempt_at <= now
            })
            .map(|e| (e.next_attempt_at, e.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(event) = state.events.get_mut(&id) {
                claim(event, now);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_event(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError> {
        let mut state = self.state().await?;
        Ok(state
            .events
            .get_mut(&id)
            .filter(|e| e.status == EventStatus::Pending)
            .map(|event| {
                claim(event, now);
                event.clone()
            }))
    }

    async fn insert_attempt(
        &self,
        attempt: &NewAttempt,
        now: DateTime<Utc>,
    ) -> Result<WebhookEventAttempt, DatabaseError> {
        let mut state = self.state().await?;
        if !state.events.contains_key(&attempt.event_id) {
            return Err(DatabaseError::InvalidValue {
                column: "event_id",
                reason: format!("event {} does not exist", attempt.event_id),
            });
        }
        let id = state.id();
        let record = WebhookEventAttempt {
            id,
            event_id: attempt.event_id,
            attempt_number: attempt.attempt_number,
            status: attempt.status,
            response_status: attempt.response_status,
            request_headers: attempt.request_headers.clone(),
            request_body: attempt.request_body.clone(),
            response_headers: attempt.response_headers.clone(),
            response_body: attempt.response_body.clone(),
            error_message: attempt.error_message.clone(),
            attempted_at: now,
        };
        state.attempts.push(record.clone());
        Ok(record)
    }

    async fn list_attempts(
        &self,
        event_id: i64,
    ) -> Result<Vec<WebhookEventAttempt>, DatabaseError> {
        let state = self.state().await?;
        let mut attempts: Vec<_> = state
            .attempts
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| (a.attempt_number, a.id));
        Ok(attempts)
    }

    async fn finish_event(
        &self,
        id: i64,
        attempt_number: i32,
        outcome: &EventOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError> {
        let mut state = self.state().await?;
        let Some(event) = state.events.get_mut(&id) else {
            return Ok(None);
        };
        if event.status != EventStatus::InProgress || event.attempt_count != attempt_number {
            return Ok(None);
        }

        event.status = outcome.status;
        if let Some(at) = outcome.next_attempt_at {
            event.next_attempt_at = at;
        }
        event.claimed_at = None;
        event.last_error = outcome.last_error.clone();
        event.response_status = outcome.response_status;
        event.response_body = outcome.response_body.clone();
        event.updated_at = now;
        Ok(Some(event.clone()))
    }

    async fn requeue_event(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError> {
        let mut state = self.state().await?;
        let Some(event) = state.events.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(event.status, EventStatus::Failed | EventStatus::Succeeded) {
            return Ok(None);
        }

        event.status = EventStatus::Pending;
        event.next_attempt_at = now;
        event.claimed_at = None;
        if event.attempt_count >= event.max_attempts {
            event.max_attempts = event.attempt_count + 1;
        }
        event.updated_at = now;
        Ok(Some(event.clone()))
    }

    async fn delete_event(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut state = self.state().await?;
        match state.events.get(&id) {
            Some(e) if e.status != EventStatus::InProgress => {
                state.events.remove(&id);
                state.attempts.retain(|a| a.event_id != id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_events(
        &self,
        status: EventStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.state().await?;
        let doomed: HashSet<i64> = state
            .events
            .values()
            .filter(|e| e.status == status && e.updated_at < updated_before)
            .map(|e| e.id)
            .collect();
        state.events.retain(|id, _| !doomed.contains(id));
        state.attempts.retain(|a| !doomed.contains(&a.event_id));
        Ok(doomed.len() as u64)
    }

    async fn reap_stuck_events(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.state().await?;
        let stuck: Vec<(i64, bool)> = state
            .events
            .values()
            .filter(|e| {
                e.status == EventStatus::InProgress
                    && e.claimed_at.is_some_and(|at| at < claimed_before)
            })
            .map(|e| (e.id, state.has_attempt(e.id, e.attempt_count)))
            .collect();

        for (id, attempted) in &stuck {
            if let Some(event) = state.events.get_mut(id) {
                reap(event, *attempted, now);
            }
        }
        Ok(stuck.len() as u64)
    }

    async fn get_module(&self, slug: &str) -> Result<Option<ModuleConfig>, DatabaseError> {
        Ok(self.state().await?.modules.get(slug).cloned())
    }

    async fn list_modules(&self) -> Result<Vec<ModuleConfig>, DatabaseError> {
        Ok(self.state().await?.modules.values().cloned().collect())
    }

    async fn upsert_module(
        &self,
        slug: &str,
        update: &ModuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<ModuleConfig, DatabaseError> {
        let mut state = self.state().await?;
        let module = state
            .modules
            .entry(slug.to_string())
            .or_insert_with(|| ModuleConfig {
                slug: slug.to_string(),
                name: slug.to_string(),
                enabled: false,
                settings: serde_json::json!({}),
                updated_at: now,
            });
        if let Some(name) = &update.name {
            module.name = name.clone();
        }
        if let Some(enabled) = update.enabled {
            module.enabled = enabled;
        }
        if let Some(settings) = &update.settings {
            module.settings = settings.clone();
        }
        module.updated_at = now;
        Ok(module.clone())
    }

    async fn insert_missing_compliance_checks(
        &self,
        company_id: i64,
        checks: &[ComplianceTemplate],
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.state().await?;
        let mut inserted = 0;
        for template in checks {
            let exists = state
                .compliance
                .iter()
                .any(|c| c.company_id == company_id && c.check_key == template.key);
            if !exists {
                state.compliance.push(ComplianceCheck {
                    company_id,
                    check_key: template.key.to_string(),
                    title: template.title.to_string(),
                    status: INITIAL_STATUS.to_string(),
                    created_at: now,
                });
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_compliance_checks(
        &self,
        company_id: i64,
    ) -> Result<Vec<ComplianceCheck>, DatabaseError> {
        Ok(self
            .state()
            .await?
            .compliance
            .iter()
            .filter(|c| c.company_id == company_id)
            .cloned()
            .collect())
    }
}

fn claim(event: &mut WebhookEvent, now: DateTime<Utc>) {
    event.status = EventStatus::InProgress;
    event.attempt_count += 1;
    event.claimed_at = Some(now);
    event.updated_at = now;
}

/// Release an abandoned claim. Without an attempt row the claim is undone;
/// with one, the attempt counts and the budget decides the new state.
fn reap(event: &mut WebhookEvent, attempted: bool, now: DateTime<Utc>) {
    event.claimed_at = None;
    event.updated_at = now;
    if !attempted {
        event.status = EventStatus::Pending;
        event.attempt_count = (event.attempt_count - 1).max(0);
        event.next_attempt_at = now;
    } else if event.retries_left() {
        event.status = EventStatus::Pending;
        event.next_attempt_at = now;
        event.last_error = Some("Attempt abandoned by worker".to_string());
    } else {
        event.status = EventStatus::Failed;
        event.last_error = Some("Attempt abandoned by worker".to_string());
    }
}

#[async_trait]
impl LockManager for MemoryStore {
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, DatabaseError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.lock_set().insert(name.to_string()) {
                let handle = MemoryLock {
                    name: name.to_string(),
                    locks: Arc::clone(&self.locks),
                };
                return Ok(Some(LockGuard::new(name, Box::new(handle))));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct MemoryLock {
    name: String,
    locks: Arc<std::sync::Mutex<HashSet<String>>>,
}

#[async_trait]
impl LockRelease for MemoryLock {
    async fn release(self: Box<Self>) -> Result<(), DatabaseError> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::event::AttemptStatus;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let guard = store
            .acquire("scheduled_task_1", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("first acquire succeeds");

        let second = store
            .acquire("scheduled_task_1", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(second.is_none());

        guard.release().await.unwrap();
        assert!(store.held_locks().is_empty());
        assert!(
            store
                .acquire("scheduled_task_1", Duration::ZERO)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_claim_skips_tracker_and_future_events() {
        let store = MemoryStore::new();
        let due = store
            .insert_event(&NewEvent::new("a", "https://x", serde_json::json!({})), t0())
            .await
            .unwrap();
        store
            .insert_event(&NewEvent::new("b", "syncro://t", serde_json::json!({})).tracked(), t0())
            .await
            .unwrap();

        let claimed = store.claim_due_events(t0(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].attempt_count, 1);
        assert!(store.claim_due_events(t0(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reap_distinguishes_attempted_claims() {
        let store = MemoryStore::new();
        let a = store
            .insert_event(&NewEvent::new("a", "https://x", serde_json::json!({})), t0())
            .await
            .unwrap();
        let b = store
            .insert_event(&NewEvent::new("b", "https://x", serde_json::json!({})), t0())
            .await
            .unwrap();
        store.claim_due_events(t0(), 10).await.unwrap();
        store
            .insert_attempt(&NewAttempt::new(b.id, 1, AttemptStatus::Error), t0())
            .await
            .unwrap();

        let later = t0() + chrono::Duration::minutes(30);
        let reaped = store
            .reap_stuck_events(later - chrono::Duration::minutes(10), later)
            .await
            .unwrap();
        assert_eq!(reaped, 2);

        let a = store.get_event(a.id).await.unwrap().unwrap();
        assert_eq!((a.status, a.attempt_count), (EventStatus::Pending, 0));
        let b = store.get_event(b.id).await.unwrap().unwrap();
        assert_eq!((b.status, b.attempt_count), (EventStatus::Pending, 1));
    }
}
