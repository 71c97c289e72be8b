//! Persisted automations: triggers, filters, payload templates and dispatch.
//!
//! Scheduled automations are polled by the scheduler's `automation-runner`
//! job through [`AutomationEngine::process_due`]; event automations fire from
//! [`AutomationEngine::handle_event`]. Either way one execution per
//! automation runs at a time across the cluster.

pub mod filter;
pub mod model;
pub mod schedule;
pub mod template;
pub mod value;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

pub use filter::{FilterExpr, matches_filter};
pub use model::{
    ActionSpec, Automation, AutomationKind, AutomationRun, AutomationStatus, Cadence,
    NewAutomation, NewAutomationRun,
};
pub use schedule::calculate_next_run;
pub use template::{SystemVariables, TemplateRenderer};
pub use value::{Context, Value};

use crate::clock::Clock;
use crate::db::{Database, LockManager, automation_lock_name};
use crate::error::AutomationError;
use crate::modules::{DispatchStatus, ModuleDispatcher, TriggerOptions};
use crate::refresh::{RefreshBus, RefreshRequest};
use crate::scheduler::task::RunStatus;

pub const DEFAULT_DUE_BATCH: usize = 20;

const LOCK_CONTENDED: &str = "Already running on another worker";

/// Result of one automation execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub automation_id: i64,
    pub status: RunStatus,
    pub result: serde_json::Value,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Queued,
}

/// Acknowledgement that an event automation was queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventAck {
    pub automation_id: i64,
    pub status: AckStatus,
}

/// Why an execution is happening.
#[derive(Debug, Clone)]
enum Trigger {
    /// Picked up by the due poll; re-checked under the lock.
    Due,
    Manual,
    Event(String),
}

impl Trigger {
    fn event_name(&self) -> Option<&str> {
        match self {
            Self::Event(name) => Some(name),
            _ => None,
        }
    }
}

pub struct AutomationEngine {
    db: Arc<dyn Database>,
    locks: Arc<dyn LockManager>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<ModuleDispatcher>,
    refresh: Arc<RefreshBus>,
    lock_timeout: Duration,
    background: Mutex<JoinSet<()>>,
}

impl AutomationEngine {
    pub fn new(
        db: Arc<dyn Database>,
        locks: Arc<dyn LockManager>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<ModuleDispatcher>,
        refresh: Arc<RefreshBus>,
    ) -> Self {
        Self {
            db,
            locks,
            clock,
            dispatcher,
            refresh,
            lock_timeout: Duration::from_millis(500),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn calculate_next_run(
        &self,
        automation: &Automation,
        reference: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        calculate_next_run(automation, reference)
    }

    /// Recompute and store `next_run_at` for one automation.
    pub async fn refresh_schedule(&self, id: i64) -> Result<Option<DateTime<Utc>>, AutomationError> {
        let automation = self
            .db
            .get_automation(id)
            .await?
            .ok_or(AutomationError::NotFound(id))?;
        let next = if automation.is_active() {
            calculate_next_run(&automation, self.clock.now())
        } else {
            None
        };
        self.db.set_automation_next_run(id, next).await?;
        Ok(next)
    }

    /// Recompute `next_run_at` for every active scheduled automation.
    pub async fn refresh_all_schedules(&self) -> Result<usize, AutomationError> {
        let now = self.clock.now();
        let automations = self.db.list_scheduled_automations().await?;
        for automation in &automations {
            let next = calculate_next_run(automation, now);
            self.db.set_automation_next_run(automation.id, next).await?;
        }
        tracing::info!(count = automations.len(), "Automation schedules refreshed");
        Ok(automations.len())
    }

    /// Run due scheduled automations one after another.
    pub async fn process_due(&self, limit: usize) -> Result<Vec<ExecutionReport>, AutomationError> {
        let due = self.db.list_due_automations(self.clock.now(), limit).await?;
        let mut reports = Vec::with_capacity(due.len());
        for automation in due {
            let id = automation.id;
            match self.execute(automation, Trigger::Due, Value::map()).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => tracing::error!(automation_id = id, error = %e, "Automation execution failed"),
            }
        }
        Ok(reports)
    }

    /// Run an automation immediately, regardless of schedule or status.
    pub async fn execute_now(&self, id: i64) -> Result<ExecutionReport, AutomationError> {
        let automation = self
            .db
            .get_automation(id)
            .await?
            .ok_or(AutomationError::NotFound(id))?;
        let context = Value::map().with("trigger", "manual");
        self.execute(automation, Trigger::Manual, context)
            .await?
            .ok_or(AutomationError::NotFound(id))
    }

    /// Queue every active automation listening for `event_name` whose filter
    /// accepts `context`.
    pub async fn handle_event(
        self: &Arc<Self>,
        event_name: &str,
        context: Context,
    ) -> Result<Vec<EventAck>, AutomationError> {
        let event_name = event_name.trim();
        if event_name.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.db.list_event_automations(event_name).await?;
        let mut acks = Vec::new();
        let mut background = self.background.lock().await;
        while background.try_join_next().is_some() {}

        for automation in candidates {
            if !matches_filter(automation.trigger_filters.as_ref(), &context) {
                tracing::debug!(automation_id = automation.id, event = event_name, "Event filtered out");
                continue;
            }
            acks.push(EventAck {
                automation_id: automation.id,
                status: AckStatus::Queued,
            });

            let engine = Arc::clone(self);
            let trigger = Trigger::Event(event_name.to_string());
            let context = context.clone();
            background.spawn(async move {
                let id = automation.id;
                if let Err(e) = engine.execute(automation, trigger, context).await {
                    tracing::error!(automation_id = id, error = %e, "Event automation failed");
                }
            });
        }

        if !acks.is_empty() {
            tracing::info!(event = event_name, queued = acks.len(), "Event automations queued");
        }
        Ok(acks)
    }

    /// Wait for queued event executions to finish.
    pub async fn shutdown(&self) {
        let mut background = std::mem::take(&mut *self.background.lock().await);
        while let Some(result) = background.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Event automation task panicked");
            }
        }
    }

    async fn execute(
        &self,
        automation: Automation,
        trigger: Trigger,
        context: Context,
    ) -> Result<Option<ExecutionReport>, AutomationError> {
        let id = automation.id;
        let Some(lock) = self.locks.acquire(&automation_lock_name(id), self.lock_timeout).await? else {
            tracing::info!(automation_id = id, "Automation locked elsewhere, skipping");
            return self.record_contended(&automation).await.map(Some);
        };

        let result = self.execute_locked(automation, trigger, context).await;
        if let Err(e) = lock.release().await {
            tracing::warn!(automation_id = id, error = %e, "Failed to release automation lock");
        }
        result
    }

    async fn record_contended(&self, automation: &Automation) -> Result<ExecutionReport, AutomationError> {
        let now = self.clock.now();
        let run = NewAutomationRun {
            automation_id: automation.id,
            status: RunStatus::Skipped,
            started_at: now,
            finished_at: now,
            result_payload: None,
            error_message: Some(LOCK_CONTENDED.to_string()),
        };
        self.db.record_automation_run(&run).await?;
        Ok(ExecutionReport {
            automation_id: automation.id,
            status: RunStatus::Skipped,
            result: serde_json::Value::Null,
            error: Some(LOCK_CONTENDED.to_string()),
            started_at: now,
            finished_at: now,
            next_run_at: automation.next_run_at,
        })
    }

    async fn execute_locked(
        &self,
        automation: Automation,
        trigger: Trigger,
        context: Context,
    ) -> Result<Option<ExecutionReport>, AutomationError> {
        let mut automation = automation;
        if matches!(trigger, Trigger::Due) {
            // Another worker may have run it between the poll and the lock.
            match self.db.get_automation(automation.id).await? {
                Some(current) if current.is_due(self.clock.now()) => automation = current,
                _ => return Ok(None),
            }
        }

        let id = automation.id;
        let started_at = self.clock.now();
        self.db.mark_automation_started(id, started_at).await?;
        automation.last_run_at = Some(started_at);
        tracing::info!(automation_id = id, name = %automation.name, "Executing automation");

        let (status, steps, error) = self.run_actions(&automation, &trigger, &context).await;

        let finished_at = self.clock.now();
        let result = json!({ "steps": steps });

        // Schedule before bookkeeping so a failed insert cannot leave a
        // one-shot due.
        let reference = if status == RunStatus::Failed {
            self.clock.now()
        } else {
            finished_at
        };
        let next_run_at = calculate_next_run(&automation, reference);
        let scheduled = self.db.set_automation_next_run(id, next_run_at).await;

        if let Err(e) = self
            .db
            .record_automation_run(&NewAutomationRun {
                automation_id: id,
                status,
                started_at,
                finished_at,
                result_payload: Some(result.clone()),
                error_message: error.clone(),
            })
            .await
        {
            tracing::error!(automation_id = id, error = %e, "Failed to record automation run");
        }
        if let Err(e) = self.db.set_automation_last_error(id, error.as_deref()).await {
            tracing::error!(automation_id = id, error = %e, "Failed to store automation error");
        }
        scheduled?;

        match &error {
            Some(e) => tracing::warn!(automation_id = id, status = %status, error = %e, "Automation finished"),
            None => tracing::info!(automation_id = id, status = %status, "Automation finished"),
        }

        self.refresh
            .broadcast_refresh(
                RefreshRequest::topic("automations")
                    .reason(format!("automation {status}"))
                    .data(json!({ "automation_id": id, "status": status })),
            )
            .await;

        Ok(Some(ExecutionReport {
            automation_id: id,
            status,
            result,
            error,
            started_at,
            finished_at,
            next_run_at,
        }))
    }

    /// Dispatch each action in order, stopping at the first failure.
    async fn run_actions(
        &self,
        automation: &Automation,
        trigger: &Trigger,
        context: &Context,
    ) -> (RunStatus, Vec<serde_json::Value>, Option<String>) {
        let actions = automation.actions();
        if actions.is_empty() {
            return (RunStatus::Failed, Vec::new(), Some("No actions configured".to_string()));
        }

        let system = SystemVariables::new(self.clock.now())
            .with("automation_id", automation.id)
            .with("automation_name", automation.name.as_str())
            .with("event_name", trigger.event_name());
        let renderer = TemplateRenderer::new(context, &system);

        let mut steps = Vec::with_capacity(actions.len());
        let mut skipped = 0;
        for action in &actions {
            let mut payload = renderer.render(&action.payload).to_json();
            if let Some(map) = payload.as_object_mut() {
                map.entry("context").or_insert_with(|| context.to_json());
            }

            let result = self
                .dispatcher
                .trigger(&action.module, payload, TriggerOptions::default())
                .await;
            steps.push(json!({
                "module": action.module,
                "status": result.status,
                "event_id": result.event_id,
                "response": result.response,
                "error": result.error,
            }));

            match result.status {
                DispatchStatus::Failed => {
                    let reason = result.error.unwrap_or_else(|| "unknown error".to_string());
                    return (
                        RunStatus::Failed,
                        steps,
                        Some(format!("Action {} failed: {reason}", action.module)),
                    );
                }
                DispatchStatus::Skipped => skipped += 1,
                DispatchStatus::Succeeded | DispatchStatus::Queued => {}
            }
        }

        let status = if skipped == actions.len() {
            RunStatus::Skipped
        } else {
            RunStatus::Succeeded
        };
        (status, steps, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::memory::MemoryStore;
    use crate::error::ModuleError;
    use crate::modules::{Module, ModuleConfig, ModuleResponse, ModuleUpdate, PreparedCall};
    use crate::monitor::EventMonitor;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    /// Records payloads; fails when the payload says so.
    #[derive(Default)]
    struct Recorder {
        payloads: StdMutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Module for Recorder {
        fn slug(&self) -> &str {
            "recorder"
        }

        fn description(&self) -> &str {
            "test"
        }

        fn prepare(
            &self,
            _config: &ModuleConfig,
            payload: &serde_json::Value,
        ) -> Result<PreparedCall, ModuleError> {
            Ok(PreparedCall::new("test://recorder", payload.clone()))
        }

        async fn execute(
            &self,
            _config: &ModuleConfig,
            call: &PreparedCall,
        ) -> Result<ModuleResponse, ModuleError> {
            self.payloads.lock().unwrap().push(call.body.clone());
            if call.body.get("fail").is_some() {
                return Err(ModuleError::Transport("connection refused".into()));
            }
            Ok(ModuleResponse::new(json!({"ok": true})))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        recorder: Arc<Recorder>,
        engine: Arc<AutomationEngine>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_module(
                "recorder",
                &ModuleUpdate {
                    enabled: Some(true),
                    settings: Some(json!({"max_attempts": 1})),
                    ..Default::default()
                },
                clock.now(),
            )
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let monitor = Arc::new(EventMonitor::new(store.clone(), clock.clone()));
        let dispatcher = Arc::new(
            ModuleDispatcher::new(store.clone(), clock.clone(), monitor).with_module(recorder.clone()),
        );
        let refresh = Arc::new(RefreshBus::new(clock.clone(), "test"));
        let engine = Arc::new(AutomationEngine::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            dispatcher,
            refresh,
        ));
        Fixture {
            clock,
            store,
            recorder,
            engine,
        }
    }

    #[tokio::test]
    async fn test_due_automation_runs_and_reschedules() {
        let f = fixture().await;
        let created = f
            .store
            .create_automation(
                &NewAutomation::scheduled("Daily digest")
                    .with_cron("0 9 * * *")
                    .with_next_run(f.clock.now())
                    .with_action("recorder", json!({"title": "Digest for {{ today }} by {{ automation_name }}"})),
                f.clock.now(),
            )
            .await
            .unwrap();

        let reports = f.engine.process_due(DEFAULT_DUE_BATCH).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, RunStatus::Succeeded);
        assert_eq!(
            reports[0].next_run_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 7, 9, 0, 0).unwrap())
        );

        let payloads = f.recorder.payloads.lock().unwrap().clone();
        assert_eq!(payloads[0]["title"], "Digest for 2025-01-06 by Daily digest");
        assert!(payloads[0].get("context").is_some());

        let stored = f.store.get_automation(created.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(f.clock.now()));
        assert!(stored.last_error.is_none());

        // Not due again until tomorrow.
        assert!(f.engine.process_due(DEFAULT_DUE_BATCH).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_clears_next_run() {
        let f = fixture().await;
        let created = f
            .store
            .create_automation(
                &NewAutomation::scheduled("Once")
                    .once_at(f.clock.now())
                    .with_action("recorder", json!({})),
                f.clock.now(),
            )
            .await
            .unwrap();
        f.engine.refresh_schedule(created.id).await.unwrap();

        let report = f.engine.execute_now(created.id).await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.next_run_at, None);
        let stored = f.store.get_automation(created.id).await.unwrap().unwrap();
        assert!(stored.last_run_at.is_some());
        assert!(stored.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_one_shot_is_not_rerun_when_run_record_fails() {
        let f = fixture().await;
        let created = f
            .store
            .create_automation(
                &NewAutomation::scheduled("Once")
                    .once_at(f.clock.now())
                    .with_action("recorder", json!({})),
                f.clock.now(),
            )
            .await
            .unwrap();
        f.engine.refresh_schedule(created.id).await.unwrap();

        f.store.set_run_records_failing(true);
        let reports = f.engine.process_due(DEFAULT_DUE_BATCH).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, RunStatus::Succeeded);
        f.store.set_run_records_failing(false);

        let stored = f.store.get_automation(created.id).await.unwrap().unwrap();
        assert!(stored.next_run_at.is_none());
        assert!(f.store.list_automation_runs(created.id, 10).await.unwrap().is_empty());

        f.clock.advance(chrono::Duration::minutes(5));
        assert!(f.engine.process_due(DEFAULT_DUE_BATCH).await.unwrap().is_empty());
        assert_eq!(f.recorder.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_failure_stops_remaining_actions() {
        let f = fixture().await;
        let created = f
            .store
            .create_automation(
                &NewAutomation::scheduled("Chain")
                    .with_cadence(Cadence::Hourly)
                    .with_actions(vec![
                        ActionSpec {
                            module: "recorder".into(),
                            payload: json!({"step": 1}),
                        },
                        ActionSpec {
                            module: "missing-module".into(),
                            payload: json!({}),
                        },
                        ActionSpec {
                            module: "recorder".into(),
                            payload: json!({"fail": true}),
                        },
                        ActionSpec {
                            module: "recorder".into(),
                            payload: json!({"step": 4}),
                        },
                    ]),
                f.clock.now(),
            )
            .await
            .unwrap();

        let report = f.engine.execute_now(created.id).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            report.error.as_deref(),
            Some("Action recorder failed: Transport failure: connection refused")
        );
        let steps = report.result["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1]["status"], "skipped");
        assert_eq!(f.recorder.payloads.lock().unwrap().len(), 2);

        let stored = f.store.get_automation(created.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error, report.error);
        assert_eq!(stored.next_run_at, Some(f.clock.now() + chrono::Duration::hours(1)));

        let runs = f.store.list_automation_runs(created.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_no_actions_fails() {
        let f = fixture().await;
        let created = f
            .store
            .create_automation(&NewAutomation::scheduled("Empty"), f.clock.now())
            .await
            .unwrap();
        let report = f.engine.execute_now(created.id).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("No actions configured"));
        assert!(matches!(
            f.engine.execute_now(999).await,
            Err(AutomationError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_lock_contention_records_skipped_run() {
        let f = fixture().await;
        let created = f
            .store
            .create_automation(
                &NewAutomation::scheduled("Busy").with_action("recorder", json!({})),
                f.clock.now(),
            )
            .await
            .unwrap();

        let held = f
            .store
            .acquire(&automation_lock_name(created.id), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let report = f.engine.execute_now(created.id).await.unwrap();
        assert_eq!(report.status, RunStatus::Skipped);
        assert_eq!(report.error.as_deref(), Some(LOCK_CONTENDED));
        assert!(f.recorder.payloads.lock().unwrap().is_empty());
        held.release().await.unwrap();

        let runs = f.store.list_automation_runs(created.id, 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Skipped);
        assert_eq!(runs[0].error_message.as_deref(), Some(LOCK_CONTENDED));
    }

    #[tokio::test]
    async fn test_event_automations_respect_filters() {
        let f = fixture().await;
        let filter = FilterExpr::parse(&json!({"ticket.priority": ["high", "urgent"]})).unwrap();
        let matching = f
            .store
            .create_automation(
                &NewAutomation::event("Escalate", "ticket.created")
                    .with_filter(filter)
                    .with_action("recorder", json!({"ticket": "{{ ticket.id }}", "event": "{{ event_name }}"})),
                f.clock.now(),
            )
            .await
            .unwrap();
        f.store
            .create_automation(
                &NewAutomation::event("Other", "ticket.closed").with_action("recorder", json!({})),
                f.clock.now(),
            )
            .await
            .unwrap();

        assert!(f.engine.handle_event("  ", Value::map()).await.unwrap().is_empty());

        let low = Value::map().with("ticket", Value::map().with("id", 7).with("priority", "low"));
        assert!(f.engine.handle_event("ticket.created", low).await.unwrap().is_empty());

        let high = Value::map().with("ticket", Value::map().with("id", 8).with("priority", "high"));
        let acks = f.engine.handle_event("ticket.created", high).await.unwrap();
        assert_eq!(
            acks,
            vec![EventAck {
                automation_id: matching.id,
                status: AckStatus::Queued
            }]
        );

        f.engine.shutdown().await;
        let payloads = f.recorder.payloads.lock().unwrap().clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["ticket"], json!(8));
        assert_eq!(payloads[0]["event"], "ticket.created");
    }
}
