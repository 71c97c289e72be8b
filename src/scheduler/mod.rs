//! Cron-driven task scheduler.
//!
//! Each node keeps a [`TimingWheel`] of task triggers plus the monitoring
//! jobs and fires whatever is due. Cluster-wide exclusivity comes from the
//! `scheduled_task_{id}` lock: only the node that takes it records a run.

pub mod commands;
pub mod task;
pub mod wheel;

use std::collections::HashSet;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::{JoinHandle, JoinSet};

pub use commands::{CommandContext, CommandDeps, CommandHandler, CommandOutcome, CommandRegistry};
pub use task::{NewScheduledTask, NewTaskRun, RunStatus, ScheduledTask, ScheduledTaskRun, truncate_details};
pub use wheel::{JobKey, MonitorJob, Registration, TimingWheel, Trigger};

use crate::automation::{AutomationEngine, DEFAULT_DUE_BATCH};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::crontab;
use crate::db::{Database, LockManager, task_lock_name};
use crate::error::SchedulerError;
use crate::monitor::EventMonitor;
use crate::refresh::{RefreshBus, RefreshRequest};

/// Longest the run loop sleeps before re-reading the clock.
const MAX_IDLE: Duration = Duration::from_secs(1);

const WEBHOOK_MONITOR_EVERY: Duration = Duration::from_secs(60);
const WEBHOOK_CLEANUP_EVERY: Duration = Duration::from_secs(60 * 60);

/// Largest exponent applied to the in-process retry backoff.
const MAX_RETRY_DOUBLINGS: u32 = 16;

/// Why a task is being run. Manual runs ignore the active flag and set
/// `force_restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Firing {
    Scheduled,
    Manual,
}

struct RunLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    db: Arc<dyn Database>,
    locks: Arc<dyn LockManager>,
    clock: Arc<dyn Clock>,
    monitor: Arc<EventMonitor>,
    refresh: Arc<RefreshBus>,
    automations: Option<Arc<AutomationEngine>>,
    commands: CommandRegistry,
    config: SchedulerConfig,
    wheel: Mutex<TimingWheel>,
    wake: Notify,
    in_flight: std::sync::Mutex<HashSet<JobKey>>,
    running: Mutex<JoinSet<()>>,
    run_loop: Mutex<Option<RunLoop>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        locks: Arc<dyn LockManager>,
        clock: Arc<dyn Clock>,
        monitor: Arc<EventMonitor>,
        refresh: Arc<RefreshBus>,
        commands: CommandRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            locks,
            clock,
            monitor,
            refresh,
            automations: None,
            commands,
            config,
            wheel: Mutex::new(TimingWheel::new()),
            wake: Notify::new(),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            running: Mutex::new(JoinSet::new()),
            run_loop: Mutex::new(None),
        }
    }

    /// Enable the `automation-runner` job.
    pub fn with_automations(mut self, engine: Arc<AutomationEngine>) -> Self {
        self.automations = Some(engine);
        self
    }

    /// Register the monitoring jobs, load tasks in the background and start
    /// the run loop. Calling it again while running does nothing.
    pub async fn start(self: &Arc<Self>) {
        let mut run_loop = self.run_loop.lock().await;
        if run_loop.is_some() {
            return;
        }

        self.register_monitor_jobs().await;

        let scheduler = Arc::clone(self);
        self.running.lock().await.spawn(async move {
            match scheduler.refresh().await {
                Ok(count) => tracing::info!(tasks = count, "Scheduled tasks loaded"),
                Err(e) => tracing::error!(error = %e, "Task source unavailable; monitoring jobs still run"),
            }
        });

        let (shutdown, rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        *run_loop = Some(RunLoop { shutdown, handle });
        tracing::info!(timezone = %self.config.timezone, "Scheduler started");
    }

    /// Stop the run loop and wait for in-flight jobs. Idempotent.
    pub async fn stop(&self) {
        let Some(run_loop) = self.run_loop.lock().await.take() else {
            return;
        };
        let _ = run_loop.shutdown.send(true);
        if let Err(e) = run_loop.handle.await {
            tracing::error!(error = %e, "Scheduler loop ended abnormally");
        }
        self.drain().await;
        tracing::info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.run_loop.lock().await.is_some()
    }

    /// Reload active tasks into the wheel. Monitoring jobs are kept and
    /// unchanged tasks keep their pending fire instant.
    pub async fn refresh(&self) -> Result<usize, SchedulerError> {
        let tasks = self.db.list_active_tasks().await?;
        let registered = self
            .wheel
            .lock()
            .await
            .replace_tasks(&tasks, self.config.timezone, self.clock.now());
        self.wake.notify_one();
        tracing::debug!(registered, "Task registrations refreshed");
        Ok(registered)
    }

    /// Enable or disable a task and re-sync the wheel.
    pub async fn set_task_active(&self, task_id: i64, active: bool) -> Result<ScheduledTask, SchedulerError> {
        if !self.db.set_task_active(task_id, active).await? {
            return Err(SchedulerError::TaskNotFound(task_id));
        }
        self.refresh().await?;
        tracing::info!(task_id, active, "Task activation changed");
        self.load_task(task_id).await
    }

    /// Replace a task's cron expression. The next firing is computed from now.
    pub async fn update_task_cron(&self, task_id: i64, cron: &str) -> Result<ScheduledTask, SchedulerError> {
        crontab::validate(cron)?;
        if !self.db.update_task_cron(task_id, cron).await? {
            return Err(SchedulerError::TaskNotFound(task_id));
        }
        self.refresh().await?;
        tracing::info!(task_id, cron, "Task schedule changed");
        self.load_task(task_id).await
    }

    /// Delete a task and its trigger.
    pub async fn delete_task(&self, task_id: i64) -> Result<(), SchedulerError> {
        if !self.db.delete_task(task_id).await? {
            return Err(SchedulerError::TaskNotFound(task_id));
        }
        self.wheel.lock().await.remove(&JobKey::Task(task_id));
        tracing::info!(task_id, "Task deleted");
        Ok(())
    }

    async fn load_task(&self, task_id: i64) -> Result<ScheduledTask, SchedulerError> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(task_id))
    }

    pub async fn list_registrations(&self) -> Vec<Registration> {
        self.wheel.lock().await.snapshot()
    }

    /// Run a task now, bypassing its trigger and active flag, and wait for
    /// the outcome. `Ok(None)` means another worker holds the task lock.
    pub async fn run_now(&self, task_id: i64) -> Result<Option<ScheduledTaskRun>, SchedulerError> {
        self.run_task(task_id, Firing::Manual).await
    }

    /// Like [`Scheduler::run_now`] but returns once the task is known to
    /// exist; the run continues in the background.
    pub async fn trigger_now(self: &Arc<Self>, task_id: i64) -> Result<(), SchedulerError> {
        if self.db.get_task(task_id).await?.is_none() {
            return Err(SchedulerError::TaskNotFound(task_id));
        }
        let scheduler = Arc::clone(self);
        self.running.lock().await.spawn(async move {
            if let Err(e) = scheduler.run_task(task_id, Firing::Manual).await {
                tracing::error!(task_id, error = %e, "Manual task run failed");
            }
        });
        Ok(())
    }

    /// Fire every registration due at the current instant. Returns the keys
    /// that were started; keys still running from an earlier firing are
    /// skipped.
    pub async fn tick(self: &Arc<Self>) -> Vec<JobKey> {
        let due = self.wheel.lock().await.take_due(self.clock.now());
        let mut started = Vec::with_capacity(due.len());
        let mut running = self.running.lock().await;
        while running.try_join_next().is_some() {}

        for registration in due {
            let key = registration.key;
            if !self.claim_in_flight(key) {
                tracing::debug!(job = %key, "Previous firing still running, skipping");
                continue;
            }
            let scheduler = Arc::clone(self);
            running.spawn(async move {
                scheduler.fire(key).await;
                scheduler.release_in_flight(key);
            });
            started.push(key);
        }
        started
    }

    /// Wait for every spawned job to finish.
    pub async fn drain(&self) {
        let mut running = std::mem::take(&mut *self.running.lock().await);
        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Scheduled job panicked");
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.tick().await;

            let idle = {
                let wheel = self.wheel.lock().await;
                wheel
                    .next_deadline()
                    .and_then(|deadline| (deadline - self.clock.now()).to_std().ok())
                    .unwrap_or(MAX_IDLE)
                    .min(MAX_IDLE)
            };

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn register_monitor_jobs(&self) {
        let now = self.clock.now();
        let mut jobs = vec![
            (MonitorJob::WebhookMonitor, Trigger::every(WEBHOOK_MONITOR_EVERY)),
            (MonitorJob::WebhookCleanup, Trigger::every(WEBHOOK_CLEANUP_EVERY)),
        ];
        if self.automations.is_some() {
            jobs.push((
                MonitorJob::AutomationRunner,
                Trigger::every(self.config.automation_interval),
            ));
        }

        let mut wheel = self.wheel.lock().await;
        for (job, trigger) in jobs {
            if let Err(e) = wheel.schedule(JobKey::Monitor(job), job.as_str(), trigger, now) {
                tracing::error!(job = job.as_str(), error = %e, "Failed to register monitoring job");
            }
        }
    }

    async fn fire(&self, key: JobKey) {
        match key {
            JobKey::Task(id) => {
                if let Err(e) = self.run_task(id, Firing::Scheduled).await {
                    tracing::error!(task_id = id, error = %e, "Scheduled task run failed");
                }
            }
            JobKey::Monitor(job) => self.run_monitor_job(job).await,
        }
    }

    async fn run_monitor_job(&self, job: MonitorJob) {
        match job {
            MonitorJob::WebhookMonitor => {
                if let Err(e) = self.monitor.reap_stuck(self.config.webhook_stuck_timeout).await {
                    tracing::error!(error = %e, "Failed to reap stuck webhook events");
                }
                if let Err(e) = self.monitor.process_pending(self.config.webhook_batch_size).await {
                    tracing::error!(error = %e, "Failed to process pending webhook events");
                }
            }
            MonitorJob::WebhookCleanup => {
                if let Err(e) = self.monitor.purge_completed(self.config.webhook_retention).await {
                    tracing::error!(error = %e, "Failed to purge webhook events");
                }
            }
            MonitorJob::AutomationRunner => {
                let Some(engine) = &self.automations else {
                    return;
                };
                match engine.process_due(DEFAULT_DUE_BATCH).await {
                    Ok(reports) if !reports.is_empty() => {
                        tracing::info!(executed = reports.len(), "Due automations processed");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Failed to process due automations"),
                }
            }
        }
    }

    /// Execute one task under its cluster lock and record a single run.
    /// Scheduled firings of a task that was deactivated or deleted since the
    /// last refresh drop its registration instead of running.
    async fn run_task(
        &self,
        task_id: i64,
        firing: Firing,
    ) -> Result<Option<ScheduledTaskRun>, SchedulerError> {
        let task = match self.db.get_task(task_id).await? {
            Some(task) if task.active || firing == Firing::Manual => task,
            Some(_) => {
                self.wheel.lock().await.remove(&JobKey::Task(task_id));
                tracing::info!(task_id, "Task deactivated, dropping its trigger");
                return Ok(None);
            }
            None => {
                if firing == Firing::Scheduled {
                    self.wheel.lock().await.remove(&JobKey::Task(task_id));
                }
                return Err(SchedulerError::TaskNotFound(task_id));
            }
        };
        let force_restart = firing == Firing::Manual;

        let Some(lock) = self
            .locks
            .acquire(&task_lock_name(task_id), self.config.lock_timeout)
            .await?
        else {
            tracing::info!(task_id, command = %task.command, "Task locked by another worker, skipping");
            return Ok(None);
        };

        let started_at = self.clock.now();
        tracing::info!(task_id, command = %task.command, "Running scheduled task");

        let max_attempts = task.max_retries.max(0) as u32 + 1;
        let mut attempt = 1;
        let outcome = loop {
            let outcome = self.execute_command(&task, force_restart).await;
            if outcome.status != RunStatus::Failed || attempt >= max_attempts {
                break outcome;
            }
            let delay = retry_backoff(task.retry_backoff_seconds, attempt);
            tracing::warn!(
                task_id,
                attempt,
                delay_secs = delay.as_secs(),
                details = outcome.details.as_deref().unwrap_or_default(),
                "Task failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        let run = NewTaskRun {
            task_id,
            status: outcome.status,
            started_at,
            finished_at: self.clock.now(),
            details: outcome.details.as_deref().map(truncate_details),
        };
        let recorded = self.db.record_task_run(&run).await;

        if let Err(e) = lock.release().await {
            tracing::warn!(task_id, error = %e, "Failed to release task lock");
        }
        let recorded = recorded?;

        match recorded.status {
            RunStatus::Failed => tracing::warn!(task_id, attempts = attempt, "Scheduled task failed"),
            status => tracing::info!(task_id, %status, "Scheduled task finished"),
        }

        self.refresh
            .broadcast_refresh(
                RefreshRequest::topic("scheduler")
                    .reason(format!("task {}", recorded.status))
                    .data(json!({ "task_id": task_id, "status": recorded.status })),
            )
            .await;

        Ok(Some(recorded))
    }

    /// Run the handler in its own task so a panic becomes a failed outcome.
    async fn execute_command(&self, task: &ScheduledTask, force_restart: bool) -> CommandOutcome {
        let commands = self.commands.clone();
        let task = task.clone();
        match tokio::spawn(async move { commands.execute(&task, force_restart).await }).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => CommandOutcome::failed("Command panicked"),
            Err(e) => CommandOutcome::failed(format!("Command aborted: {e}")),
        }
    }

    // Inserts and removes cannot leave the set half-updated, so a poisoned
    // guard is still usable.
    fn in_flight_set(&self) -> std::sync::MutexGuard<'_, HashSet<JobKey>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim_in_flight(&self, key: JobKey) -> bool {
        self.in_flight_set().insert(key)
    }

    fn release_in_flight(&self, key: JobKey) {
        self.in_flight_set().remove(&key);
    }
}

/// `backoff × 2^(attempt − 1)`.
fn retry_backoff(backoff_seconds: i32, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(MAX_RETRY_DOUBLINGS);
    Duration::from_secs(u64::from(backoff_seconds.max(0).unsigned_abs()) << doublings)
}
