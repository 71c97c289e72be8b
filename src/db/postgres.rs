//! PostgreSQL store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime, Timeouts};
use tokio_postgres::{NoTls, Row};

use super::{Database, LockGuard, LockManager, LockRelease};
use crate::automation::filter::FilterExpr;
use crate::automation::model::{Automation, AutomationRun, NewAutomation, NewAutomationRun};
use crate::compliance::{ComplianceCheck, ComplianceTemplate, INITIAL_STATUS};
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::modules::config::{ModuleConfig, ModuleUpdate};
use crate::monitor::event::{
    EventOutcome, EventStatus, Headers, NewAttempt, NewEvent, WebhookEvent, WebhookEventAttempt,
};
use crate::scheduler::task::{NewScheduledTask, NewTaskRun, ScheduledTask, ScheduledTaskRun};

fn create_pool(config: &DatabaseConfig, max_size: usize) -> Result<Pool, DatabaseError> {
    let mut cfg = Config::new();
    cfg.url = Some(config.url().to_string());
    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: max_size.max(1),
        timeouts: Timeouts {
            wait: Some(config.acquire_timeout),
            create: Some(config.acquire_timeout),
            recycle: Some(config.acquire_timeout),
        },
        ..Default::default()
    });
    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| DatabaseError::Pool(e.to_string()))
}

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// How often a contended advisory lock is retried.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

const ABANDONED: &str = "Attempt abandoned by worker";

/// Database store backed by deadpool connection pools. Advisory locks live
/// on their own pool so a run holding a lock never waits on a connection
/// that another lock holder has taken.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    lock_pool: Pool,
}

impl PgStore {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = create_pool(config, config.pool_size)?;
        let lock_pool = create_pool(config, config.lock_pool_size)?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool, lock_pool })
    }

    pub fn from_pools(pool: Pool, lock_pool: Pool) -> Self {
        Self { pool, lock_pool }
    }

    /// Apply embedded refinery migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::info!(
            applied = report.applied_migrations().len(),
            "Database migrations complete"
        );
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

// ==================== Row mapping ====================

fn parse_column<T: FromStr<Err = String>>(
    column: &'static str,
    raw: &str,
) -> Result<T, DatabaseError> {
    raw.parse()
        .map_err(|reason| DatabaseError::InvalidValue { column, reason })
}

fn parse_opt_column<T: FromStr<Err = String>>(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    raw.map(|s| parse_column(column, &s)).transpose()
}

fn headers_from(column: &'static str, value: serde_json::Value) -> Result<Headers, DatabaseError> {
    serde_json::from_value(value).map_err(|e| DatabaseError::InvalidValue {
        column,
        reason: e.to_string(),
    })
}

fn row_to_task(row: &Row) -> Result<ScheduledTask, DatabaseError> {
    Ok(ScheduledTask {
        id: row.get("id"),
        name: row.get("name"),
        command: row.get("command"),
        cron: row.get("cron"),
        company_id: row.get("company_id"),
        description: row.get("description"),
        active: row.get("active"),
        max_retries: row.get("max_retries"),
        retry_backoff_seconds: row.get("retry_backoff_seconds"),
        last_run_at: row.get("last_run_at"),
        last_status: parse_opt_column("last_status", row.get("last_status"))?,
        last_error: row.get("last_error"),
    })
}

fn row_to_task_run(row: &Row) -> Result<ScheduledTaskRun, DatabaseError> {
    Ok(ScheduledTaskRun {
        id: row.get("id"),
        task_id: row.get("task_id"),
        status: parse_column("status", row.get::<_, &str>("status"))?,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        details: row.get("details"),
    })
}

fn row_to_automation(row: &Row) -> Result<Automation, DatabaseError> {
    let filters: Option<serde_json::Value> = row.get("trigger_filters");
    let trigger_filters = filters
        .filter(|v| !v.is_null())
        .map(|v| FilterExpr::parse(&v))
        .transpose()
        .map_err(|e| DatabaseError::InvalidValue {
            column: "trigger_filters",
            reason: e.to_string(),
        })?;
    let scheduled_time: Option<NaiveDateTime> = row.get("scheduled_time");

    Ok(Automation {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        kind: parse_column("kind", row.get::<_, &str>("kind"))?,
        cadence: parse_opt_column("cadence", row.get("cadence"))?,
        cron_expression: row.get("cron_expression"),
        scheduled_time: scheduled_time.map(|naive| naive.and_utc()),
        run_once: row.get("run_once"),
        next_run_at: row.get("next_run_at"),
        last_run_at: row.get("last_run_at"),
        last_error: row.get("last_error"),
        trigger_event: row.get("trigger_event"),
        trigger_filters,
        action_module: row.get("action_module"),
        action_payload: row.get("action_payload"),
        status: parse_column("status", row.get::<_, &str>("status"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_automation_run(row: &Row) -> Result<AutomationRun, DatabaseError> {
    Ok(AutomationRun {
        id: row.get("id"),
        automation_id: row.get("automation_id"),
        status: parse_column("status", row.get::<_, &str>("status"))?,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        result_payload: row.get("result_payload"),
        error_message: row.get("error_message"),
    })
}

fn row_to_event(row: &Row) -> Result<WebhookEvent, DatabaseError> {
    Ok(WebhookEvent {
        id: row.get("id"),
        name: row.get("name"),
        target_url: row.get("target_url"),
        headers: headers_from("headers", row.get("headers"))?,
        payload: row.get("payload"),
        delivery: parse_column("delivery", row.get::<_, &str>("delivery"))?,
        status: parse_column("status", row.get::<_, &str>("status"))?,
        attempt_count: row.get("attempt_count"),
        max_attempts: row.get("max_attempts"),
        backoff_seconds: row.get("backoff_seconds"),
        next_attempt_at: row.get("next_attempt_at"),
        claimed_at: row.get("claimed_at"),
        last_error: row.get("last_error"),
        response_status: row.get("response_status"),
        response_body: row.get("response_body"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_attempt(row: &Row) -> Result<WebhookEventAttempt, DatabaseError> {
    Ok(WebhookEventAttempt {
        id: row.get("id"),
        event_id: row.get("event_id"),
        attempt_number: row.get("attempt_number"),
        status: parse_column("status", row.get::<_, &str>("status"))?,
        response_status: row.get("response_status"),
        request_headers: headers_from("request_headers", row.get("request_headers"))?,
        request_body: row.get("request_body"),
        response_headers: headers_from("response_headers", row.get("response_headers"))?,
        response_body: row.get("response_body"),
        error_message: row.get("error_message"),
        attempted_at: row.get("attempted_at"),
    })
}

fn row_to_module(row: &Row) -> ModuleConfig {
    ModuleConfig {
        slug: row.get("slug"),
        name: row.get("name"),
        enabled: row.get("enabled"),
        settings: row.get("settings"),
        updated_at: row.get("updated_at"),
    }
}

fn collect<T>(
    rows: &[Row],
    map: impl Fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    rows.iter().map(map).collect()
}

#[async_trait]
impl Database for PgStore {
    // ==================== Scheduled tasks ====================

    async fn create_task(&self, task: &NewScheduledTask) -> Result<ScheduledTask, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO scheduled_tasks
                    (name, command, cron, company_id, description, active, max_retries, retry_backoff_seconds)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING *
                "#,
                &[
                    &task.name,
                    &task.command,
                    &task.cron,
                    &task.company_id,
                    &task.description,
                    &task.active,
                    &task.max_retries,
                    &task.retry_backoff_seconds,
                ],
            )
            .await?;
        row_to_task(&row)
    }

    async fn get_task(&self, id: i64) -> Result<Option<ScheduledTask>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM scheduled_tasks WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_active_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM scheduled_tasks WHERE active ORDER BY id",
                &[],
            )
            .await?;
        collect(&rows, row_to_task)
    }

    async fn set_task_active(&self, id: i64, active: bool) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE scheduled_tasks SET active = $2 WHERE id = $1",
                &[&id, &active],
            )
            .await?;
        Ok(n > 0)
    }

    async fn update_task_cron(&self, id: i64, cron: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE scheduled_tasks SET cron = $2 WHERE id = $1",
                &[&id, &cron],
            )
            .await?;
        Ok(n > 0)
    }

    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute("DELETE FROM scheduled_tasks WHERE id = $1", &[&id])
            .await?;
        Ok(n > 0)
    }

    async fn record_task_run(&self, run: &NewTaskRun) -> Result<ScheduledTaskRun, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_one(
                r#"
                INSERT INTO scheduled_task_runs (task_id, status, started_at, finished_at, duration_ms, details)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
                &[
                    &run.task_id,
                    &run.status.as_str(),
                    &run.started_at,
                    &run.finished_at,
                    &run.duration_ms(),
                    &run.details,
                ],
            )
            .await?;
        tx.execute(
            "UPDATE scheduled_tasks SET last_run_at = $2, last_status = $3, last_error = $4 WHERE id = $1",
            &[&run.task_id, &run.started_at, &run.status.as_str(), &run.error()],
        )
        .await?;
        tx.commit().await?;

        row_to_task_run(&row)
    }

    async fn list_task_runs(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRun>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM scheduled_task_runs WHERE task_id = $1 ORDER BY started_at DESC, id DESC LIMIT $2",
                &[&task_id, &(limit as i64)],
            )
            .await?;
        collect(&rows, row_to_task_run)
    }

    // ==================== Automations ====================

    async fn create_automation(
        &self,
        a: &NewAutomation,
        now: DateTime<Utc>,
    ) -> Result<Automation, DatabaseError> {
        let conn = self.conn().await?;
        let filters = a.trigger_filters.as_ref().map(FilterExpr::to_json);
        let scheduled_time = a.scheduled_time.map(|t| t.naive_utc());
        let row = conn
            .query_one(
                r#"
                INSERT INTO automations
                    (name, description, kind, cadence, cron_expression, scheduled_time, run_once,
                     next_run_at, trigger_event, trigger_filters, action_module, action_payload,
                     status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
                RETURNING *
                "#,
                &[
                    &a.name,
                    &a.description,
                    &a.kind.as_str(),
                    &a.cadence.map(|c| c.as_str()),
                    &a.cron_expression,
                    &scheduled_time,
                    &a.run_once,
                    &a.next_run_at,
                    &a.trigger_event,
                    &filters,
                    &a.action_module,
                    &a.action_payload,
                    &a.status.as_str(),
                    &now,
                ],
            )
            .await?;
        row_to_automation(&row)
    }

    async fn get_automation(&self, id: i64) -> Result<Option<Automation>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM automations WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(row_to_automation).transpose()
    }

    async fn list_due_automations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Automation>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM automations
                WHERE status = 'active' AND kind = 'scheduled'
                  AND next_run_at IS NOT NULL AND next_run_at <= $1
                ORDER BY next_run_at, id
                LIMIT $2
                "#,
                &[&now, &(limit as i64)],
            )
            .await?;
        collect(&rows, row_to_automation)
    }

    async fn list_scheduled_automations(&self) -> Result<Vec<Automation>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM automations WHERE status = 'active' AND kind = 'scheduled' ORDER BY id",
                &[],
            )
            .await?;
        collect(&rows, row_to_automation)
    }

    async fn list_event_automations(
        &self,
        event_name: &str,
    ) -> Result<Vec<Automation>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM automations WHERE status = 'active' AND kind = 'event' AND trigger_event = $1 ORDER BY id",
                &[&event_name],
            )
            .await?;
        collect(&rows, row_to_automation)
    }

    async fn mark_automation_started(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE automations SET last_run_at = $2, last_error = NULL, updated_at = $2 WHERE id = $1",
            &[&id, &at],
        )
        .await?;
        Ok(())
    }

    async fn set_automation_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE automations SET next_run_at = $2 WHERE id = $1",
            &[&id, &next_run_at],
        )
        .await?;
        Ok(())
    }

    async fn set_automation_last_error(
        &self,
        id: i64,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE automations SET last_error = $2 WHERE id = $1",
            &[&id, &error],
        )
        .await?;
        Ok(())
    }

    async fn record_automation_run(
        &self,
        run: &NewAutomationRun,
    ) -> Result<AutomationRun, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO automation_runs
                    (automation_id, status, started_at, finished_at, duration_ms, result_payload, error_message)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *
                "#,
                &[
                    &run.automation_id,
                    &run.status.as_str(),
                    &run.started_at,
                    &run.finished_at,
                    &run.duration_ms(),
                    &run.result_payload,
                    &run.error_message,
                ],
            )
            .await?;
        row_to_automation_run(&row)
    }

    async fn list_automation_runs(
        &self,
        automation_id: i64,
        limit: usize,
    ) -> Result<Vec<AutomationRun>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM automation_runs WHERE automation_id = $1 ORDER BY started_at DESC, id DESC LIMIT $2",
                &[&automation_id, &(limit as i64)],
            )
            .await?;
        collect(&rows, row_to_automation_run)
    }

    // ==================== Webhook events ====================

    async fn insert_event(
        &self,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, DatabaseError> {
        let conn = self.conn().await?;
        let headers = serde_json::to_value(&event.headers)?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO webhook_events
                    (name, target_url, headers, payload, delivery, status, attempt_count,
                     max_attempts, backoff_seconds, next_attempt_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $9, $9)
                RETURNING *
                "#,
                &[
                    &event.name,
                    &event.target_url,
                    &headers,
                    &event.payload,
                    &event.delivery.as_str(),
                    &event.max_attempts,
                    &event.backoff_seconds,
                    &(now + event.hold),
                    &now,
                ],
            )
            .await?;
        row_to_event(&row)
    }

    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM webhook_events WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let status = status.map(|s| s.as_str());
        let rows = conn
            .query(
                r#"
                SELECT * FROM webhook_events
                WHERE ($1::text IS NULL OR status = $1)
                ORDER BY id DESC
                LIMIT $2
                "#,
                &[&status, &(limit as i64)],
            )
            .await?;
        collect(&rows, row_to_event)
    }

    async fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                WITH due AS (
                    SELECT id FROM webhook_events
                    WHERE status = 'pending' AND delivery = 'monitor' AND next_attempt_at <= $1
                    ORDER BY next_attempt_at, id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE webhook_events e
                SET status = 'in_progress',
                    attempt_count = e.attempt_count + 1,
                    claimed_at = $1,
                    updated_at = $1
                FROM due
                WHERE e.id = due.id
                RETURNING e.*
                "#,
                &[&now, &(limit as i64)],
            )
            .await?;

        let mut events = collect(&rows, row_to_event)?;
        events.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn claim_event(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE webhook_events
                SET status = 'in_progress',
                    attempt_count = attempt_count + 1,
                    claimed_at = $2,
                    updated_at = $2
                WHERE id = $1 AND status = 'pending'
                RETURNING *
                "#,
                &[&id, &now],
            )
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn insert_attempt(
        &self,
        attempt: &NewAttempt,
        now: DateTime<Utc>,
    ) -> Result<WebhookEventAttempt, DatabaseError> {
        let conn = self.conn().await?;
        let request_headers = serde_json::to_value(&attempt.request_headers)?;
        let response_headers = serde_json::to_value(&attempt.response_headers)?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO webhook_event_attempts
                    (event_id, attempt_number, status, response_status, request_headers, request_body,
                     response_headers, response_body, error_message, attempted_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING *
                "#,
                &[
                    &attempt.event_id,
                    &attempt.attempt_number,
                    &attempt.status.as_str(),
                    &attempt.response_status,
                    &request_headers,
                    &attempt.request_body,
                    &response_headers,
                    &attempt.response_body,
                    &attempt.error_message,
                    &now,
                ],
            )
            .await?;
        row_to_attempt(&row)
    }

    async fn list_attempts(
        &self,
        event_id: i64,
    ) -> Result<Vec<WebhookEventAttempt>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM webhook_event_attempts WHERE event_id = $1 ORDER BY attempt_number, id",
                &[&event_id],
            )
            .await?;
        collect(&rows, row_to_attempt)
    }

    async fn finish_event(
        &self,
        id: i64,
        attempt_number: i32,
        outcome: &EventOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE webhook_events
                SET status = $3,
                    next_attempt_at = COALESCE($4, next_attempt_at),
                    claimed_at = NULL,
                    last_error = $5,
                    response_status = $6,
                    response_body = $7,
                    updated_at = $8
                WHERE id = $1 AND status = 'in_progress' AND attempt_count = $2
                RETURNING *
                "#,
                &[
                    &id,
                    &attempt_number,
                    &outcome.status.as_str(),
                    &outcome.next_attempt_at,
                    &outcome.last_error,
                    &outcome.response_status,
                    &outcome.response_body,
                    &now,
                ],
            )
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn requeue_event(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE webhook_events
                SET status = 'pending',
                    next_attempt_at = $2,
                    claimed_at = NULL,
                    max_attempts = GREATEST(max_attempts, attempt_count + 1),
                    updated_at = $2
                WHERE id = $1 AND status IN ('failed', 'succeeded')
                RETURNING *
                "#,
                &[&id, &now],
            )
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn delete_event(&self, id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "DELETE FROM webhook_events WHERE id = $1 AND status <> 'in_progress'",
                &[&id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn purge_events(
        &self,
        status: EventStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "DELETE FROM webhook_events WHERE status = $1 AND updated_at < $2",
                &[&status.as_str(), &updated_before],
            )
            .await?;
        Ok(n)
    }

    async fn reap_stuck_events(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // Claims that never recorded an attempt are undone.
        let undone = tx
            .execute(
                r#"
                UPDATE webhook_events e
                SET status = 'pending',
                    attempt_count = GREATEST(e.attempt_count - 1, 0),
                    claimed_at = NULL,
                    next_attempt_at = $2,
                    updated_at = $2
                WHERE e.status = 'in_progress'
                  AND e.claimed_at < $1
                  AND NOT EXISTS (
                      SELECT 1 FROM webhook_event_attempts a
                      WHERE a.event_id = e.id AND a.attempt_number = e.attempt_count
                  )
                "#,
                &[&claimed_before, &now],
            )
            .await?;

        // The rest recorded their attempt but never finished.
        let settled = tx
            .execute(
                r#"
                UPDATE webhook_events
                SET status = CASE WHEN attempt_count < max_attempts THEN 'pending' ELSE 'failed' END,
                    next_attempt_at = CASE WHEN attempt_count < max_attempts THEN $2 ELSE next_attempt_at END,
                    claimed_at = NULL,
                    last_error = $3,
                    updated_at = $2
                WHERE status = 'in_progress' AND claimed_at < $1
                "#,
                &[&claimed_before, &now, &ABANDONED],
            )
            .await?;

        tx.commit().await?;
        Ok(undone + settled)
    }

    // ==================== Modules ====================

    async fn get_module(&self, slug: &str) -> Result<Option<ModuleConfig>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM integration_modules WHERE slug = $1", &[&slug])
            .await?;
        Ok(row.as_ref().map(row_to_module))
    }

    async fn list_modules(&self) -> Result<Vec<ModuleConfig>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query("SELECT * FROM integration_modules ORDER BY slug", &[])
            .await?;
        Ok(rows.iter().map(row_to_module).collect())
    }

    async fn upsert_module(
        &self,
        slug: &str,
        update: &ModuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<ModuleConfig, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO integration_modules (slug, name, enabled, settings, updated_at)
                VALUES ($1, COALESCE($2, $1), COALESCE($3, FALSE), COALESCE($4, '{}'::jsonb), $5)
                ON CONFLICT (slug) DO UPDATE SET
                    name = COALESCE($2, integration_modules.name),
                    enabled = COALESCE($3, integration_modules.enabled),
                    settings = COALESCE($4, integration_modules.settings),
                    updated_at = $5
                RETURNING *
                "#,
                &[&slug, &update.name, &update.enabled, &update.settings, &now],
            )
            .await?;
        Ok(row_to_module(&row))
    }

    // ==================== Compliance ====================

    async fn insert_missing_compliance_checks(
        &self,
        company_id: i64,
        checks: &[ComplianceTemplate],
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let mut inserted = 0;
        for check in checks {
            inserted += tx
                .execute(
                    r#"
                    INSERT INTO company_compliance_checks (company_id, check_key, title, status, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (company_id, check_key) DO NOTHING
                    "#,
                    &[&company_id, &check.key, &check.title, &INITIAL_STATUS, &now],
                )
                .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_compliance_checks(
        &self,
        company_id: i64,
    ) -> Result<Vec<ComplianceCheck>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT company_id, check_key, title, status, created_at FROM company_compliance_checks WHERE company_id = $1 ORDER BY id",
                &[&company_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ComplianceCheck {
                company_id: row.get("company_id"),
                check_key: row.get("check_key"),
                title: row.get("title"),
                status: row.get("status"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

// ==================== Advisory locks ====================

#[async_trait]
impl LockManager for PgStore {
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, DatabaseError> {
        // Session-level locks belong to the connection, so it is held with
        // the guard.
        let deadline = tokio::time::Instant::now() + timeout;
        let conn = match tokio::time::timeout_at(deadline, self.lock_pool.get()).await {
            Ok(conn) => conn?,
            Err(_) => {
                tracing::debug!(lock = %name, "No lock connection free, treating as contended");
                return Ok(None);
            }
        };

        loop {
            let row = conn
                .query_one("SELECT pg_try_advisory_lock(hashtext($1))", &[&name])
                .await?;
            if row.get::<_, bool>(0) {
                tracing::debug!(lock = %name, "Advisory lock acquired");
                let held = PgLock {
                    name: name.to_string(),
                    conn,
                };
                return Ok(Some(LockGuard::new(name, Box::new(held))));
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(lock = %name, "Advisory lock contended");
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

struct PgLock {
    name: String,
    conn: deadpool_postgres::Object,
}

#[async_trait]
impl LockRelease for PgLock {
    async fn release(self: Box<Self>) -> Result<(), DatabaseError> {
        let row = self
            .conn
            .query_one("SELECT pg_advisory_unlock(hashtext($1))", &[&self.name])
            .await?;
        if !row.get::<_, bool>(0) {
            tracing::warn!(lock = %self.name, "Advisory lock was not held at release");
        }
        Ok(())
    }
}
