//! Error types for the automation substrate.

use std::time::Duration;

use crate::monitor::EventStatus;

/// Errors raised by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid stored value in {column}: {reason}")]
    InvalidValue { column: &'static str, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(err.to_string())
    }
}

/// Errors from crontab parsing and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Cron expression '{0}' never fires")]
    NoUpcomingFire(String),
}

/// Errors from the webhook/integration event monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Webhook event {0} not found")]
    NotFound(i64),

    #[error("Webhook event {id} is {status}; operation not allowed")]
    Conflict { id: i64, status: EventStatus },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from the task scheduler's public operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduled task {0} not found")]
    TaskNotFound(i64),

    #[error(transparent)]
    InvalidCron(#[from] CronError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from the automation engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Automation {0} not found")]
    NotFound(i64),

    #[error("Invalid automation definition: {0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Failure of a single module side effect.
///
/// The variant decides how the dispatcher records the attempt: configuration
/// problems skip the call, transport and protocol failures are retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModuleError {
    #[error("Module {0} is not configured")]
    ConfigurationMissing(String),

    #[error("Invalid module payload: {0}")]
    Validation(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Remote returned HTTP {status}")]
    Protocol { status: u16, body: String },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Collaborator failed: {0}")]
    Collaborator(String),
}

impl ModuleError {
    /// Whether the monitor should schedule another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ModuleError::Transport(_)
                | ModuleError::Protocol { .. }
                | ModuleError::Timeout(_)
                | ModuleError::Collaborator(_)
        )
    }
}

impl From<reqwest::Error> for ModuleError {
    fn from(err: reqwest::Error) -> Self {
        ModuleError::Transport(err.to_string())
    }
}

/// Infrastructure errors surfaced by the module dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from the realtime refresh bus.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Sink delivery failed: {0}")]
    Sink(String),

    #[error("Peer transport error: {0}")]
    Transport(String),

    #[error("Envelope encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from vendor import pipelines.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Importer is not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Vendor returned HTTP {status}")]
    Protocol { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: i32, last_error: String },

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Collaborator(#[from] crate::collaborators::CollaboratorError),
}

/// Failures while wiring the service together.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

/// Configuration errors raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}
