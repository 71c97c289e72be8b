//! Handlers behind a task's `command` string.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::task::{RunStatus, ScheduledTask};
use crate::collaborators::{CollaboratorError, Collaborators, NewTicket, Summary};
use crate::error::ImportError;
use crate::integrations::syncro::SyncroImporter;
use crate::modules::{DispatchStatus, ModuleDispatcher, TriggerOptions};

/// What a command reported.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub status: RunStatus,
    pub details: Option<String>,
}

impl CommandOutcome {
    pub fn succeeded(details: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Succeeded,
            details: Some(details.into()),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            details: Some(details.into()),
        }
    }

    pub fn skipped(details: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            details: Some(details.into()),
        }
    }

    fn from_summary(result: Result<Summary, CollaboratorError>) -> Self {
        match result {
            Ok(summary) => Self::succeeded(summary.to_string()),
            Err(e @ CollaboratorError::NotConfigured(_)) => Self::skipped(e.to_string()),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// Per-run inputs besides the task row.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// Text after `:` for prefixed commands such as `imap_sync:{id}`.
    pub argument: Option<String>,
    /// Set by manual runs of `system_update`.
    pub force_restart: bool,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, task: &ScheduledTask, ctx: &CommandContext) -> CommandOutcome;
}

/// Maps command names (or `name:` prefixes) to handlers.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    exact: Vec<(String, Arc<dyn CommandHandler>)>,
    prefixed: Vec<(String, Arc<dyn CommandHandler>)>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`; a trailing `:` registers a prefix taking an argument.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let name = name.into();
        if name.ends_with(':') {
            self.prefixed.push((name, handler));
        } else {
            self.exact.push((name, handler));
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.exact
            .iter()
            .chain(self.prefixed.iter())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    fn lookup(&self, command: &str) -> Option<(Arc<dyn CommandHandler>, Option<String>)> {
        let command = command.trim();
        if let Some((_, handler)) = self.exact.iter().find(|(n, _)| n == command) {
            return Some((Arc::clone(handler), None));
        }
        self.prefixed.iter().find_map(|(prefix, handler)| {
            command
                .strip_prefix(prefix.as_str())
                .map(|arg| (Arc::clone(handler), Some(arg.trim().to_string())))
        })
    }

    /// Run the handler for `task.command`. Unknown commands are skipped.
    pub async fn execute(&self, task: &ScheduledTask, force_restart: bool) -> CommandOutcome {
        let Some((handler, argument)) = self.lookup(&task.command) else {
            tracing::warn!(task_id = task.id, command = %task.command, "Unknown task command");
            return CommandOutcome::skipped(format!("Unknown command '{}'", task.command));
        };
        let ctx = CommandContext {
            argument,
            force_restart,
        };
        handler.run(task, &ctx).await
    }

    /// The service's standard command set.
    pub fn standard(deps: CommandDeps) -> Self {
        let collaborators = deps.collaborators;
        let mut registry = Self::new();
        for kind in [CompanySync::Staff, CompanySync::Assets, CompanySync::Licenses] {
            registry.register(
                kind.command(),
                Arc::new(CompanySyncCommand {
                    kind,
                    collaborators: collaborators.clone(),
                }),
            );
        }
        registry.register(
            "update_products",
            Arc::new(CatalogueCommand {
                stock_feed: false,
                collaborators: collaborators.clone(),
            }),
        );
        registry.register(
            "update_stock_feed",
            Arc::new(CatalogueCommand {
                stock_feed: true,
                collaborators: collaborators.clone(),
            }),
        );
        registry.register(
            "imap_sync:",
            Arc::new(ImapSyncCommand {
                collaborators: collaborators.clone(),
            }),
        );
        registry.register(
            "system_update",
            Arc::new(SystemUpdateCommand::new(deps.system_update_script)),
        );
        registry.register(
            "create_scheduled_ticket",
            Arc::new(ScheduledTicketCommand { collaborators }),
        );
        if let Some(dispatcher) = deps.dispatcher {
            registry.register(
                "sync_unifi_talk_recordings",
                Arc::new(ModuleCommand {
                    slug: "unifi-talk",
                    dispatcher,
                }),
            );
        }
        registry.register(
            "import_syncro_tickets",
            Arc::new(SyncroImportCommand {
                importer: deps.syncro,
            }),
        );
        registry
    }
}

/// What [`CommandRegistry::standard`] wires commands to.
#[derive(Clone, Default)]
pub struct CommandDeps {
    pub collaborators: Collaborators,
    pub dispatcher: Option<Arc<ModuleDispatcher>>,
    pub syncro: Option<Arc<SyncroImporter>>,
    pub system_update_script: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum CompanySync {
    Staff,
    Assets,
    Licenses,
}

impl CompanySync {
    fn command(&self) -> &'static str {
        match self {
            Self::Staff => "sync_staff",
            Self::Assets => "sync_assets",
            Self::Licenses => "sync_o365",
        }
    }
}

struct CompanySyncCommand {
    kind: CompanySync,
    collaborators: Collaborators,
}

#[async_trait]
impl CommandHandler for CompanySyncCommand {
    async fn run(&self, task: &ScheduledTask, _ctx: &CommandContext) -> CommandOutcome {
        let Some(company_id) = task.company_id else {
            return CommandOutcome::failed(format!("{} requires a company", self.kind.command()));
        };
        let result = match self.kind {
            CompanySync::Staff => self.collaborators.staff.import_contacts_for_company(company_id).await,
            CompanySync::Assets => self.collaborators.assets.import_assets_for_company(company_id).await,
            CompanySync::Licenses => self.collaborators.licenses.sync_company_licenses(company_id).await,
        };
        CommandOutcome::from_summary(result)
    }
}

struct CatalogueCommand {
    stock_feed: bool,
    collaborators: Collaborators,
}

#[async_trait]
impl CommandHandler for CatalogueCommand {
    async fn run(&self, _task: &ScheduledTask, _ctx: &CommandContext) -> CommandOutcome {
        let products = &self.collaborators.products;
        let result = if self.stock_feed {
            products.update_stock_feed().await
        } else {
            products.update_products().await
        };
        CommandOutcome::from_summary(result)
    }
}

struct ImapSyncCommand {
    collaborators: Collaborators,
}

#[async_trait]
impl CommandHandler for ImapSyncCommand {
    async fn run(&self, _task: &ScheduledTask, ctx: &CommandContext) -> CommandOutcome {
        let raw = ctx.argument.as_deref().unwrap_or_default();
        match raw.parse::<i64>() {
            Ok(account_id) => {
                CommandOutcome::from_summary(self.collaborators.mailboxes.sync_account(account_id).await)
            }
            Err(_) => CommandOutcome::failed(format!("Invalid mailbox account id '{raw}'")),
        }
    }
}

/// Runs the update script; one at a time per process.
struct SystemUpdateCommand {
    script: Option<PathBuf>,
    running: Mutex<()>,
}

impl SystemUpdateCommand {
    fn new(script: Option<PathBuf>) -> Self {
        Self {
            script,
            running: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CommandHandler for SystemUpdateCommand {
    async fn run(&self, _task: &ScheduledTask, ctx: &CommandContext) -> CommandOutcome {
        let Some(script) = &self.script else {
            return CommandOutcome::skipped("System update script is not configured");
        };
        let _guard = self.running.lock().await;
        tracing::info!(script = %script.display(), force_restart = ctx.force_restart, "Running system update");

        let output = tokio::process::Command::new(script)
            .env("FORCE_RESTART", if ctx.force_restart { "1" } else { "0" })
            .stdin(Stdio::null())
            .output()
            .await;
        let output = match output {
            Ok(output) => output,
            Err(e) => return CommandOutcome::failed(format!("Failed to start update script: {e}")),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let details = text.trim();

        if output.status.success() {
            CommandOutcome::succeeded(details)
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            CommandOutcome::failed(format!("Update script exited with {code}: {details}"))
        }
    }
}

/// `description` holds the ticket as a JSON object.
struct ScheduledTicketCommand {
    collaborators: Collaborators,
}

impl ScheduledTicketCommand {
    fn ticket(task: &ScheduledTask) -> Result<NewTicket, String> {
        let raw = task
            .description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or("Task description must hold the ticket definition")?;
        let mut spec: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(raw).map_err(|e| format!("Invalid ticket definition: {e}"))?;

        if !spec.contains_key("company_id") {
            let company_id = task.company_id.ok_or("Ticket definition has no company")?;
            spec.insert("company_id".into(), company_id.into());
        }
        let subject_ok = spec
            .get("subject")
            .and_then(|s| s.as_str())
            .is_some_and(|s| !s.trim().is_empty());
        if !subject_ok {
            return Err("Ticket definition has no subject".into());
        }
        spec.entry("source").or_insert_with(|| "scheduler".into());

        serde_json::from_value(serde_json::Value::Object(spec))
            .map_err(|e| format!("Invalid ticket definition: {e}"))
    }
}

#[async_trait]
impl CommandHandler for ScheduledTicketCommand {
    async fn run(&self, task: &ScheduledTask, _ctx: &CommandContext) -> CommandOutcome {
        let ticket = match Self::ticket(task) {
            Ok(ticket) => ticket,
            Err(reason) => return CommandOutcome::failed(reason),
        };
        match self.collaborators.tickets.create_ticket(ticket).await {
            Ok(created) => CommandOutcome::succeeded(format!("Created ticket {}", created.id)),
            Err(e @ CollaboratorError::NotConfigured(_)) => CommandOutcome::skipped(e.to_string()),
            Err(e) => CommandOutcome::failed(e.to_string()),
        }
    }
}

struct ModuleCommand {
    slug: &'static str,
    dispatcher: Arc<ModuleDispatcher>,
}

#[async_trait]
impl CommandHandler for ModuleCommand {
    async fn run(&self, _task: &ScheduledTask, _ctx: &CommandContext) -> CommandOutcome {
        let result = self
            .dispatcher
            .trigger(self.slug, serde_json::json!({}), TriggerOptions::default())
            .await;
        let details = serde_json::to_string(&result).unwrap_or_default();
        match result.status {
            DispatchStatus::Succeeded | DispatchStatus::Queued => CommandOutcome::succeeded(details),
            DispatchStatus::Skipped => CommandOutcome::skipped(details),
            DispatchStatus::Failed => CommandOutcome::failed(details),
        }
    }
}

struct SyncroImportCommand {
    importer: Option<Arc<SyncroImporter>>,
}

#[async_trait]
impl CommandHandler for SyncroImportCommand {
    async fn run(&self, _task: &ScheduledTask, _ctx: &CommandContext) -> CommandOutcome {
        let Some(importer) = &self.importer else {
            return CommandOutcome::skipped("Syncro importer is not configured");
        };
        match importer.import_tickets().await {
            Ok(summary) => CommandOutcome::succeeded(serde_json::to_string(&summary).unwrap_or_default()),
            Err(e @ ImportError::NotConfigured(_)) => CommandOutcome::skipped(e.to_string()),
            Err(e) => CommandOutcome::failed(e.to_string()),
        }
    }
}
