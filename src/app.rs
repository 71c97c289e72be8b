//! Service wiring.
//!
//! [`App`] owns every long-lived service and hands them to each other
//! explicitly; nothing is a process global.

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;

use crate::api::{self, ApiState};
use crate::automation::AutomationEngine;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::db::memory::MemoryStore;
use crate::db::postgres::PgStore;
use crate::db::{Database, LockManager};
use crate::error::{DatabaseError, StartupError};
use crate::integrations::{SyncroClient, SyncroImporter, TicketSource};
use crate::modules::ModuleDispatcher;
use crate::modules::builtin::builtin_modules;
use crate::monitor::EventMonitor;
use crate::refresh::{PgNotifyTransport, RefreshBus};
use crate::scheduler::{CommandDeps, CommandRegistry, Scheduler};

pub struct App {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub db: Arc<dyn Database>,
    pub locks: Arc<dyn LockManager>,
    pub monitor: Arc<EventMonitor>,
    pub refresh: Arc<RefreshBus>,
    pub dispatcher: Arc<ModuleDispatcher>,
    pub automations: Arc<AutomationEngine>,
    pub syncro: Arc<SyncroImporter>,
    pub scheduler: Arc<Scheduler>,
    postgres: Option<Arc<PgStore>>,
}

impl App {
    /// Connect storage and wire the services. Migrations are not run here.
    pub async fn build(config: Config, collaborators: Collaborators) -> Result<Self, StartupError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (db, locks, postgres, refresh): (Arc<dyn Database>, Arc<dyn LockManager>, _, _) =
            match &config.database {
                Some(database) => {
                    let store = Arc::new(PgStore::new(database).await?);
                    let transport = PgNotifyTransport::new(
                        store.pool(),
                        database.url.clone(),
                        config.refresh.channel.clone(),
                    )?;
                    let refresh = RefreshBus::new(clock.clone(), config.refresh.node_id.clone())
                        .with_peer(Arc::new(transport));
                    (store.clone(), store.clone(), Some(store), refresh)
                }
                None => {
                    tracing::warn!("DATABASE_URL not set; using the in-memory store");
                    let store = Arc::new(MemoryStore::new());
                    let refresh = RefreshBus::new(clock.clone(), config.refresh.node_id.clone());
                    (store.clone(), store, None, refresh)
                }
            };
        let refresh = Arc::new(refresh);

        let monitor = Arc::new(EventMonitor::new(db.clone(), clock.clone()));

        let dispatcher = Arc::new(
            ModuleDispatcher::new(db.clone(), clock.clone(), monitor.clone())
                .with_cluster_nodes(config.cluster_nodes)
                .with_modules(builtin_modules(&collaborators)),
        );
        dispatcher.attach().await;

        let automations = Arc::new(
            AutomationEngine::new(
                db.clone(),
                locks.clone(),
                clock.clone(),
                dispatcher.clone(),
                refresh.clone(),
            )
            .with_lock_timeout(config.scheduler.lock_timeout),
        );

        let source = SyncroClient::from_config(&config.syncro)
            .map(|client| Arc::new(client) as Arc<dyn TicketSource>);
        let syncro = Arc::new(SyncroImporter::new(
            source,
            monitor.clone(),
            collaborators.companies.clone(),
            collaborators.ticket_store.clone(),
            refresh.clone(),
        ));

        let commands = CommandRegistry::standard(CommandDeps {
            collaborators,
            dispatcher: Some(dispatcher.clone()),
            syncro: Some(syncro.clone()),
            system_update_script: config.scheduler.system_update_script.clone(),
        });
        let scheduler = Arc::new(
            Scheduler::new(
                db.clone(),
                locks.clone(),
                clock.clone(),
                monitor.clone(),
                refresh.clone(),
                commands,
                config.scheduler.clone(),
            )
            .with_automations(automations.clone()),
        );

        Ok(Self {
            config,
            clock,
            db,
            locks,
            monitor,
            refresh,
            dispatcher,
            automations,
            syncro,
            scheduler,
            postgres,
        })
    }

    /// Apply pending migrations. A no-op for the in-memory store.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match &self.postgres {
            Some(store) => store.run_migrations().await,
            None => Ok(()),
        }
    }

    pub fn router(&self) -> Router {
        api::routes(ApiState {
            db: self.db.clone(),
            clock: self.clock.clone(),
            scheduler: self.scheduler.clone(),
            monitor: self.monitor.clone(),
            automations: self.automations.clone(),
            refresh: self.refresh.clone(),
        })
    }

    /// Start the scheduler and the cross-node refresh listener.
    pub async fn start_background(&self) -> Option<JoinHandle<()>> {
        self.scheduler.start().await;
        if let Err(e) = self.automations.refresh_all_schedules().await {
            tracing::error!(error = %e, "Failed to refresh automation schedules");
        }
        match self.refresh.spawn_listener().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "Refresh listener unavailable; broadcasts stay local");
                None
            }
        }
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.automations.shutdown().await;
    }
}
