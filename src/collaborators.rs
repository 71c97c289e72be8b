//! Contracts with the business services that live outside the substrate.
//!
//! Scheduled commands, modules and importers call these traits. Anything the
//! deployment has not wired up is served by [`Unconfigured`], and runs treat
//! its [`CollaboratorError::NotConfigured`] as a skip rather than a failure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    Failed(String),
}

/// Free-form summary a collaborator returns for run details.
pub type Summary = serde_json::Value;

#[async_trait]
pub trait StaffImporter: Send + Sync {
    async fn import_contacts_for_company(&self, company_id: i64) -> Result<Summary, CollaboratorError>;
}

#[async_trait]
pub trait AssetImporter: Send + Sync {
    async fn import_assets_for_company(&self, company_id: i64) -> Result<Summary, CollaboratorError>;
}

#[async_trait]
pub trait LicenseSync: Send + Sync {
    async fn sync_company_licenses(&self, company_id: i64) -> Result<Summary, CollaboratorError>;
}

#[async_trait]
pub trait ProductCatalogue: Send + Sync {
    async fn update_products(&self) -> Result<Summary, CollaboratorError>;

    async fn update_stock_feed(&self) -> Result<Summary, CollaboratorError>;
}

#[async_trait]
pub trait MailboxSync: Send + Sync {
    async fn sync_account(&self, account_id: i64) -> Result<Summary, CollaboratorError>;
}

/// A ticket to open in the helpdesk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTicket {
    pub company_id: i64,
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub requester_email: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRef {
    pub id: i64,
}

#[async_trait]
pub trait TicketService: Send + Sync {
    async fn create_ticket(&self, ticket: NewTicket) -> Result<TicketRef, CollaboratorError>;
}

/// A ticket mirrored from an external helpdesk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTicket {
    /// `"{vendor}:{id}"`, unique per vendor record.
    pub external_reference: String,
    pub company_id: i64,
    pub subject: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub requester_email: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn upsert_external_ticket(
        &self,
        ticket: &ExternalTicket,
    ) -> Result<UpsertOutcome, CollaboratorError>;
}

#[async_trait]
pub trait CompanyDirectory: Send + Sync {
    async fn company_for_syncro_customer(
        &self,
        customer_id: i64,
    ) -> Result<Option<i64>, CollaboratorError>;
}

/// Stand-in for every collaborator the deployment has not provided.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

fn not_configured<T>(what: &str) -> Result<T, CollaboratorError> {
    Err(CollaboratorError::NotConfigured(what.to_string()))
}

#[async_trait]
impl StaffImporter for Unconfigured {
    async fn import_contacts_for_company(&self, _company_id: i64) -> Result<Summary, CollaboratorError> {
        not_configured("Staff importer")
    }
}

#[async_trait]
impl AssetImporter for Unconfigured {
    async fn import_assets_for_company(&self, _company_id: i64) -> Result<Summary, CollaboratorError> {
        not_configured("Asset importer")
    }
}

#[async_trait]
impl LicenseSync for Unconfigured {
    async fn sync_company_licenses(&self, _company_id: i64) -> Result<Summary, CollaboratorError> {
        not_configured("Microsoft 365 licence sync")
    }
}

#[async_trait]
impl ProductCatalogue for Unconfigured {
    async fn update_products(&self) -> Result<Summary, CollaboratorError> {
        not_configured("Product catalogue")
    }

    async fn update_stock_feed(&self) -> Result<Summary, CollaboratorError> {
        not_configured("Stock feed")
    }
}

#[async_trait]
impl MailboxSync for Unconfigured {
    async fn sync_account(&self, _account_id: i64) -> Result<Summary, CollaboratorError> {
        not_configured("Mailbox sync")
    }
}

#[async_trait]
impl TicketService for Unconfigured {
    async fn create_ticket(&self, _ticket: NewTicket) -> Result<TicketRef, CollaboratorError> {
        not_configured("Ticket service")
    }
}

#[async_trait]
impl TicketStore for Unconfigured {
    async fn upsert_external_ticket(
        &self,
        _ticket: &ExternalTicket,
    ) -> Result<UpsertOutcome, CollaboratorError> {
        not_configured("Ticket store")
    }
}

#[async_trait]
impl CompanyDirectory for Unconfigured {
    async fn company_for_syncro_customer(
        &self,
        _customer_id: i64,
    ) -> Result<Option<i64>, CollaboratorError> {
        not_configured("Company directory")
    }
}

/// The full set of collaborators handed to the scheduler and modules.
#[derive(Clone)]
pub struct Collaborators {
    pub staff: Arc<dyn StaffImporter>,
    pub assets: Arc<dyn AssetImporter>,
    pub licenses: Arc<dyn LicenseSync>,
    pub products: Arc<dyn ProductCatalogue>,
    pub mailboxes: Arc<dyn MailboxSync>,
    pub tickets: Arc<dyn TicketService>,
    pub ticket_store: Arc<dyn TicketStore>,
    pub companies: Arc<dyn CompanyDirectory>,
}

impl Collaborators {
    pub fn unconfigured() -> Self {
        let u = Arc::new(Unconfigured);
        Self {
            staff: u.clone(),
            assets: u.clone(),
            licenses: u.clone(),
            products: u.clone(),
            mailboxes: u.clone(),
            tickets: u.clone(),
            ticket_store: u.clone(),
            companies: u,
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::unconfigured()
    }
}
