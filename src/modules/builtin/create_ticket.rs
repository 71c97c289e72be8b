//! Open a helpdesk ticket.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::collaborators::{CollaboratorError, NewTicket, TicketService};
use crate::error::ModuleError;
use crate::modules::config::ModuleConfig;
use crate::modules::module::{Module, ModuleResponse, PreparedCall};

pub struct CreateTicketModule {
    tickets: Arc<dyn TicketService>,
}

impl CreateTicketModule {
    pub fn new(tickets: Arc<dyn TicketService>) -> Self {
        Self { tickets }
    }

    fn ticket(config: &ModuleConfig, payload: &serde_json::Value) -> Result<NewTicket, ModuleError> {
        let mut ticket: NewTicket = serde_json::from_value(payload.clone())
            .map_err(|e| ModuleError::Validation(format!("invalid ticket: {e}")))?;
        if ticket.subject.trim().is_empty() {
            return Err(ModuleError::Validation("'subject' is required".into()));
        }
        if ticket.priority.is_none() {
            ticket.priority = config.str_setting("default_priority").map(String::from);
        }
        if ticket.source.is_none() {
            ticket.source = Some("automation".to_string());
        }
        Ok(ticket)
    }
}

impl From<CollaboratorError> for ModuleError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::NotConfigured(what) => ModuleError::ConfigurationMissing(what),
            CollaboratorError::Validation(reason) => ModuleError::Validation(reason),
            CollaboratorError::Failed(reason) => ModuleError::Collaborator(reason),
        }
    }
}

#[async_trait]
impl Module for CreateTicketModule {
    fn slug(&self) -> &str {
        "create-ticket"
    }

    fn description(&self) -> &str {
        "Create a ticket for a company"
    }

    fn prepare(
        &self,
        config: &ModuleConfig,
        payload: &serde_json::Value,
    ) -> Result<PreparedCall, ModuleError> {
        let ticket = Self::ticket(config, payload)?;
        let body = serde_json::to_value(&ticket)
            .map_err(|e| ModuleError::Validation(e.to_string()))?;
        Ok(PreparedCall::new(
            format!("ticket://companies/{}", ticket.company_id),
            body,
        ))
    }

    async fn execute(
        &self,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError> {
        let ticket = Self::ticket(config, &call.body)?;
        let created = self.tickets.create_ticket(ticket).await?;
        tracing::info!(ticket_id = created.id, "Ticket created by module");
        Ok(ModuleResponse::new(json!({"ticket_id": created.id})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{TicketRef, Unconfigured};
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        created: Mutex<Vec<NewTicket>>,
    }

    #[async_trait]
    impl TicketService for Recorder {
        async fn create_ticket(&self, ticket: NewTicket) -> Result<TicketRef, CollaboratorError> {
            let mut created = self.created.lock().unwrap();
            created.push(ticket);
            Ok(TicketRef { id: created.len() as i64 + 100 })
        }
    }

    fn config() -> ModuleConfig {
        ModuleConfig {
            slug: "create-ticket".into(),
            name: "Create ticket".into(),
            enabled: true,
            settings: json!({"default_priority": "normal"}),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_creates_ticket_with_defaults() {
        let recorder = Arc::new(Recorder::default());
        let module = CreateTicketModule::new(recorder.clone());
        let call = module
            .prepare(&config(), &json!({"company_id": 7, "subject": "Backup failed"}))
            .unwrap();
        assert_eq!(call.target, "ticket://companies/7");

        let response = module.execute(&config(), &call).await.unwrap();
        assert_eq!(response.body, json!({"ticket_id": 101}));
        let created = recorder.created.lock().unwrap();
        assert_eq!(created[0].priority.as_deref(), Some("normal"));
        assert_eq!(created[0].source.as_deref(), Some("automation"));
    }

    #[tokio::test]
    async fn test_unconfigured_service_is_configuration_missing() {
        let module = CreateTicketModule::new(Arc::new(Unconfigured));
        let call = module
            .prepare(&config(), &json!({"company_id": 7, "subject": "x"}))
            .unwrap();
        assert!(matches!(
            module.execute(&config(), &call).await,
            Err(ModuleError::ConfigurationMissing(_))
        ));
        assert!(module.prepare(&config(), &json!({"subject": "no company"})).is_err());
    }
}
