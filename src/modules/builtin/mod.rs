//! Modules shipped with the service.

mod create_ticket;
mod ollama;
mod smtp;
mod tactical;
mod unifi_talk;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};

pub use create_ticket::CreateTicketModule;
pub use ollama::OllamaModule;
pub use smtp::SmtpModule;
pub use tactical::TacticalRmmModule;
pub use unifi_talk::UnifiTalkModule;
pub use webhook::WebhookModule;

use super::module::{Module, ModuleResponse, PreparedCall};
use crate::collaborators::Collaborators;
use crate::error::ModuleError;
use crate::monitor::delivery::exchange;

/// Every built-in module, sharing one HTTP client.
pub fn builtin_modules(collaborators: &Collaborators) -> Vec<Arc<dyn Module>> {
    let client = http_client();
    vec![
        Arc::new(WebhookModule::new(client.clone())),
        Arc::new(SmtpModule::new()),
        Arc::new(CreateTicketModule::new(Arc::clone(&collaborators.tickets))),
        Arc::new(TacticalRmmModule::new(client.clone())),
        Arc::new(UnifiTalkModule::new(client.clone())),
        Arc::new(OllamaModule::new(client)),
    ]
}

pub(crate) fn http_client() -> Client {
    Client::builder()
        .user_agent(concat!("msp-automation/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Perform `call` and map non-2xx answers to [`ModuleError::Protocol`].
pub(crate) async fn http_call(
    client: &Client,
    method: Method,
    call: &PreparedCall,
    timeout: Duration,
) -> Result<ModuleResponse, ModuleError> {
    let body = (method != Method::GET).then_some(&call.body);
    let response = exchange(client, method, &call.target, &call.headers, body, timeout).await?;
    if !response.is_success() {
        return Err(ModuleError::Protocol {
            status: response.status,
            body: response.body,
        });
    }
    Ok(ModuleResponse::http(response.status, response.json_body()))
}

/// Join a configured base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
