//! Outbound email over SMTP.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;

use crate::error::ModuleError;
use crate::modules::config::ModuleConfig;
use crate::modules::module::{Module, ModuleResponse, PreparedCall, require_setting, require_str};

const DEFAULT_PORT: u16 = 587;

/// Settings: `host`, `port`, `username`, `password`, `from`, and `security`
/// (`starttls` default, `tls`, or `none`). Payload: `to` (string or list),
/// `subject`, `body`, optional `html`.
pub struct SmtpModule;

impl SmtpModule {
    pub fn new() -> Self {
        Self
    }

    fn recipients(payload: &serde_json::Value) -> Result<Vec<String>, ModuleError> {
        let to: Vec<String> = match payload.get("to") {
            Some(serde_json::Value::String(s)) => s
                .split([',', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };
        if to.is_empty() {
            return Err(ModuleError::Validation("'to' is required".into()));
        }
        for address in &to {
            address
                .parse::<Mailbox>()
                .map_err(|e| ModuleError::Validation(format!("invalid recipient {address}: {e}")))?;
        }
        Ok(to)
    }

    fn message(config: &ModuleConfig, call: &PreparedCall) -> Result<Message, ModuleError> {
        let from: Mailbox = require_setting(config, "from")?
            .parse()
            .map_err(|e| ModuleError::Validation(format!("invalid sender: {e}")))?;
        let subject = require_str(&call.body, "subject")?;
        let text = call.body.get("body").and_then(|v| v.as_str()).unwrap_or_default();

        let mut builder = Message::builder().from(from).subject(subject);
        for address in Self::recipients(&call.body)? {
            let mailbox: Mailbox = address
                .parse()
                .map_err(|e| ModuleError::Validation(format!("invalid recipient: {e}")))?;
            builder = builder.to(mailbox);
        }

        let built = match call.body.get("html").and_then(|v| v.as_str()) {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                text.to_string(),
                html.to_string(),
            )),
            None => builder.header(ContentType::TEXT_PLAIN).body(text.to_string()),
        };
        built.map_err(|e| ModuleError::Validation(format!("build email: {e}")))
    }

    fn transport(config: &ModuleConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, ModuleError> {
        let host = require_setting(config, "host")?;
        let port = config
            .str_setting("port")
            .and_then(|p| p.parse().ok())
            .or_else(|| config.settings.get("port").and_then(|p| p.as_u64()).map(|p| p as u16))
            .unwrap_or(DEFAULT_PORT);

        let builder = match config.str_setting("security").unwrap_or("starttls") {
            "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| ModuleError::Transport(format!("SMTP relay: {e}")))?,
            _ => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| ModuleError::Transport(format!("SMTP relay: {e}")))?,
        };
        let mut builder = builder.port(port).timeout(Some(config.timeout()));

        if let (Some(user), Some(password)) =
            (config.str_setting("username"), config.str_setting("password"))
        {
            builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
        }
        Ok(builder.build())
    }
}

impl Default for SmtpModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for SmtpModule {
    fn slug(&self) -> &str {
        "smtp"
    }

    fn description(&self) -> &str {
        "Send an email through the configured SMTP relay"
    }

    fn prepare(
        &self,
        config: &ModuleConfig,
        payload: &serde_json::Value,
    ) -> Result<PreparedCall, ModuleError> {
        let host = require_setting(config, "host")?;
        require_setting(config, "from")?;
        let to = Self::recipients(payload)?;
        let subject = require_str(payload, "subject")?;

        let mut body = json!({
            "to": to,
            "subject": subject,
            "body": payload.get("body").and_then(|v| v.as_str()).unwrap_or_default(),
        });
        if let Some(html) = payload.get("html").and_then(|v| v.as_str()) {
            body["html"] = json!(html);
        }
        Ok(PreparedCall::new(format!("smtp://{host}/{}", to.join(",")), body))
    }

    async fn execute(
        &self,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError> {
        let message = Self::message(config, call)?;
        let response = Self::transport(config)?
            .send(message)
            .await
            .map_err(|e| ModuleError::Transport(format!("SMTP send: {e}")))?;

        let recipients = call.body.get("to").cloned().unwrap_or_default();
        tracing::info!(recipients = %recipients, "Email sent");
        Ok(ModuleResponse::new(json!({
            "sent_to": recipients,
            "code": response.code().to_string(),
        })))
    }
}
