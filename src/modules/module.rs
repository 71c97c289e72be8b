//! Module trait and call types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::config::ModuleConfig;
use crate::error::ModuleError;
use crate::monitor::Headers;

/// The canonical request a module will perform. It is stored on the monitor
/// event so a failed call can be replayed without the original payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedCall {
    /// Canonical target, e.g. `https://…` or `smtp://host/recipient`.
    pub target: String,
    pub headers: Headers,
    pub body: serde_json::Value,
}

impl PreparedCall {
    pub fn new(target: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            target: target.into(),
            headers: Headers::new(),
            body,
        }
    }
}

/// What a successful call returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResponse {
    pub status: Option<u16>,
    pub body: serde_json::Value,
}

impl ModuleResponse {
    pub fn new(body: serde_json::Value) -> Self {
        Self { status: None, body }
    }

    pub fn http(status: u16, body: serde_json::Value) -> Self {
        Self {
            status: Some(status),
            body,
        }
    }

    /// Body as stored in the attempt log.
    pub fn body_text(&self) -> String {
        match &self.body {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// An integration endpoint the dispatcher can call.
#[async_trait]
pub trait Module: Send + Sync {
    /// Slug the module is registered and configured under.
    fn slug(&self) -> &str;

    fn description(&self) -> &str;

    /// Validate the payload against the settings and build the request.
    fn prepare(
        &self,
        config: &ModuleConfig,
        payload: &serde_json::Value,
    ) -> Result<PreparedCall, ModuleError>;

    /// Perform the side effect.
    async fn execute(
        &self,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError>;
}

/// A required string field from a payload object.
pub(crate) fn require_str<'a>(payload: &'a serde_json::Value, key: &str) -> Result<&'a str, ModuleError> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ModuleError::Validation(format!("'{key}' is required")))
}

/// A required setting.
pub(crate) fn require_setting<'a>(config: &'a ModuleConfig, key: &str) -> Result<&'a str, ModuleError> {
    config
        .str_setting(key)
        .ok_or_else(|| ModuleError::ConfigurationMissing(format!("{} ({key})", config.slug)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_str_rejects_blank() {
        let payload = json!({"subject": "  ", "to": "a@b.c"});
        assert!(require_str(&payload, "subject").is_err());
        assert!(require_str(&payload, "missing").is_err());
        assert_eq!(require_str(&payload, "to").unwrap(), "a@b.c");
    }

    #[test]
    fn test_body_text() {
        assert_eq!(ModuleResponse::new(json!("plain")).body_text(), "plain");
        assert_eq!(ModuleResponse::new(json!({"ok": true})).body_text(), r#"{"ok":true}"#);
    }
}
