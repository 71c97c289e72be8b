//! Generic outbound HTTP.

use async_trait::async_trait;
use reqwest::{Client, Method};

use super::http_call;
use crate::error::ModuleError;
use crate::modules::config::ModuleConfig;
use crate::modules::module::{Module, ModuleResponse, PreparedCall};

/// Sends the payload as JSON to a URL.
///
/// The URL comes from the payload's `url` or the `url` setting. When the
/// payload carries `body`, only that is sent; otherwise the whole payload
/// (minus routing keys) is. Payload `headers` are merged over the configured
/// ones. The HTTP method is the `method` setting, `POST` by default.
pub struct WebhookModule {
    client: Client,
}

impl WebhookModule {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn method(config: &ModuleConfig) -> Result<Method, ModuleError> {
        let raw = config.str_setting("method").unwrap_or("POST");
        raw.to_ascii_uppercase()
            .parse::<Method>()
            .map_err(|_| ModuleError::Validation(format!("unsupported method '{raw}'")))
    }
}

fn string_map(value: Option<&serde_json::Value>) -> impl Iterator<Item = (String, String)> + '_ {
    value
        .and_then(|v| v.as_object())
        .into_iter()
        .flat_map(|m| m.iter())
        .filter_map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => return None,
                other => other.to_string(),
            };
            Some((k.clone(), v))
        })
}

#[async_trait]
impl Module for WebhookModule {
    fn slug(&self) -> &str {
        "webhook"
    }

    fn description(&self) -> &str {
        "POST a JSON payload to an HTTP endpoint"
    }

    fn prepare(
        &self,
        config: &ModuleConfig,
        payload: &serde_json::Value,
    ) -> Result<PreparedCall, ModuleError> {
        Self::method(config)?;
        let url = payload
            .get("url")
            .and_then(|v| v.as_str())
            .or_else(|| config.str_setting("url"))
            .ok_or_else(|| ModuleError::Validation("'url' is required".into()))?;
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ModuleError::Validation(format!("invalid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ModuleError::Validation("only http(s) URLs are allowed".into()));
        }

        let body = match payload.get("body") {
            Some(body) => body.clone(),
            None => {
                let mut body = payload.clone();
                if let Some(map) = body.as_object_mut() {
                    map.remove("url");
                    map.remove("headers");
                }
                body
            }
        };

        let mut call = PreparedCall::new(parsed.to_string(), body);
        call.headers.extend(string_map(config.settings.get("headers")));
        call.headers.extend(string_map(payload.get("headers")));
        Ok(call)
    }

    async fn execute(
        &self,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError> {
        http_call(&self.client, Self::method(config)?, call, config.timeout()).await
    }
}
