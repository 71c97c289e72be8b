//! Text completion through an Ollama server.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::json;

use super::{http_call, join_url};
use crate::error::ModuleError;
use crate::modules::config::ModuleConfig;
use crate::modules::module::{Module, ModuleResponse, PreparedCall, require_str};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3";

/// Completions are slow; callers usually dispatch this in the background and
/// pick the answer up from the completion callback.
pub struct OllamaModule {
    client: Client,
}

impl OllamaModule {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Module for OllamaModule {
    fn slug(&self) -> &str {
        "ollama"
    }

    fn description(&self) -> &str {
        "Generate a completion with a local language model"
    }

    fn prepare(
        &self,
        config: &ModuleConfig,
        payload: &serde_json::Value,
    ) -> Result<PreparedCall, ModuleError> {
        let base = config.str_setting("base_url").unwrap_or(DEFAULT_BASE_URL);
        let prompt = require_str(payload, "prompt")?;
        let model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .or_else(|| config.str_setting("model"))
            .unwrap_or(DEFAULT_MODEL);

        let mut body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(system) = payload.get("system").and_then(|v| v.as_str()) {
            body["system"] = json!(system);
        }
        if let Some(options) = payload.get("options").filter(|o| o.is_object()) {
            body["options"] = options.clone();
        }
        Ok(PreparedCall::new(join_url(base, "api/generate"), body))
    }

    async fn execute(
        &self,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError> {
        let response = http_call(&self.client, Method::POST, call, config.timeout()).await?;
        let text = response
            .body
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ModuleError::Collaborator("completion missing 'response'".into()))?;
        Ok(ModuleResponse {
            status: response.status,
            body: json!({
                "response": text,
                "model": response.body.get("model").cloned().unwrap_or_default(),
            }),
        })
    }
}
