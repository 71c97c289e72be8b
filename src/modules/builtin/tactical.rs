//! Tactical RMM agent commands.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::json;

use super::{http_call, join_url};
use crate::error::ModuleError;
use crate::modules::config::ModuleConfig;
use crate::modules::module::{Module, ModuleResponse, PreparedCall, require_setting, require_str};

const DEFAULT_COMMAND_TIMEOUT: u64 = 30;

/// Runs a shell command on an agent. Settings: `base_url`, `api_key`.
/// Payload: `agent_id`, `command`, optional `shell` and `timeout`.
pub struct TacticalRmmModule {
    client: Client,
}

impl TacticalRmmModule {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Module for TacticalRmmModule {
    fn slug(&self) -> &str {
        "tactical-rmm"
    }

    fn description(&self) -> &str {
        "Run a command on a Tactical RMM agent"
    }

    fn prepare(
        &self,
        config: &ModuleConfig,
        payload: &serde_json::Value,
    ) -> Result<PreparedCall, ModuleError> {
        let base = require_setting(config, "base_url")?;
        require_setting(config, "api_key")?;
        let agent_id = require_str(payload, "agent_id")?;
        let command = require_str(payload, "command")?;
        let shell = payload.get("shell").and_then(|v| v.as_str()).unwrap_or("cmd");
        if !matches!(shell, "cmd" | "powershell" | "shell") {
            return Err(ModuleError::Validation(format!("unsupported shell '{shell}'")));
        }
        let timeout = payload
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let body = json!({
            "shell": shell,
            "cmd": command,
            "timeout": timeout,
            "run_as_user": false,
        });
        Ok(PreparedCall::new(
            join_url(base, &format!("agents/{agent_id}/cmd/")),
            body,
        ))
    }

    async fn execute(
        &self,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError> {
        // The key is never stored on the event.
        let mut call = call.clone();
        call.headers
            .insert("X-API-KEY".into(), require_setting(config, "api_key")?.into());
        http_call(&self.client, Method::POST, &call, config.timeout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_prepare_builds_agent_command() {
        let config = ModuleConfig {
            slug: "tactical-rmm".into(),
            name: "Tactical RMM".into(),
            enabled: true,
            settings: json!({"base_url": "https://api.rmm.example.com/", "api_key": "k"}),
            updated_at: Utc::now(),
        };
        let module = TacticalRmmModule::new(Client::new());
        let call = module
            .prepare(&config, &json!({"agent_id": "abc", "command": "ipconfig"}))
            .unwrap();
        assert_eq!(call.target, "https://api.rmm.example.com/agents/abc/cmd/");
        assert!(call.headers.is_empty());
        assert_eq!(call.body["shell"], "cmd");

        assert!(
            module
                .prepare(&config, &json!({"agent_id": "abc", "command": "x", "shell": "zsh"}))
                .is_err()
        );
    }
}
