//! UniFi Talk call recordings.

use async_trait::async_trait;
use reqwest::{Client, Method};

use super::{http_call, join_url};
use crate::error::ModuleError;
use crate::modules::config::ModuleConfig;
use crate::modules::module::{Module, ModuleResponse, PreparedCall, require_setting};

const DEFAULT_PAGE_SIZE: u64 = 100;

/// Lists recordings newer than `since` (payload, RFC 3339) from the Talk
/// console at the `base_url` setting, authenticated with `api_key`.
pub struct UnifiTalkModule {
    client: Client,
}

impl UnifiTalkModule {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Module for UnifiTalkModule {
    fn slug(&self) -> &str {
        "unifi-talk"
    }

    fn description(&self) -> &str {
        "Fetch new call recordings from UniFi Talk"
    }

    fn prepare(
        &self,
        config: &ModuleConfig,
        payload: &serde_json::Value,
    ) -> Result<PreparedCall, ModuleError> {
        let base = require_setting(config, "base_url")?;
        require_setting(config, "api_key")?;

        let limit = payload
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, 1000);
        let mut target = format!(
            "{}?limit={limit}",
            join_url(base, "proxy/talk/api/recordings")
        );
        if let Some(since) = payload.get("since").and_then(|v| v.as_str()) {
            chrono::DateTime::parse_from_rfc3339(since)
                .map_err(|e| ModuleError::Validation(format!("invalid 'since': {e}")))?;
            target.push_str(&format!("&since={}", urlencoding::encode(since)));
        }
        Ok(PreparedCall::new(target, payload.clone()))
    }

    async fn execute(
        &self,
        config: &ModuleConfig,
        call: &PreparedCall,
    ) -> Result<ModuleResponse, ModuleError> {
        let mut call = call.clone();
        call.headers.insert(
            "Authorization".into(),
            format!("Bearer {}", require_setting(config, "api_key")?),
        );
        let response = http_call(&self.client, Method::GET, &call, config.timeout()).await?;
        let count = response
            .body
            .get("data")
            .or(Some(&response.body))
            .and_then(|v| v.as_array())
            .map(Vec::len)
            .unwrap_or(0);
        tracing::info!(recordings = count, "Fetched UniFi Talk recordings");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn config() -> ModuleConfig {
        ModuleConfig {
            slug: "unifi-talk".into(),
            name: "UniFi Talk".into(),
            enabled: true,
            settings: json!({"base_url": "https://talk.local", "api_key": "secret"}),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_prepare_builds_query() {
        let module = UnifiTalkModule::new(Client::new());
        let call = module
            .prepare(&config(), &json!({"since": "2025-01-01T00:00:00+00:00", "limit": 5}))
            .unwrap();
        assert_eq!(
            call.target,
            "https://talk.local/proxy/talk/api/recordings?limit=5&since=2025-01-01T00%3A00%3A00%2B00%3A00"
        );
        assert!(call.headers.is_empty());
        assert!(module.prepare(&config(), &json!({"since": "yesterday"})).is_err());
    }
}
