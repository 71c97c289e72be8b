//! Built-in HTTP delivery and attempt reports.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};

use super::EventHandler;
use super::event::{AttemptStatus, BODY_PREVIEW_LIMIT, Headers, WebhookEvent};
use crate::scheduler::task::truncate_chars;

/// What one attempt produced, ready to be appended to the attempt log.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub status: AttemptStatus,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    pub response_status: Option<i32>,
    pub response_headers: Headers,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

impl AttemptReport {
    pub fn succeeded(response_status: Option<i32>, body: Option<String>) -> Self {
        Self {
            status: AttemptStatus::Succeeded,
            request_headers: Headers::new(),
            request_body: None,
            response_status,
            response_headers: Headers::new(),
            response_body: body.map(|b| truncate_chars(&b, BODY_PREVIEW_LIMIT)),
            error: None,
        }
    }

    /// The remote answered with an error status.
    pub fn rejected(response_status: i32, body: Option<String>) -> Self {
        Self {
            status: AttemptStatus::Failed,
            error: Some(format!("HTTP {response_status}")),
            ..Self::succeeded(Some(response_status), body)
        }
    }

    /// No usable response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Error,
            error: Some(message.into()),
            ..Self::succeeded(None, None)
        }
    }

    pub fn with_request(mut self, headers: Headers, body: Option<String>) -> Self {
        self.request_headers = headers;
        self.request_body = body;
        self
    }

    pub fn with_response_headers(mut self, headers: Headers) -> Self {
        self.response_headers = headers;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Succeeded
    }
}

/// Raw response of an HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

impl HttpExchange {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON, falling back to a string value.
    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|_| serde_json::Value::String(self.body.clone()))
    }
}

pub fn header_map(headers: &reqwest::header::HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect()
}

/// Perform one request. The body is sent as JSON when present.
pub async fn exchange(
    client: &Client,
    method: Method,
    url: &str,
    headers: &Headers,
    body: Option<&serde_json::Value>,
    timeout: Duration,
) -> Result<HttpExchange, reqwest::Error> {
    let mut request = client.request(method, url).timeout(timeout);
    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let headers = header_map(response.headers());
    let body = response.text().await?;

    Ok(HttpExchange {
        status,
        headers,
        body,
    })
}

/// Posts the stored payload to `http(s)` targets.
pub struct HttpDelivery {
    client: Client,
    timeout: Duration,
}

impl HttpDelivery {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("msp-automation/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, timeout }
    }

    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn handles(target_url: &str) -> bool {
        let lower = target_url.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }
}

impl Default for HttpDelivery {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl EventHandler for HttpDelivery {
    async fn deliver(&self, event: &WebhookEvent) -> AttemptReport {
        let mut headers = event.headers.clone();
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());
        let request_body = Some(event.payload.to_string());

        let result = exchange(
            &self.client,
            Method::POST,
            &event.target_url,
            &event.headers,
            Some(&event.payload),
            self.timeout,
        )
        .await;

        let report = match result {
            Ok(response) if response.is_success() => {
                AttemptReport::succeeded(Some(response.status as i32), Some(response.body))
                    .with_response_headers(response.headers)
            }
            Ok(response) => AttemptReport::rejected(response.status as i32, Some(response.body))
                .with_response_headers(response.headers),
            Err(e) => AttemptReport::error(e.to_string()),
        };
        report.with_request(headers, request_body)
    }
}
