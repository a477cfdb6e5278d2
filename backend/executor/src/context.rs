//! The object a handler receives, and the collaborators it can reach through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use jobforge_core::{
    BroadcastEventBus, ConfigMap, Database, EventBus, HttpClient, HttpRequest, HttpResponse,
    Notifier, TriggerKind,
};

use crate::log_buffer::JobLogger;

/// Shallow merge: module keys first, job keys win.
pub fn merge_config(module: &ConfigMap, job: &ConfigMap) -> ConfigMap {
    let mut merged = module.clone();
    for (key, value) in job {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Collaborators injected into every handler invocation.
#[derive(Clone)]
pub struct Services {
    pub database: Arc<dyn Database>,
    pub notifier: Arc<dyn Notifier>,
    pub http: Arc<dyn HttpClient>,
    pub events: Arc<dyn EventBus>,
}

impl Services {
    pub fn new(database: Arc<dyn Database>, events: Arc<dyn EventBus>) -> Self {
        Self {
            database,
            notifier: Arc::new(LogNotifier),
            http: Arc::new(ReqwestHttpClient::default()),
            events,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = http;
        self
    }
}

impl Default for Services {
    /// No database, a private event bus. Useful for tests and dry runs.
    fn default() -> Self {
        Self::new(Arc::new(UnavailableDatabase), Arc::new(BroadcastEventBus::default()))
    }
}

/// Everything a handler sees for one run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub job_id: String,
    pub dispatch_id: Option<String>,
    pub attempt: u32,
    pub trigger: TriggerKind,
    /// Module config overlaid by job config.
    pub config: ConfigMap,
    pub logger: JobLogger,
    pub services: Services,
    /// Fired when the execution times out or the engine shuts down.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// The JSON document process handlers read from stdin.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "executionId": self.execution_id,
            "jobId": self.job_id,
            "dispatchId": self.dispatch_id,
            "attempt": self.attempt,
            "trigger": self.trigger,
            "config": self.config,
        })
    }
}

// ---------------------------------------------------------------------------
// Default collaborators
// ---------------------------------------------------------------------------

/// Notifier that only writes to the log. Delivery channels plug in elsewhere.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, recipient: &str, message: &str) -> Result<()> {
        info!(channel = %channel, recipient = %recipient, message = %message, "Notification");
        Ok(())
    }
}

/// Stand-in when the engine runs without a handler-facing database.
pub struct UnavailableDatabase;

#[async_trait]
impl Database for UnavailableDatabase {
    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Value>> {
        bail!("no database is configured for handlers")
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<usize> {
        bail!("no database is configured for handlers")
    }
}

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method.to_uppercase().as_str() {
            "GET" => self.client.get(&request.url),
            "POST" => self.client.post(&request.url),
            "PUT" => self.client.put(&request.url),
            "DELETE" => self.client.delete(&request.url),
            "PATCH" => self.client.patch(&request.url),
            "HEAD" => self.client.head(&request.url),
            other => bail!("Unsupported HTTP method: {}", other),
        };

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        info!(method = %request.method, url = %request.url, "Handler HTTP request");

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
