//! Fire-and-forget delivery of telemetry samples.
//!
//! No retries, no queue: a failed send is logged and dropped, and the next
//! tick of the owning loop produces a fresh sample anyway.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Telemetry delivery targets on the collection service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Metrics,
    HealthReport,
    ProcessList,
    TopCpu,
    TopMemory,
    SystemSummary,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Metrics => "/api/go/system/metrics/create",
            Endpoint::HealthReport => "/api/go/system/health-report",
            Endpoint::ProcessList => "/api/go/system/create-processes",
            Endpoint::TopCpu => "/api/go/system/processes/topcpu-create",
            Endpoint::TopMemory => "/api/go/system/processes/topmemory-create",
            Endpoint::SystemSummary => "/api/go/system/summary",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Metrics => "metrics",
            Endpoint::HealthReport => "health_report",
            Endpoint::ProcessList => "process_list",
            Endpoint::TopCpu => "top_cpu",
            Endpoint::TopMemory => "top_memory",
            Endpoint::SystemSummary => "system_summary",
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Delivers one sample. Success means the service answered 2xx.
    async fn send(&self, endpoint: Endpoint, payload: serde_json::Value) -> Result<()>;
}

/// Builds the HTTP client shared by every outbound request.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .tcp_nodelay(true)
        .pool_max_idle_per_host(4)
        .build()
        .context("building HTTP client")
}

/// Posts samples as JSON to `<base><endpoint path>`.
pub struct HttpDispatcher {
    client: Client,
    base: String,
}

impl HttpDispatcher {
    pub fn new(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base, endpoint.path())
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn send(&self, endpoint: Endpoint, payload: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("sending {}", endpoint.name()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{} rejected with {status}: {body}", endpoint.name());
        }
        Ok(())
    }
}

/// Serializes `sample` and delivers it on a detached task so a slow endpoint
/// never stalls the caller. Serialization failures are logged and dropped.
pub fn dispatch_detached<T: Serialize>(
    dispatcher: &Arc<dyn Dispatcher>,
    endpoint: Endpoint,
    sample: &T,
) {
    let payload = match serde_json::to_value(sample) {
        Ok(v) => v,
        Err(e) => {
            warn!(endpoint = endpoint.name(), error = %e, "failed to encode sample");
            return;
        }
    };
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move {
        match dispatcher.send(endpoint, payload).await {
            Ok(()) => debug!(endpoint = endpoint.name(), "sample delivered"),
            Err(e) => warn!(endpoint = endpoint.name(), error = %e, "sample dropped"),
        }
    });
}
