//! Request/response calls the reconciler and startup make against the
//! collection service.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::identity::Identity;
use crate::model::{DesiredProcess, DesiredSetResponse, ProcessUpdate, Registration};
use crate::reconcile::StatusChange;

/// Why the desired set could not be obtained. Every variant is recoverable:
/// the reconciler keeps its previous state and tries again on the next signal.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("desired-set request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("desired-set request returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("desired-set response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("service rejected desired-set request: {0}")]
    Rejected(String),
}

/// Source of the server-declared set of processes to watch.
#[async_trait]
pub trait DesiredSetSource: Send + Sync {
    async fn fetch_desired(&self) -> Result<Vec<DesiredProcess>, FetchError>;
}

/// Receiver of edge-triggered status-change notifications.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, change: &StatusChange) -> Result<()>;
}

/// HTTP implementation of the control-plane calls for one identity.
pub struct ControlApi {
    client: Client,
    base: String,
    identity: Identity,
}

impl ControlApi {
    pub fn new(client: Client, base: impl Into<String>, identity: Identity) -> Self {
        Self {
            client,
            base: base.into(),
            identity,
        }
    }

    pub fn desired_set_url(&self) -> String {
        format!(
            "{}/api/vm/moniters/{}/{}/processes",
            self.base, self.identity.subject_id, self.identity.machine_id
        )
    }

    pub fn update_url(&self) -> String {
        format!(
            "{}/api/vm/moniters/{}/update/processes",
            self.base, self.identity.subject_id
        )
    }

    pub fn registration_url(&self) -> String {
        format!("{}/api/vm/moniters/create-update", self.base)
    }

    pub fn registration(&self) -> Registration {
        Registration {
            subject_id: self.identity.subject_id.clone(),
            hostname: self.identity.hostname.clone(),
            machine_id: self.identity.machine_id.clone(),
            os: self.identity.os.clone(),
        }
    }

    /// One-shot startup registration of this host under its subject.
    pub async fn register(&self) -> Result<()> {
        let resp = self
            .client
            .post(self.registration_url())
            .json(&self.registration())
            .send()
            .await
            .context("sending startup registration")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("startup registration rejected with {status}: {body}");
        }
        info!(%status, "startup registration accepted");
        Ok(())
    }
}

/// Turns a desired-set response body into its process list.
pub fn parse_desired_set(body: &str) -> Result<Vec<DesiredProcess>, FetchError> {
    let response: DesiredSetResponse = serde_json::from_str(body)?;
    if !response.success {
        return Err(FetchError::Rejected(response.message));
    }
    Ok(response.data.unwrap_or_default().process)
}

#[async_trait]
impl DesiredSetSource for ControlApi {
    async fn fetch_desired(&self) -> Result<Vec<DesiredProcess>, FetchError> {
        let resp = self.client.get(self.desired_set_url()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let body = resp.text().await?;
        debug!(response = %body, "desired-set response");
        parse_desired_set(&body)
    }
}

#[async_trait]
impl StatusNotifier for ControlApi {
    async fn notify(&self, change: &StatusChange) -> Result<()> {
        let update = ProcessUpdate {
            subject_id: self.identity.subject_id.clone(),
            pid: change.pid,
            name: change.name.clone(),
            status: change.status,
            hostname: self.identity.hostname.clone(),
        };
        let resp = self
            .client
            .put(self.update_url())
            .json(&update)
            .send()
            .await
            .context("sending process update")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("process update rejected with {status}");
        }
        Ok(())
    }
}
