//! HTTP implementations of the placement and cell collaborators.

use async_trait::async_trait;
use lrp_events::{ActualLrpInstanceKey, ActualLrpKey};
use serde::Serialize;
use tracing::{debug, error};

use super::{AuctionDispatcher, CellClient, CollaboratorError, PlacementBatch};

async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<(), CollaboratorError> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(service, status = %status, body = %body, "Collaborator request failed");
    Err(CollaboratorError::Status {
        service,
        status: status.as_u16(),
        body,
    })
}

/// Posts placement batches to the auctioneer.
#[derive(Debug, Clone)]
pub struct HttpAuctionDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuctionDispatcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AuctionDispatcher for HttpAuctionDispatcher {
    async fn request_placement(&self, batch: PlacementBatch) -> Result<(), CollaboratorError> {
        let url = format!("{}/v1/lrps/auctions", self.base_url);
        debug!(
            url = %url,
            lrps = batch.starts.len(),
            instances = batch.instance_count(),
            "Requesting placement"
        );

        let response = self.client.post(&url).json(&batch.starts).send().await?;
        check_status("auctioneer", response).await
    }
}

#[derive(Debug, Serialize)]
struct StopRequest<'a> {
    key: &'a ActualLrpKey,
    instance_key: &'a ActualLrpInstanceKey,
}

/// Sends stop requests to cell agents.
#[derive(Debug, Clone)]
pub struct HttpCellClient {
    client: reqwest::Client,
}

impl HttpCellClient {
    pub fn new() -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CellClient for HttpCellClient {
    async fn stop_lrp_instance(
        &self,
        address: &str,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), CollaboratorError> {
        let url = format!(
            "{}/v1/lrps/{}/instances/{}/stop",
            address.trim_end_matches('/'),
            key.process_guid,
            instance_key.instance_guid
        );
        debug!(url = %url, index = key.index, "Stopping LRP instance");

        let response = self
            .client
            .post(&url)
            .json(&StopRequest { key, instance_key })
            .send()
            .await?;
        check_status("cell", response).await
    }
}
