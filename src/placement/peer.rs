//! Out-of-band coordination with other placement driver nodes

use crate::common::{Error, Result};
use crate::consensus::{GroupId, ReplicaId};
use async_trait::async_trait;
use std::time::Duration;

/// Requests a node sends to its peers' service endpoints.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Ask a PD member to add `(node_id, raft_addr)` to the PD group.
    async fn request_join(&self, seed_service_addr: &str, node_id: u64, raft_addr: &str)
        -> Result<()>;

    /// Tell a node to start its replica of a freshly created region.
    async fn start_region(
        &self,
        service_addr: &str,
        region_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<()>;
}

/// [`PeerClient`] over the HTTP API (`POST /pd/join`, `POST /region/start`)
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post_form(&self, url: String, form: &[(&str, String)]) -> Result<()> {
        let resp = self.client.post(&url).form(form).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Http(format!("{} returned {}: {}", url, status, body)))
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn request_join(
        &self,
        seed_service_addr: &str,
        node_id: u64,
        raft_addr: &str,
    ) -> Result<()> {
        self.post_form(
            format!("http://{}/pd/join", seed_service_addr),
            &[("nid", node_id.to_string()), ("addr", raft_addr.to_string())],
        )
        .await
    }

    async fn start_region(
        &self,
        service_addr: &str,
        region_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<()> {
        self.post_form(
            format!("http://{}/region/start", service_addr),
            &[("rid", region_id.to_string()), ("nid", replica_id.to_string())],
        )
        .await
    }
}
