//! Placement driver node server

use crate::common::{Error, Result};
use crate::placement::driver::PlacementDriver;
use crate::placement::http::{create_router, PdState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct PdServer {
    driver: Arc<PlacementDriver>,
}

impl PdServer {
    pub fn new(driver: Arc<PlacementDriver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<PlacementDriver> {
        &self.driver
    }

    /// Serve the HTTP API, bootstrap the node and rejoin its regions, then
    /// run until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.driver.config();
        tracing::info!("Starting placement driver node {}", config.node_id);
        tracing::info!("  HTTP API: {}", config.service_addr);
        tracing::info!("  Raft address: {}", self.driver.raft_addr());
        tracing::info!("  Replication factor: {}", config.replication_factor);
        if let Some(seed) = &config.seed_service_addr {
            tracing::info!("  Seed: {}", seed);
        }

        let listener = tokio::net::TcpListener::bind(config.service_socket_addr()?).await?;
        let router = create_router(PdState {
            driver: Arc::clone(&self.driver),
        });
        let stop = shutdown.clone();
        let http = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
        });

        if let Err(e) = self.driver.bootstrap().await {
            tracing::error!("Bootstrap of node {} failed: {}", config.node_id, e);
            shutdown.cancel();
            let _ = http.await;
            return Err(e);
        }
        if let Err(e) = self.driver.restart_local_regions().await {
            tracing::warn!("Could not restart local regions: {}", e);
        }
        tracing::info!("✓ Placement driver node {} ready", config.node_id);

        let served = http
            .await
            .map_err(|e| Error::Internal(format!("HTTP server task: {}", e)))?;
        self.driver.shutdown().await;
        served?;
        Ok(())
    }
}
