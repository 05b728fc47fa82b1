//! Placement driver orchestrator
//!
//! Turns cluster operations into commands and queries against the PD group,
//! and starts or joins region groups on the local node host.

use crate::common::{
    retry_with_backoff, timestamp_now_millis, validate_key, Backoff, CreateRegionStep, Error,
    PdConfig, PdMetrics, Result, RetryOutcome,
};
use crate::consensus::{Consensus, GroupId, Members, Membership, ReplicaId};
use crate::placement::peer::PeerClient;
use crate::placement::state_machine::MetadataStateMachine;
use crate::placement::types::{
    Command, NodeRecord, Query, RegionDescriptor, RoutingTable, PD_GROUP_ID,
};
use crate::region::RegionKvStateMachine;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A temporary bootstrap replica that could not be removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub region_id: GroupId,
    pub replica_id: ReplicaId,
    pub addr: String,
    pub attempts: usize,
    pub error: String,
    pub raised_at_ms: u64,
}

pub struct PlacementDriver {
    config: PdConfig,
    consensus: Arc<dyn Consensus>,
    peers: Arc<dyn PeerClient>,
    metrics: Arc<PdMetrics>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    alerts: Mutex<Vec<Alert>>,
    /// Regions with a replica started on this node
    hosted: Mutex<BTreeSet<GroupId>>,
}

impl PlacementDriver {
    pub fn new(
        config: PdConfig,
        consensus: Arc<dyn Consensus>,
        peers: Arc<dyn PeerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            consensus,
            peers,
            metrics: Arc::new(PdMetrics::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            hosted: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn config(&self) -> &PdConfig {
        &self.config
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn raft_addr(&self) -> &str {
        self.consensus.raft_address()
    }

    pub fn metrics(&self) -> &Arc<PdMetrics> {
        &self.metrics
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn hosted_regions(&self) -> Vec<GroupId> {
        self.hosted.lock().iter().copied().collect()
    }

    // === PD group access ===

    async fn propose(&self, cmd: &Command) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(cmd)?;
        let started = Instant::now();
        self.metrics.proposals_total.inc();
        let result = self
            .consensus
            .propose(PD_GROUP_ID, bytes, self.config.region_operation_timeout())
            .await;
        self.metrics.observe_substrate_call(started.elapsed());
        if result.is_err() {
            self.metrics.proposal_errors.inc();
        }
        result
    }

    async fn propose_as<T: DeserializeOwned>(&self, cmd: &Command) -> Result<T> {
        let out = self.propose(cmd).await?;
        Ok(serde_json::from_slice(&out)?)
    }

    async fn read_as<T: DeserializeOwned>(&self, query: &Query) -> Result<T> {
        let bytes = serde_json::to_vec(query)?;
        let started = Instant::now();
        self.metrics.reads_total.inc();
        let result = self
            .consensus
            .read(PD_GROUP_ID, bytes, self.config.region_operation_timeout())
            .await;
        self.metrics.observe_substrate_call(started.elapsed());
        match result {
            Ok(out) => Ok(serde_json::from_slice(&out)?),
            Err(e) => {
                self.metrics.read_errors.inc();
                Err(e)
            }
        }
    }

    /// Run a membership change, reporting a substrate timeout as
    /// `MembershipChangeTimeout`.
    async fn change_membership<F>(&self, what: String, change: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        self.metrics.membership_changes_total.inc();
        let started = Instant::now();
        let result = change.await;
        self.metrics.observe_substrate_call(started.elapsed());
        result.map_err(|e| {
            self.metrics.membership_change_errors.inc();
            match e {
                Error::Timeout(_) => Error::MembershipChangeTimeout(what),
                other => other,
            }
        })
    }

    // === Bootstrap ===

    /// Start this node's PD replica, joining through the seed unless this
    /// node bootstraps the group, then start the self-announce loop.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let node_id = self.config.node_id;
        let raft_addr = self.raft_addr().to_string();

        if self.config.bootstrap {
            tracing::info!("Bootstrapping PD group with node {} at {}", node_id, raft_addr);
            let members = Members::from([(node_id, raft_addr)]);
            self.consensus
                .start_group(
                    PD_GROUP_ID,
                    node_id,
                    Some(members),
                    MetadataStateMachine::factory(),
                )
                .await?;
        } else {
            let seed = self.config.seed_service_addr.as_deref().ok_or_else(|| {
                Error::InvalidConfig("a joining node needs seed_service_addr".into())
            })?;
            tracing::info!("Joining PD group through {} as node {}", seed, node_id);
            self.consensus
                .start_group(PD_GROUP_ID, node_id, None, MetadataStateMachine::factory())
                .await?;
            let backoff = Backoff::new(
                self.config.join_initial_backoff(),
                self.config.announce_max_backoff(),
            );
            let outcome = retry_with_backoff(
                || self.peers.request_join(seed, node_id, &raft_addr),
                self.config.join_max_attempts,
                backoff,
                &self.shutdown,
            )
            .await;
            match outcome {
                RetryOutcome::Done(()) => {}
                RetryOutcome::GaveUp { last_error, .. } => return Err(last_error),
                RetryOutcome::Cancelled => {
                    return Err(Error::Internal("shut down while joining".into()))
                }
            }
        }

        self.spawn_announce_loop();
        Ok(())
    }

    /// Register this node now, outside the periodic loop.
    pub async fn announce(&self) -> Result<()> {
        let node = NodeRecord {
            node_id: self.config.node_id,
            raft_addr: self.raft_addr().to_string(),
            service_addr: self.config.service_addr.clone(),
            region_count: self.hosted.lock().len() as u64,
            announced_at_ms: timestamp_now_millis(),
        };
        self.propose(&Command::RegisterNode { node }).await?;
        Ok(())
    }

    fn spawn_announce_loop(self: &Arc<Self>) {
        let driver = Arc::clone(self);
        let handle = tokio::spawn(async move { driver.announce_loop().await });
        self.track(handle);
    }

    async fn announce_loop(&self) {
        let interval = self.config.announce_interval();
        let mut backoff = Backoff::new(interval, self.config.announce_max_backoff());
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.announce().await {
                Ok(()) => {
                    backoff.reset();
                    delay = interval;
                }
                Err(e) => {
                    self.metrics.announce_failures.inc();
                    delay = backoff.next_delay();
                    tracing::warn!("Announce of node {} failed: {}, next in {:?}", self.config.node_id, e, delay);
                }
            }
        }
        tracing::debug!("Announce loop of node {} stopped", self.config.node_id);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // === PD membership ===

    pub async fn join_metadata_group(&self, node_id: u64, raft_addr: &str) -> Result<()> {
        if node_id == 0 || raft_addr.trim().is_empty() {
            return Err(Error::Validation(format!(
                "invalid PD member {} at {:?}",
                node_id, raft_addr
            )));
        }
        let what = format!("add node {} ({}) to the PD group", node_id, raft_addr);
        self.change_membership(
            what,
            self.consensus.request_add_replica(
                PD_GROUP_ID,
                node_id,
                raft_addr.to_string(),
                self.config.membership_change_timeout(),
            ),
        )
        .await?;
        tracing::info!("Node {} joined the PD group at {}", node_id, raft_addr);
        Ok(())
    }

    pub async fn leave_metadata_group(&self, node_id: u64) -> Result<()> {
        if node_id == 0 {
            return Err(Error::Validation("node id must be non-zero".into()));
        }
        let what = format!("remove node {} from the PD group", node_id);
        self.change_membership(
            what,
            self.consensus.request_delete_replica(
                PD_GROUP_ID,
                node_id,
                self.config.membership_change_timeout(),
            ),
        )
        .await?;
        tracing::info!("Node {} left the PD group", node_id);
        Ok(())
    }

    // === Regions ===

    /// Allocate a region, place `replication_factor` replicas and start it.
    pub async fn create_region(self: &Arc<Self>, replication_factor: usize) -> Result<GroupId> {
        if replication_factor == 0 {
            return Err(Error::Validation(
                "replication factor must be at least 1".into(),
            ));
        }
        let result = self.create_region_steps(replication_factor).await;
        match &result {
            Ok(id) => {
                self.metrics.regions_created.inc();
                tracing::info!("Created region {} with {} replicas", id, replication_factor);
            }
            Err(e) => {
                self.metrics.region_create_failures.inc();
                tracing::warn!("Region creation failed: {}", e);
            }
        }
        result
    }

    async fn create_region_steps(self: &Arc<Self>, replication_factor: usize) -> Result<GroupId> {
        use CreateRegionStep::*;
        let own_addr = self.raft_addr().to_string();

        let region_id: GroupId = self
            .propose_as(&Command::AllocateRegionId)
            .await
            .map_err(|e| Error::create_region(AllocateId, e))?;

        let nodes: Vec<NodeRecord> = self
            .read_as(&Query::GetFreeNodes {
                count: replication_factor,
            })
            .await
            .map_err(|e| Error::create_region(SelectNodes, e))?;

        let mut members = Members::new();
        let mut local_replica = None;
        for (slot, node) in nodes.iter().enumerate() {
            let replica = slot as ReplicaId + 1;
            members.insert(replica, node.raft_addr.clone());
            if node.raft_addr == own_addr {
                local_replica = Some(replica);
            }
        }
        let temporary = local_replica.is_none();
        let local_replica = local_replica.unwrap_or(replication_factor as ReplicaId + 1);
        if temporary {
            tracing::debug!(
                "Region {}: node {} not selected, bootstrapping through temporary replica {}",
                region_id,
                self.config.node_id,
                local_replica
            );
            members.insert(local_replica, own_addr.clone());
        }

        self.start_region(region_id, local_replica, Some(members.clone()))
            .await
            .map_err(|e| Error::create_region(StartLocal, e))?;

        let placed = self.place_region(region_id, &members, &nodes, &own_addr).await;
        // the temporary replica is running from here on, whatever happens next
        if temporary {
            self.spawn_cleanup(region_id, local_replica);
        }
        placed.map(|()| region_id)
    }

    /// Record every slot, then tell each selected peer to start its replica.
    /// All peers are notified even if one fails; the first error is returned.
    async fn place_region(
        &self,
        region_id: GroupId,
        members: &Members,
        nodes: &[NodeRecord],
        own_addr: &str,
    ) -> Result<()> {
        for (replica, addr) in members {
            self.propose(&Command::UpdateNodeMapping {
                region_id,
                replica_id: *replica,
                addr: addr.clone(),
            })
            .await
            .map_err(|e| Error::create_region(CreateRegionStep::RecordMapping, e))?;
        }

        let mut first_error = None;
        for (slot, node) in nodes.iter().enumerate() {
            if node.raft_addr == own_addr {
                continue;
            }
            let replica = slot as ReplicaId + 1;
            if let Err(e) = self
                .peers
                .start_region(&node.service_addr, region_id, replica)
                .await
            {
                tracing::warn!(
                    "Region {}: node {} did not start replica {}: {}",
                    region_id,
                    node.node_id,
                    replica,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(Error::create_region(CreateRegionStep::NotifyPeers, e)),
            None => Ok(()),
        }
    }

    /// Start (`Some` members) or join (`None`) a region group locally.
    pub async fn start_region(
        &self,
        region_id: GroupId,
        replica_id: ReplicaId,
        initial_members: Option<Members>,
    ) -> Result<()> {
        if region_id <= PD_GROUP_ID {
            return Err(Error::Validation(format!(
                "{} is not a region id",
                region_id
            )));
        }
        if replica_id == 0 {
            return Err(Error::Validation("replica id must be non-zero".into()));
        }
        let joining = initial_members.is_none();
        self.consensus
            .start_group(
                region_id,
                replica_id,
                initial_members,
                RegionKvStateMachine::factory(),
            )
            .await?;
        self.hosted.lock().insert(region_id);
        tracing::info!(
            "Started replica {} of region {}{}",
            replica_id,
            region_id,
            if joining { " (join)" } else { "" }
        );
        Ok(())
    }

    pub async fn locate_region_by_key(&self, key: &str) -> Result<GroupId> {
        validate_key(key)?;
        self.read_as(&Query::LocateRegionByKey {
            key: key.to_string(),
        })
        .await
    }

    /// Live membership as the substrate sees it.
    pub async fn get_membership(&self, region_id: GroupId) -> Result<Membership> {
        self.consensus
            .get_membership(region_id, self.config.membership_change_timeout())
            .await
    }

    pub async fn list_regions(&self) -> Result<RoutingTable> {
        self.read_as(&Query::GetAllRegions).await
    }

    pub async fn get_region(&self, region_id: GroupId) -> Result<RegionDescriptor> {
        self.read_as(&Query::GetRegion { region_id }).await
    }

    /// Add a replica at `raft_addr` and record it. The node at that address
    /// still has to start the replica by joining.
    pub async fn add_region_replica(&self, region_id: GroupId, raft_addr: &str) -> Result<ReplicaId> {
        let replica_id: ReplicaId = self
            .propose_as(&Command::AllocateNodeIdInRegion { region_id })
            .await?;
        let what = format!(
            "add replica {} ({}) to region {}",
            replica_id, raft_addr, region_id
        );
        self.change_membership(
            what,
            self.consensus.request_add_replica(
                region_id,
                replica_id,
                raft_addr.to_string(),
                self.config.membership_change_timeout(),
            ),
        )
        .await?;
        self.propose(&Command::UpdateNodeMapping {
            region_id,
            replica_id,
            addr: raft_addr.to_string(),
        })
        .await?;
        Ok(replica_id)
    }

    pub async fn remove_region_replica(
        &self,
        region_id: GroupId,
        replica_id: ReplicaId,
        raft_addr: &str,
    ) -> Result<()> {
        let what = format!("remove replica {} from region {}", replica_id, region_id);
        self.change_membership(
            what,
            self.consensus.request_delete_replica(
                region_id,
                replica_id,
                self.config.membership_change_timeout(),
            ),
        )
        .await?;
        if raft_addr == self.raft_addr() {
            self.consensus.remove_data(region_id, replica_id).await?;
            self.hosted.lock().remove(&region_id);
        }
        self.propose(&Command::RemoveNodeMapping {
            region_id,
            addr: raft_addr.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Rejoin every region the routing table places on this node. Returns
    /// how many were started.
    pub async fn restart_local_regions(&self) -> Result<usize> {
        let own_addr = self.raft_addr().to_string();
        let regions = self.list_regions().await?;
        let mut started = 0;
        for region in regions.values() {
            let Some(replica_id) = region.replica_at(&own_addr) else {
                continue;
            };
            if self.hosted.lock().contains(&region.region_id) {
                continue;
            }
            match self.start_region(region.region_id, replica_id, None).await {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!(
                    "Could not restart replica {} of region {}: {}",
                    replica_id,
                    region.region_id,
                    e
                ),
            }
        }
        tracing::info!("Restarted {} local region replicas", started);
        Ok(started)
    }

    // === Temporary replica cleanup ===

    fn spawn_cleanup(self: &Arc<Self>, region_id: GroupId, replica_id: ReplicaId) {
        let driver = Arc::clone(self);
        let handle = tokio::spawn(async move {
            driver.cleanup_temporary_replica(region_id, replica_id).await
        });
        self.track(handle);
    }

    async fn cleanup_temporary_replica(&self, region_id: GroupId, replica_id: ReplicaId) {
        let backoff = Backoff::new(
            self.config.cleanup_initial_backoff(),
            self.config.cleanup_max_backoff(),
        );
        let mut attempt = 0;
        let outcome = retry_with_backoff(
            || {
                attempt += 1;
                if attempt > 1 {
                    self.metrics.cleanup_retries.inc();
                }
                self.remove_temporary_replica(region_id, replica_id)
            },
            self.config.cleanup_max_attempts,
            backoff,
            &self.shutdown,
        )
        .await;

        match outcome {
            RetryOutcome::Done(()) => tracing::info!(
                "Region {}: temporary replica {} removed",
                region_id,
                replica_id
            ),
            RetryOutcome::Cancelled => tracing::info!(
                "Region {}: cleanup of temporary replica {} cancelled",
                region_id,
                replica_id
            ),
            RetryOutcome::GaveUp {
                attempts,
                last_error,
            } => {
                self.metrics.cleanup_give_ups.inc();
                tracing::error!(
                    alert = true,
                    region_id,
                    replica_id,
                    attempts,
                    "Temporary replica could not be removed: {}",
                    last_error
                );
                self.alerts.lock().push(Alert {
                    region_id,
                    replica_id,
                    addr: self.raft_addr().to_string(),
                    attempts,
                    error: last_error.to_string(),
                    raised_at_ms: timestamp_now_millis(),
                });
            }
        }
    }

    async fn remove_temporary_replica(&self, region_id: GroupId, replica_id: ReplicaId) -> Result<()> {
        let what = format!(
            "remove temporary replica {} from region {}",
            replica_id, region_id
        );
        self.change_membership(
            what,
            self.consensus.request_delete_replica(
                region_id,
                replica_id,
                self.config.membership_change_timeout(),
            ),
        )
        .await?;
        self.consensus.remove_data(region_id, replica_id).await?;
        self.hosted.lock().remove(&region_id);
        self.propose(&Command::RemoveNodeMapping {
            region_id,
            addr: self.raft_addr().to_string(),
        })
        .await?;
        Ok(())
    }

    // === Shutdown ===

    /// Cancel the announce and cleanup tasks and wait for them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Placement driver {} stopped", self.config.node_id);
    }
}
