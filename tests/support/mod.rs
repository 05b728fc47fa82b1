//! In-process cluster harness shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use pdkv::consensus::{GroupId, LocalNetwork, LocalNodeHost, ReplicaId};
use pdkv::placement::{MetadataStateMachine, PD_GROUP_ID};
use pdkv::{Consensus, Error, PdConfig, PeerClient, PlacementDriver, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Peer client that calls the target driver directly, keyed by service address.
#[derive(Default)]
pub struct InProcessPeers {
    drivers: RwLock<HashMap<String, Weak<PlacementDriver>>>,
    /// Acknowledge region starts without starting anything
    pub drop_region_starts: AtomicBool,
    /// Reject region starts as an unreachable peer would
    pub fail_region_starts: AtomicBool,
    pub region_start_calls: AtomicUsize,
}

impl InProcessPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, driver: &Arc<PlacementDriver>) {
        self.drivers
            .write()
            .insert(driver.config().service_addr.clone(), Arc::downgrade(driver));
    }

    fn get(&self, service_addr: &str) -> Result<Arc<PlacementDriver>> {
        self.drivers
            .read()
            .get(service_addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Http(format!("{} unreachable", service_addr)))
    }
}

#[async_trait]
impl PeerClient for InProcessPeers {
    async fn request_join(&self, seed: &str, node_id: u64, raft_addr: &str) -> Result<()> {
        self.get(seed)?.join_metadata_group(node_id, raft_addr).await
    }

    async fn start_region(
        &self,
        service_addr: &str,
        region_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<()> {
        self.region_start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_region_starts.load(Ordering::SeqCst) {
            return Err(Error::Http(format!("{} refused region start", service_addr)));
        }
        let driver = self.get(service_addr)?;
        if self.drop_region_starts.load(Ordering::SeqCst) {
            return Ok(());
        }
        driver.start_region(region_id, replica_id, None).await
    }
}

pub fn raft_addr(node_id: u64) -> String {
    format!("127.0.0.1:{}", 12000 + node_id)
}

pub fn service_addr(node_id: u64) -> String {
    format!("127.0.0.1:{}", 11000 + node_id)
}

pub fn node_config(node_id: u64) -> PdConfig {
    PdConfig {
        node_id,
        raft_addr: raft_addr(node_id),
        service_addr: service_addr(node_id),
        bootstrap: node_id == 1,
        seed_service_addr: (node_id != 1).then(|| service_addr(1)),
        announce_interval_ms: 50,
        membership_change_timeout_ms: 500,
        region_operation_timeout_ms: 1_000,
        join_initial_backoff_ms: 20,
        cleanup_initial_backoff_ms: 20,
        cleanup_max_backoff_ms: 100,
        cleanup_max_attempts: 50,
        ..Default::default()
    }
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub peers: Arc<InProcessPeers>,
    pub hosts: HashMap<u64, Arc<LocalNodeHost>>,
    pub nodes: HashMap<u64, Arc<PlacementDriver>>,
}

impl TestCluster {
    /// Bootstrap node 1, then join and announce nodes 2..=n.
    pub async fn start(n: u64, snapshot_entries: u64) -> Self {
        let mut cluster = Self {
            network: LocalNetwork::with_snapshot_entries(snapshot_entries),
            peers: InProcessPeers::new(),
            hosts: HashMap::new(),
            nodes: HashMap::new(),
        };
        for id in 1..=n {
            cluster.add_node(node_config(id)).await.unwrap();
        }
        cluster
    }

    /// Create, bootstrap and announce a node.
    pub async fn add_node(&mut self, config: PdConfig) -> Result<Arc<PlacementDriver>> {
        let driver = self.attach(config)?;
        driver.bootstrap().await?;
        driver.announce().await?;
        Ok(driver)
    }

    /// Create a driver without bootstrapping it.
    pub fn attach(&mut self, config: PdConfig) -> Result<Arc<PlacementDriver>> {
        let id = config.node_id;
        let host = Arc::new(self.network.host(config.raft_addr.clone())?);
        let consensus: Arc<dyn Consensus> = host.clone();
        let driver = PlacementDriver::new(config, consensus, self.peers.clone());
        self.peers.register(&driver);
        self.hosts.insert(id, host);
        self.nodes.insert(id, driver.clone());
        Ok(driver)
    }

    /// Join the PD group as a member that never registers itself as a
    /// storage node.
    pub async fn attach_pd_only(&mut self, node_id: u64) -> Arc<PlacementDriver> {
        self.attach_pd_only_with(node_config(node_id)).await
    }

    pub async fn attach_pd_only_with(&mut self, config: PdConfig) -> Arc<PlacementDriver> {
        let node_id = config.node_id;
        let raft = config.raft_addr.clone();
        let driver = self.attach(config).unwrap();
        self.hosts[&node_id]
            .start_group(PD_GROUP_ID, node_id, None, MetadataStateMachine::factory())
            .await
            .unwrap();
        self.driver(1).join_metadata_group(node_id, &raft).await.unwrap();
        driver
    }

    pub fn driver(&self, id: u64) -> &Arc<PlacementDriver> {
        &self.nodes[&id]
    }

    /// Stop a node as a crash would: background tasks end, its replicas stop.
    pub async fn crash(&mut self, id: u64) {
        if let Some(driver) = self.nodes.remove(&id) {
            driver.shutdown().await;
        }
        if let Some(host) = self.hosts.remove(&id) {
            host.shutdown();
        }
    }

    pub async fn shutdown(&self) {
        for driver in self.nodes.values() {
            driver.shutdown().await;
        }
    }
}

/// Poll `check` until it returns true or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
