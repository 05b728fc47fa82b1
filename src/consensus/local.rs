//! In-process consensus substrate
//!
//! All node hosts of a cluster share one [`LocalNetwork`]. Each group keeps a
//! single ordered log; an accepted entry is applied to every live replica of
//! the group under the network lock, so it is either applied everywhere or
//! not at all. Proposals and reads need a quorum of live replicas and block
//! (up to their timeout) until one is available.
//!
//! Every replica snapshots itself each `snapshot_entries` applied entries.
//! The log is compacted to the oldest snapshot held by a current member, and
//! a replica that joins or restarts is rebuilt from a snapshot plus the
//! remaining log.

use super::{
    Consensus, GroupId, Members, Membership, ReplicaId, StateMachine, StateMachineFactory,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Applied entries between two snapshots of one replica
pub const DEFAULT_SNAPSHOT_ENTRIES: u64 = 512;

#[derive(Debug, Clone)]
struct Snapshot {
    index: u64,
    data: Vec<u8>,
}

struct LiveReplica {
    host: String,
    sm: Box<dyn StateMachine>,
    applied: u64,
}

struct PendingJoin {
    host: String,
    factory: StateMachineFactory,
}

struct GroupCore {
    initialized: bool,
    membership: Membership,
    log: VecDeque<Vec<u8>>,
    /// Index of `log[0]`
    first_index: u64,
    live: BTreeMap<ReplicaId, LiveReplica>,
    pending: BTreeMap<ReplicaId, PendingJoin>,
    snapshots: HashMap<ReplicaId, Snapshot>,
}

impl GroupCore {
    fn new() -> Self {
        Self {
            initialized: false,
            membership: Membership::default(),
            log: VecDeque::new(),
            first_index: 1,
            live: BTreeMap::new(),
            pending: BTreeMap::new(),
            snapshots: HashMap::new(),
        }
    }

    fn last_index(&self) -> u64 {
        self.first_index + self.log.len() as u64 - 1
    }

    fn local_replica(&self, host: &str) -> Option<ReplicaId> {
        self.live
            .iter()
            .find(|(_, r)| r.host == host)
            .map(|(id, _)| *id)
    }

    fn is_pending(&self, host: &str) -> bool {
        self.pending.values().any(|p| p.host == host)
    }

    fn has_quorum(&self) -> bool {
        let live = self
            .live
            .keys()
            .filter(|id| self.membership.replicas.contains_key(id))
            .count();
        self.initialized && live >= self.membership.quorum()
    }

    /// The local replica when the group can serve it, `None` while waiting.
    fn ready_replica(&self, group: GroupId, host: &str) -> Result<Option<ReplicaId>> {
        match self.local_replica(host) {
            Some(id) if self.has_quorum() => Ok(Some(id)),
            Some(_) => Ok(None),
            None if self.is_pending(host) => Ok(None),
            None => Err(Error::Consensus(format!(
                "{} has no replica of group {}",
                host, group
            ))),
        }
    }

    /// Build a replica from the best snapshot plus the log tail.
    fn materialize(
        &mut self,
        group: GroupId,
        replica: ReplicaId,
        host: String,
        factory: &StateMachineFactory,
    ) -> Result<()> {
        let sm = factory(group, replica);
        let base = self
            .snapshots
            .get(&replica)
            .or_else(|| self.snapshots.values().max_by_key(|s| s.index))
            .cloned();

        let mut applied = 0;
        if let Some(snap) = base {
            if snap.index + 1 < self.first_index {
                return Err(Error::Consensus(format!(
                    "group {} log compacted past snapshot {}",
                    group, snap.index
                )));
            }
            sm.recover_from_snapshot(&mut snap.data.as_slice())?;
            applied = snap.index;
        } else if self.first_index > 1 {
            return Err(Error::Consensus(format!(
                "group {} has no snapshot to rebuild replica {} from",
                group, replica
            )));
        }

        let last = self.last_index();
        for index in (applied + 1)..=last {
            let entry = &self.log[(index - self.first_index) as usize];
            if let Err(e) = sm.update(entry) {
                tracing::trace!("Replay of entry {} in group {}: {}", index, group, e);
            }
        }

        tracing::debug!(
            "Replica {} of group {} live on {} at index {}",
            replica,
            group,
            host,
            last
        );
        self.live.insert(
            replica,
            LiveReplica {
                host,
                sm,
                applied: last,
            },
        );
        Ok(())
    }

    /// Promote pending joins whose slot is now in the membership.
    fn materialize_pending(&mut self, group: GroupId) -> Result<()> {
        let ready: Vec<ReplicaId> = self
            .pending
            .iter()
            .filter(|(id, p)| self.membership.contains(**id, &p.host))
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(join) = self.pending.remove(&id) {
                self.materialize(group, id, join.host, &join.factory)?;
            }
        }
        Ok(())
    }

    /// Append an entry and apply it to every live replica.
    fn append(
        &mut self,
        group: GroupId,
        entry: Vec<u8>,
        origin: ReplicaId,
        snapshot_entries: u64,
    ) -> Result<Vec<u8>> {
        self.log.push_back(entry);
        let index = self.first_index + self.log.len() as u64 - 1;
        let entry = &self.log[(index - self.first_index) as usize];

        let mut result = Err(Error::Internal(format!(
            "replica {} missing while applying entry {}",
            origin, index
        )));
        for (id, replica) in self.live.iter_mut() {
            let out = replica.sm.update(entry);
            replica.applied = index;
            if *id == origin {
                result = out;
            }
        }

        self.snapshot_due(group, snapshot_entries);
        result
    }

    fn snapshot_due(&mut self, group: GroupId, snapshot_entries: u64) {
        if snapshot_entries == 0 {
            return;
        }
        let mut taken = Vec::new();
        for (id, replica) in &self.live {
            let last = self.snapshots.get(id).map(|s| s.index).unwrap_or(0);
            if replica.applied < last + snapshot_entries {
                continue;
            }
            let mut data = Vec::new();
            match replica.sm.save_snapshot(&mut data) {
                Ok(()) => taken.push((
                    *id,
                    Snapshot {
                        index: replica.applied,
                        data,
                    },
                )),
                Err(e) => tracing::warn!(
                    "Snapshot of replica {} in group {} failed: {}",
                    id,
                    group,
                    e
                ),
            }
        }
        if taken.is_empty() {
            return;
        }
        for (id, snap) in taken {
            tracing::debug!("Group {} replica {} snapshot at {}", group, id, snap.index);
            self.snapshots.insert(id, snap);
        }
        self.compact();
    }

    fn compact(&mut self) {
        let floor = self
            .membership
            .replicas
            .keys()
            .filter_map(|id| self.snapshots.get(id))
            .map(|s| s.index)
            .min();
        if let Some(floor) = floor {
            while self.first_index <= floor && !self.log.is_empty() {
                self.log.pop_front();
                self.first_index += 1;
            }
        }
    }

    fn stop_host(&mut self, host: &str) -> bool {
        let before = self.live.len() + self.pending.len();
        self.live.retain(|_, r| r.host != host);
        self.pending.retain(|_, p| p.host != host);
        before != self.live.len() + self.pending.len()
    }
}

#[derive(Default)]
struct NetworkState {
    hosts: HashSet<String>,
    groups: HashMap<GroupId, GroupCore>,
}

/// Shared in-process "network" connecting node hosts.
pub struct LocalNetwork {
    state: Mutex<NetworkState>,
    snapshot_entries: u64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_snapshot_entries(DEFAULT_SNAPSHOT_ENTRIES)
    }

    /// `0` disables snapshots (and thus log compaction).
    pub fn with_snapshot_entries(snapshot_entries: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState::default()),
            snapshot_entries,
        })
    }

    /// Register a node host listening at `addr`.
    pub fn host(self: &Arc<Self>, addr: impl Into<String>) -> Result<LocalNodeHost> {
        let addr = addr.into();
        let mut state = self.state.lock();
        if !state.hosts.insert(addr.clone()) {
            return Err(Error::Consensus(format!("address {} already in use", addr)));
        }
        tracing::debug!("Node host listening at {}", addr);
        Ok(LocalNodeHost {
            addr,
            network: Arc::clone(self),
        })
    }

    pub fn is_reachable(&self, addr: &str) -> bool {
        self.state.lock().hosts.contains(addr)
    }

    /// `(first, last)` retained log indexes of a group
    pub fn log_bounds(&self, group: GroupId) -> Option<(u64, u64)> {
        let state = self.state.lock();
        state
            .groups
            .get(&group)
            .map(|core| (core.first_index, core.last_index()))
    }

    /// Index of the latest snapshot retained for a replica
    pub fn snapshot_index(&self, group: GroupId, replica: ReplicaId) -> Option<u64> {
        let state = self.state.lock();
        state
            .groups
            .get(&group)
            .and_then(|core| core.snapshots.get(&replica))
            .map(|s| s.index)
    }

    /// Replicas currently running, in id order
    pub fn live_replicas(&self, group: GroupId) -> Vec<ReplicaId> {
        let state = self.state.lock();
        state
            .groups
            .get(&group)
            .map(|core| core.live.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// One node's handle on the [`LocalNetwork`].
pub struct LocalNodeHost {
    addr: String,
    network: Arc<LocalNetwork>,
}

impl LocalNodeHost {
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Stop every replica on this host and stop listening, as a crash would.
    /// Snapshots stay behind so the host can be restarted at the same address.
    pub fn shutdown(&self) {
        let mut state = self.network.state.lock();
        for (group, core) in state.groups.iter_mut() {
            if core.stop_host(&self.addr) {
                tracing::debug!("Stopped group {} on {}", group, self.addr);
            }
        }
        state.hosts.remove(&self.addr);
    }

    async fn poll<T, F>(&self, timeout: Duration, what: String, mut attempt: F) -> Result<T>
    where
        T: Send,
        F: FnMut() -> Result<Option<T>> + Send,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = attempt()? {
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!("{} after {:?}", what, timeout)));
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl Consensus for LocalNodeHost {
    fn raft_address(&self) -> &str {
        &self.addr
    }

    async fn start_group(
        &self,
        group: GroupId,
        replica: ReplicaId,
        initial_members: Option<Members>,
        factory: StateMachineFactory,
    ) -> Result<()> {
        let mut state = self.network.state.lock();
        let core = state.groups.entry(group).or_insert_with(GroupCore::new);
        if core.local_replica(&self.addr).is_some() || core.is_pending(&self.addr) {
            return Err(Error::GroupAlreadyStarted(group));
        }

        match initial_members {
            Some(members) => {
                if members.get(&replica).map(String::as_str) != Some(self.addr.as_str()) {
                    return Err(Error::Validation(format!(
                        "replica {} at {} is not in the initial membership of group {}",
                        replica, self.addr, group
                    )));
                }
                if !core.initialized {
                    core.initialized = true;
                    core.membership = Membership {
                        config_change_id: 1,
                        replicas: members,
                        removed: Default::default(),
                    };
                } else if !core.membership.contains(replica, &self.addr) {
                    return Err(Error::Consensus(format!(
                        "replica {} is not a member of group {}",
                        replica, group
                    )));
                }
                core.materialize(group, replica, self.addr.clone(), &factory)?;
                core.materialize_pending(group)?;
            }
            None => {
                if core.membership.removed.contains(&replica) {
                    return Err(Error::Consensus(format!(
                        "replica {} was removed from group {}",
                        replica, group
                    )));
                }
                if core.initialized && core.membership.contains(replica, &self.addr) {
                    core.materialize(group, replica, self.addr.clone(), &factory)?;
                } else {
                    tracing::debug!(
                        "Replica {} of group {} waiting to be added on {}",
                        replica,
                        group,
                        self.addr
                    );
                    core.pending.insert(
                        replica,
                        PendingJoin {
                            host: self.addr.clone(),
                            factory,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn stop_group(&self, group: GroupId) -> Result<()> {
        let mut state = self.network.state.lock();
        let stopped = state
            .groups
            .get_mut(&group)
            .map(|core| core.stop_host(&self.addr));
        match stopped {
            Some(true) => Ok(()),
            _ => Err(Error::GroupNotFound(group)),
        }
    }

    async fn propose(
        &self,
        group: GroupId,
        command: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let snapshot_entries = self.network.snapshot_entries;
        self.poll(timeout, format!("propose to group {}", group), || {
            let mut state = self.network.state.lock();
            let core = state
                .groups
                .get_mut(&group)
                .ok_or(Error::GroupNotFound(group))?;
            match core.ready_replica(group, &self.addr)? {
                Some(origin) => core
                    .append(group, command.clone(), origin, snapshot_entries)
                    .map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn read(&self, group: GroupId, query: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        self.poll(timeout, format!("read from group {}", group), || {
            let state = self.network.state.lock();
            let core = state.groups.get(&group).ok_or(Error::GroupNotFound(group))?;
            match core.ready_replica(group, &self.addr)? {
                Some(id) => match core.live.get(&id) {
                    Some(replica) => replica.sm.lookup(&query).map(Some),
                    None => Ok(None),
                },
                None => Ok(None),
            }
        })
        .await
    }

    async fn request_add_replica(
        &self,
        group: GroupId,
        replica: ReplicaId,
        address: String,
        timeout: Duration,
    ) -> Result<()> {
        let what = format!("add replica {} ({}) to group {}", replica, address, group);
        self.poll(timeout, what, || {
            let mut guard = self.network.state.lock();
            let state = &mut *guard;
            let reachable = state.hosts.contains(&address);
            let core = state
                .groups
                .get_mut(&group)
                .ok_or(Error::GroupNotFound(group))?;

            if core.membership.contains(replica, &address) {
                return Ok(Some(()));
            }
            if core.membership.removed.contains(&replica) {
                return Err(Error::Consensus(format!(
                    "replica id {} was removed from group {}",
                    replica, group
                )));
            }
            if core.membership.replicas.contains_key(&replica) {
                return Err(Error::Consensus(format!(
                    "replica id {} of group {} is bound to another address",
                    replica, group
                )));
            }
            if core.ready_replica(group, &self.addr)?.is_none() || !reachable {
                return Ok(None);
            }

            core.membership.replicas.insert(replica, address.clone());
            core.membership.config_change_id += 1;
            core.materialize_pending(group)?;
            tracing::info!("Group {}: added replica {} at {}", group, replica, address);
            Ok(Some(()))
        })
        .await
    }

    async fn request_delete_replica(
        &self,
        group: GroupId,
        replica: ReplicaId,
        timeout: Duration,
    ) -> Result<()> {
        let what = format!("delete replica {} from group {}", replica, group);
        self.poll(timeout, what, || {
            let mut state = self.network.state.lock();
            let core = state
                .groups
                .get_mut(&group)
                .ok_or(Error::GroupNotFound(group))?;

            if !core.membership.replicas.contains_key(&replica) {
                return Ok(Some(()));
            }
            if core.ready_replica(group, &self.addr)?.is_none() {
                return Ok(None);
            }

            core.membership.replicas.remove(&replica);
            core.membership.removed.insert(replica);
            core.membership.config_change_id += 1;
            core.live.remove(&replica);
            core.pending.remove(&replica);
            tracing::info!("Group {}: removed replica {}", group, replica);
            Ok(Some(()))
        })
        .await
    }

    async fn get_membership(&self, group: GroupId, timeout: Duration) -> Result<Membership> {
        self.poll(timeout, format!("membership of group {}", group), || {
            let state = self.network.state.lock();
            let core = state.groups.get(&group).ok_or(Error::GroupNotFound(group))?;
            Ok(core.initialized.then(|| core.membership.clone()))
        })
        .await
    }

    async fn remove_data(&self, group: GroupId, replica: ReplicaId) -> Result<()> {
        let mut state = self.network.state.lock();
        let Some(core) = state.groups.get_mut(&group) else {
            return Ok(());
        };
        if core
            .live
            .get(&replica)
            .map(|r| r.host == self.addr)
            .unwrap_or(false)
        {
            return Err(Error::Consensus(format!(
                "replica {} of group {} is still running",
                replica, group
            )));
        }
        core.snapshots.remove(&replica);
        tracing::debug!("Purged data of replica {} in group {}", replica, group);
        Ok(())
    }
}
