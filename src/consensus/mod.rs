//! Consensus substrate contract
//!
//! The placement driver and the region data engine are written against the
//! [`Consensus`] trait: replicated groups, each running one deterministic
//! [`StateMachine`] per member, with linearizable propose/read, membership
//! changes and snapshot callbacks.
//!
//! [`local`] provides an in-process implementation where many node hosts
//! share one [`local::LocalNetwork`].

pub mod local;

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

pub use local::{LocalNetwork, LocalNodeHost};

pub type GroupId = u64;
pub type ReplicaId = u64;

/// Replica id → raft address
pub type Members = BTreeMap<ReplicaId, String>;

/// Live membership of one group as tracked by the substrate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub config_change_id: u64,
    pub replicas: Members,
    pub removed: BTreeSet<ReplicaId>,
}

impl Membership {
    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    pub fn contains(&self, replica: ReplicaId, addr: &str) -> bool {
        self.replicas.get(&replica).map(String::as_str) == Some(addr)
    }
}

/// Deterministic replicated state machine.
///
/// Every member of a group applies the same entries in the same order. The
/// substrate may call the snapshot pair at any point between two entries.
pub trait StateMachine: Send + Sync {
    /// Apply one committed entry.
    fn update(&self, entry: &[u8]) -> Result<Vec<u8>>;

    /// Answer a read-only query.
    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>>;

    fn save_snapshot(&self, writer: &mut dyn Write) -> Result<()>;

    /// Replace the whole state with the snapshot's.
    fn recover_from_snapshot(&self, reader: &mut dyn Read) -> Result<()>;
}

/// Builds the state machine for `(group, replica)`
pub type StateMachineFactory =
    Arc<dyn Fn(GroupId, ReplicaId) -> Box<dyn StateMachine> + Send + Sync>;

/// Operations a node host exposes for the groups it participates in.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Address other members reach this host at
    fn raft_address(&self) -> &str;

    /// Start a replica. `initial_members == None` joins an existing group.
    async fn start_group(
        &self,
        group: GroupId,
        replica: ReplicaId,
        initial_members: Option<Members>,
        factory: StateMachineFactory,
    ) -> Result<()>;

    /// Stop the local replica, keeping its data for a later restart.
    async fn stop_group(&self, group: GroupId) -> Result<()>;

    async fn propose(&self, group: GroupId, command: Vec<u8>, timeout: Duration)
        -> Result<Vec<u8>>;

    async fn read(&self, group: GroupId, query: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;

    async fn request_add_replica(
        &self,
        group: GroupId,
        replica: ReplicaId,
        address: String,
        timeout: Duration,
    ) -> Result<()>;

    async fn request_delete_replica(
        &self,
        group: GroupId,
        replica: ReplicaId,
        timeout: Duration,
    ) -> Result<()>;

    async fn get_membership(&self, group: GroupId, timeout: Duration) -> Result<Membership>;

    /// Purge whatever a removed replica left on this host.
    async fn remove_data(&self, group: GroupId, replica: ReplicaId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_quorum() {
        let mut m = Membership::default();
        m.replicas.insert(1, "a:1".into());
        assert_eq!(m.quorum(), 1);
        m.replicas.insert(2, "b:1".into());
        m.replicas.insert(3, "c:1".into());
        assert_eq!(m.quorum(), 2);
        m.replicas.insert(4, "d:1".into());
        assert_eq!(m.quorum(), 3);
        assert!(m.contains(2, "b:1"));
        assert!(!m.contains(2, "c:1"));
    }
}
