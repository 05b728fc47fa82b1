//! Placement records and the command/query envelopes of the PD group

use crate::consensus::{GroupId, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group id of the placement driver's own metadata group. Region ids start
/// right after it.
pub const PD_GROUP_ID: GroupId = 1;

/// A registered storage node, as last announced by the node itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: u64,
    pub raft_addr: String,
    pub service_addr: String,
    pub region_count: u64,
    pub announced_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionState {
    /// Id allocated, no replica recorded yet
    Allocated,
    /// At least one replica mapping recorded
    Active,
}

/// A key range `[start, end)` and the replicas serving it. An empty bound
/// is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub region_id: GroupId,
    pub start: String,
    pub end: String,
    /// raft address → replica id
    pub members: BTreeMap<String, ReplicaId>,
    /// Highest replica id handed out or recorded so far
    pub next_replica_id: ReplicaId,
    pub state: RegionState,
}

impl RegionDescriptor {
    pub fn unbounded(region_id: GroupId) -> Self {
        Self {
            region_id,
            start: String::new(),
            end: String::new(),
            members: BTreeMap::new(),
            next_replica_id: 0,
            state: RegionState::Allocated,
        }
    }

    /// `(start == "" or key >= start) and (end == "" or key < end)`
    pub fn contains_key(&self, key: &str) -> bool {
        (self.start.is_empty() || key >= self.start.as_str())
            && (self.end.is_empty() || key < self.end.as_str())
    }

    pub fn replica_at(&self, addr: &str) -> Option<ReplicaId> {
        self.members.get(addr).copied()
    }
}

/// Mutating operations of the PD group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    RegisterNode {
        node: NodeRecord,
    },
    AllocateRegionId,
    AllocateNodeIdInRegion {
        region_id: GroupId,
    },
    UpdateNodeMapping {
        region_id: GroupId,
        replica_id: ReplicaId,
        addr: String,
    },
    RemoveNodeMapping {
        region_id: GroupId,
        addr: String,
    },
}

/// Read-only operations of the PD group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Query {
    GetFreeNodes { count: usize },
    GetAllRegions,
    LocateRegionByKey { key: String },
    GetRegion { region_id: GroupId },
}

/// Routing table snapshot handed to callers
pub type RoutingTable = BTreeMap<GroupId, RegionDescriptor>;
