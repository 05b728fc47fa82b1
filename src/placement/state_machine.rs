//! Replicated state machine of the PD group

use crate::common::{Error, Result};
use crate::consensus::{GroupId, ReplicaId, StateMachine, StateMachineFactory};
use crate::placement::metadata::PlacementState;
use crate::placement::types::{Command, Query};
use parking_lot::Mutex;
use serde::Deserialize;
use std::io::{Read, Write};
use std::sync::Arc;

/// One instance per PD replica. Every command and query runs under the
/// same lock.
pub struct MetadataStateMachine {
    replica_id: ReplicaId,
    state: Mutex<PlacementState>,
}

impl MetadataStateMachine {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            state: Mutex::new(PlacementState::new()),
        }
    }

    pub fn factory() -> StateMachineFactory {
        Arc::new(|_group: GroupId, replica| {
            Box::new(MetadataStateMachine::new(replica)) as Box<dyn StateMachine>
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Apply a decoded command, returning its JSON result.
    pub fn apply(&self, cmd: Command) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let out = match cmd {
            Command::RegisterNode { node } => {
                tracing::debug!("Registering node {} at {}", node.node_id, node.raft_addr);
                state.register_node(node);
                serde_json::to_vec(&())?
            }
            Command::AllocateRegionId => {
                let id = state.allocate_region_id();
                tracing::debug!("Allocated region {}", id);
                serde_json::to_vec(&id)?
            }
            Command::AllocateNodeIdInRegion { region_id } => {
                serde_json::to_vec(&state.allocate_replica_id(region_id)?)?
            }
            Command::UpdateNodeMapping {
                region_id,
                replica_id,
                addr,
            } => {
                state.update_node_mapping(region_id, replica_id, &addr)?;
                serde_json::to_vec(&())?
            }
            Command::RemoveNodeMapping { region_id, addr } => {
                state.remove_node_mapping(region_id, &addr)?;
                serde_json::to_vec(&())?
            }
        };
        Ok(out)
    }

    /// Answer a decoded query, returning its JSON result.
    pub fn query(&self, query: Query) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let out = match query {
            Query::GetFreeNodes { count } => {
                serde_json::to_vec(&state.free_nodes(count, &mut rand::thread_rng())?)?
            }
            Query::GetAllRegions => serde_json::to_vec(&state.all_regions())?,
            Query::LocateRegionByKey { key } => serde_json::to_vec(&state.locate(&key)?)?,
            Query::GetRegion { region_id } => serde_json::to_vec(&state.region(region_id)?)?,
        };
        Ok(out)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::UnsupportedOperation(e.to_string()))
}

impl StateMachine for MetadataStateMachine {
    fn update(&self, entry: &[u8]) -> Result<Vec<u8>> {
        self.apply(decode(entry)?)
    }

    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>> {
        self.query(decode(query)?)
    }

    fn save_snapshot(&self, writer: &mut dyn Write) -> Result<()> {
        self.state.lock().write_snapshot(writer)
    }

    fn recover_from_snapshot(&self, reader: &mut dyn Read) -> Result<()> {
        let restored = PlacementState::read_snapshot(reader)?;
        *self.state.lock() = restored;
        tracing::info!("PD replica {} restored from snapshot", self.replica_id);
        Ok(())
    }
}
