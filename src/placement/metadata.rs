//! Placement metadata: node registry, routing table and id counter
//!
//! Snapshot layout:
//! - 8 bytes magic `PDMETA01`
//! - u64 LE payload length
//! - u32 LE crc32 of the payload
//! - bincode payload

use crate::common::{Error, Result};
use crate::consensus::{GroupId, ReplicaId};
use crate::placement::routing;
use crate::placement::types::{NodeRecord, RegionDescriptor, RegionState, RoutingTable, PD_GROUP_ID};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

const SNAPSHOT_MAGIC: &[u8; 8] = b"PDMETA01";
const HEADER_LEN: usize = 8 + 8 + 4;

/// Everything the PD group replicates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementState {
    /// Last region id handed out
    current_region_id: GroupId,
    nodes: BTreeMap<u64, NodeRecord>,
    regions: RoutingTable,
}

impl Default for PlacementState {
    fn default() -> Self {
        Self {
            current_region_id: PD_GROUP_ID,
            nodes: BTreeMap::new(),
            regions: RoutingTable::new(),
        }
    }
}

impl PlacementState {
    pub fn new() -> Self {
        Self::default()
    }

    // === Mutations ===

    /// Insert or overwrite a node record.
    pub fn register_node(&mut self, node: NodeRecord) {
        self.nodes.insert(node.node_id, node);
    }

    /// Next region id, with an unbounded descriptor created for it.
    pub fn allocate_region_id(&mut self) -> GroupId {
        self.current_region_id += 1;
        let id = self.current_region_id;
        self.regions.insert(id, RegionDescriptor::unbounded(id));
        id
    }

    pub fn allocate_replica_id(&mut self, region_id: GroupId) -> Result<ReplicaId> {
        let region = self.region_mut(region_id)?;
        region.next_replica_id += 1;
        Ok(region.next_replica_id)
    }

    pub fn update_node_mapping(
        &mut self,
        region_id: GroupId,
        replica_id: ReplicaId,
        addr: &str,
    ) -> Result<()> {
        let region = self.region_mut(region_id)?;
        if let Some((other, _)) = region
            .members
            .iter()
            .find(|(a, id)| **id == replica_id && a.as_str() != addr)
        {
            return Err(Error::Consistency(format!(
                "replica {} of region {} is already bound to {}",
                replica_id, region_id, other
            )));
        }
        region.members.insert(addr.to_string(), replica_id);
        region.next_replica_id = region.next_replica_id.max(replica_id);
        region.state = RegionState::Active;
        Ok(())
    }

    /// Drop the mapping for `addr`; absent addresses are ignored.
    pub fn remove_node_mapping(&mut self, region_id: GroupId, addr: &str) -> Result<()> {
        let region = self.region_mut(region_id)?;
        region.members.remove(addr);
        Ok(())
    }

    // === Queries ===

    pub fn free_nodes<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Result<Vec<NodeRecord>> {
        routing::select_free_nodes(self.nodes.values(), count, rng)
    }

    pub fn all_regions(&self) -> RoutingTable {
        self.regions.clone()
    }

    pub fn locate(&self, key: &str) -> Result<GroupId> {
        routing::locate(&self.regions, key)
    }

    pub fn region(&self, region_id: GroupId) -> Result<RegionDescriptor> {
        self.regions
            .get(&region_id)
            .cloned()
            .ok_or(Error::RegionNotFound(region_id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn current_region_id(&self) -> GroupId {
        self.current_region_id
    }

    fn region_mut(&mut self, region_id: GroupId) -> Result<&mut RegionDescriptor> {
        self.regions
            .get_mut(&region_id)
            .ok_or(Error::RegionNotFound(region_id))
    }

    #[cfg(test)]
    pub(crate) fn set_range(&mut self, region_id: GroupId, start: &str, end: &str) -> Result<()> {
        let region = self.region_mut(region_id)?;
        region.start = start.to_string();
        region.end = end.to_string();
        Ok(())
    }

    // === Snapshot ===

    pub fn write_snapshot(&self, writer: &mut dyn Write) -> Result<()> {
        let payload = bincode::serialize(self)?;
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Decode a snapshot. Nothing is returned unless it is fully valid.
    pub fn read_snapshot(reader: &mut dyn Read) -> Result<Self> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        if buf.len() < HEADER_LEN {
            return Err(Error::SnapshotCorrupted(format!(
                "truncated header ({} bytes)",
                buf.len()
            )));
        }
        if &buf[..8] != SNAPSHOT_MAGIC {
            return Err(Error::SnapshotCorrupted("bad magic".into()));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&buf[16..20]);
        let expected_crc = u32::from_le_bytes(crc_bytes);

        let payload = &buf[HEADER_LEN..];
        if payload.len() != len {
            return Err(Error::SnapshotCorrupted(format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                len
            )));
        }
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            return Err(Error::SnapshotCorrupted(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                expected_crc, actual_crc
            )));
        }
        bincode::deserialize(payload).map_err(|e| Error::SnapshotCorrupted(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn node(id: u64) -> NodeRecord {
        NodeRecord {
            node_id: id,
            raft_addr: format!("127.0.0.1:1200{}", id),
            service_addr: format!("127.0.0.1:1100{}", id),
            region_count: 0,
            announced_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_region_ids_increase() {
        let mut state = PlacementState::new();
        let ids: Vec<GroupId> = (0..5).map(|_| state.allocate_region_id()).collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);

        let table = state.all_regions();
        assert_eq!(table.len(), 5);
        let region = &table[&2];
        assert!(region.start.is_empty() && region.end.is_empty());
        assert!(region.members.is_empty());
        assert_eq!(region.state, RegionState::Allocated);
    }

    #[test]
    fn test_register_overwrites() {
        let mut state = PlacementState::new();
        state.register_node(node(1));
        let mut again = node(1);
        again.region_count = 4;
        state.register_node(again);
        assert_eq!(state.node_count(), 1);

        let mut rng = StdRng::seed_from_u64(1);
        let nodes = state.free_nodes(1, &mut rng).unwrap();
        assert_eq!(nodes[0].region_count, 4);
    }

    #[test]
    fn test_replica_mapping() {
        let mut state = PlacementState::new();
        let id = state.allocate_region_id();

        state.update_node_mapping(id, 1, "a:1").unwrap();
        state.update_node_mapping(id, 2, "b:1").unwrap();
        state.update_node_mapping(id, 4, "tmp:1").unwrap();
        let region = state.region(id).unwrap();
        assert_eq!(region.state, RegionState::Active);
        assert_eq!(region.replica_at("b:1"), Some(2));
        assert_eq!(region.next_replica_id, 4);

        // replica 2 is taken by b:1
        let err = state.update_node_mapping(id, 2, "c:1").unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
        // same binding again is fine
        state.update_node_mapping(id, 2, "b:1").unwrap();

        assert_eq!(state.allocate_replica_id(id).unwrap(), 5);
        state.remove_node_mapping(id, "tmp:1").unwrap();
        state.remove_node_mapping(id, "tmp:1").unwrap();
        assert_eq!(state.allocate_replica_id(id).unwrap(), 6);
        assert_eq!(state.region(id).unwrap().members.len(), 2);
    }

    #[test]
    fn test_unknown_region() {
        let mut state = PlacementState::new();
        assert!(matches!(
            state.allocate_replica_id(9),
            Err(Error::RegionNotFound(9))
        ));
        assert!(matches!(
            state.update_node_mapping(9, 1, "a:1"),
            Err(Error::RegionNotFound(9))
        ));
        assert!(state.remove_node_mapping(9, "a:1").is_err());
        assert!(state.region(9).is_err());
    }

    #[test]
    fn test_locate_unbounded_region() {
        let mut state = PlacementState::new();
        assert!(matches!(state.locate("k"), Err(Error::NoRegionFound(_))));
        let id = state.allocate_region_id();
        assert_eq!(state.locate("").unwrap(), id);
        assert_eq!(state.locate("anything").unwrap(), id);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut state = PlacementState::new();
        for id in 1..=3 {
            state.register_node(node(id));
        }
        let r = state.allocate_region_id();
        state.update_node_mapping(r, 1, "127.0.0.1:12001").unwrap();
        state.allocate_region_id();

        let mut buf = Vec::new();
        state.write_snapshot(&mut buf).unwrap();
        assert_eq!(&buf[..8], b"PDMETA01");

        let restored = PlacementState::read_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.all_regions(), state.all_regions());
        assert_eq!(restored.current_region_id(), 3);
    }

    #[test]
    fn test_snapshot_corruption_detected() {
        let mut state = PlacementState::new();
        state.register_node(node(1));
        state.allocate_region_id();
        let mut buf = Vec::new();
        state.write_snapshot(&mut buf).unwrap();

        let mut flipped = buf.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert!(matches!(
            PlacementState::read_snapshot(&mut flipped.as_slice()),
            Err(Error::SnapshotCorrupted(_))
        ));

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(PlacementState::read_snapshot(&mut bad_magic.as_slice()).is_err());

        let truncated = &buf[..buf.len() - 3];
        assert!(PlacementState::read_snapshot(&mut &truncated[..]).is_err());
        assert!(PlacementState::read_snapshot(&mut &b"PDMETA"[..]).is_err());
    }
}
