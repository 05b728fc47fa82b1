//! Node selection and key routing
//!
//! Free nodes are sampled uniformly without replacement. Key lookup walks
//! the routing table in ascending region id and returns the first region
//! whose range holds the key; ranges are not checked for overlap here.

use crate::common::{Error, Result};
use crate::consensus::GroupId;
use crate::placement::types::{NodeRecord, RoutingTable};
use rand::seq::SliceRandom;
use rand::Rng;

/// Pick `count` distinct nodes at random.
pub fn select_free_nodes<'a, R, I>(nodes: I, count: usize, rng: &mut R) -> Result<Vec<NodeRecord>>
where
    R: Rng + ?Sized,
    I: IntoIterator<Item = &'a NodeRecord>,
{
    let candidates: Vec<&NodeRecord> = nodes.into_iter().collect();
    if candidates.len() < count {
        return Err(Error::InsufficientNodes {
            needed: count,
            available: candidates.len(),
        });
    }
    Ok(candidates
        .choose_multiple(rng, count)
        .map(|n| (*n).clone())
        .collect())
}

/// Region whose range holds `key`.
pub fn locate(regions: &RoutingTable, key: &str) -> Result<GroupId> {
    regions
        .values()
        .find(|r| r.contains_key(key))
        .map(|r| r.region_id)
        .ok_or_else(|| Error::NoRegionFound(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::types::RegionDescriptor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn node(id: u64) -> NodeRecord {
        NodeRecord {
            node_id: id,
            raft_addr: format!("10.0.0.{}:12000", id),
            service_addr: format!("10.0.0.{}:11000", id),
            region_count: 0,
            announced_at_ms: 0,
        }
    }

    #[test]
    fn test_select_distinct() {
        let nodes: Vec<NodeRecord> = (1..=5).map(node).collect();
        let mut rng = StdRng::seed_from_u64(7);
        for count in 0..=5 {
            for _ in 0..20 {
                let picked = select_free_nodes(&nodes, count, &mut rng).unwrap();
                assert_eq!(picked.len(), count);
                let ids: HashSet<u64> = picked.iter().map(|n| n.node_id).collect();
                assert_eq!(ids.len(), count);
                assert!(ids.iter().all(|id| (1..=5).contains(id)));
            }
        }
    }

    #[test]
    fn test_select_insufficient() {
        let nodes: Vec<NodeRecord> = (1..=2).map(node).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let err = select_free_nodes(&nodes, 3, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientNodes {
                needed: 3,
                available: 2
            }
        ));

        let empty: Vec<NodeRecord> = Vec::new();
        assert!(select_free_nodes(&empty, 1, &mut rng).is_err());
        assert!(select_free_nodes(&empty, 0, &mut rng).unwrap().is_empty());
    }

    #[test]
    fn test_locate_first_match_wins() {
        let mut table = RoutingTable::new();
        let mut low = RegionDescriptor::unbounded(3);
        low.end = "m".into();
        let mut high = RegionDescriptor::unbounded(5);
        high.start = "m".into();
        table.insert(3, low);
        table.insert(5, high);

        assert_eq!(locate(&table, "").unwrap(), 3);
        assert_eq!(locate(&table, "apple").unwrap(), 3);
        assert_eq!(locate(&table, "m").unwrap(), 5);
        assert_eq!(locate(&table, "zebra").unwrap(), 5);

        // an overlapping unbounded region at a higher id never shadows
        table.insert(9, RegionDescriptor::unbounded(9));
        assert_eq!(locate(&table, "apple").unwrap(), 3);
    }

    #[test]
    fn test_locate_no_region() {
        let mut table = RoutingTable::new();
        assert!(matches!(
            locate(&table, "k"),
            Err(Error::NoRegionFound(_))
        ));

        let mut r = RegionDescriptor::unbounded(2);
        r.start = "a".into();
        r.end = "m".into();
        table.insert(2, r);
        assert!(locate(&table, "").is_err());
        assert!(locate(&table, "m").is_err());
    }
}
