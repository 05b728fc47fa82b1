//! Snapshot, log compaction and restart recovery
mod support;

use pdkv::placement::PD_GROUP_ID;
use pdkv::region::{KvCommand, KvQuery};
use pdkv::Consensus;
use std::time::Duration;
use support::{node_config, TestCluster};

const T: Duration = Duration::from_secs(1);

fn set(key: &str, value: &str) -> Vec<u8> {
    serde_json::to_vec(&KvCommand::Set {
        key: key.into(),
        value: value.into(),
    })
    .unwrap()
}

fn get(key: &str) -> Vec<u8> {
    serde_json::to_vec(&KvQuery::Get { key: key.into() }).unwrap()
}

#[tokio::test]
async fn test_new_member_restores_from_snapshot() {
    let mut cluster = TestCluster::start(3, 4).await;
    for _ in 0..3 {
        cluster.driver(1).create_region(3).await.unwrap();
    }
    let (first, last) = cluster.network.log_bounds(PD_GROUP_ID).unwrap();
    assert!(first > 1, "log was not compacted");
    assert!(last >= first);

    let fourth = cluster.add_node(node_config(4)).await.unwrap();
    let expected = cluster.driver(1).list_regions().await.unwrap();
    assert_eq!(fourth.list_regions().await.unwrap(), expected);
    assert_eq!(expected.len(), 3);

    // the restored registry includes the three first nodes and node 4
    let id = fourth.create_region(4).await.unwrap();
    assert_eq!(fourth.get_membership(id).await.unwrap().replicas.len(), 4);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_crashed_node_rejoins_with_its_regions() {
    let mut cluster = TestCluster::start(3, 4).await;
    let region = cluster.driver(1).create_region(3).await.unwrap();
    for i in 0..10 {
        cluster.hosts[&1]
            .propose(region, set(&format!("k{}", i), "before"), T)
            .await
            .unwrap();
    }
    assert!(cluster.network.snapshot_index(region, 3).is_some());

    cluster.crash(3).await;
    for i in 0..10 {
        cluster.hosts[&2]
            .propose(region, set(&format!("k{}", i), "after"), T)
            .await
            .unwrap();
        cluster.driver(1).announce().await.unwrap();
    }

    let restarted = cluster.add_node(node_config(3)).await.unwrap();
    assert_eq!(restarted.restart_local_regions().await.unwrap(), 1);
    assert_eq!(restarted.hosted_regions(), vec![region]);
    assert_eq!(cluster.network.live_replicas(region), vec![1, 2, 3]);

    let value = cluster.hosts[&3].read(region, get("k7"), T).await.unwrap();
    assert_eq!(serde_json::from_slice::<String>(&value).unwrap(), "after");
    assert_eq!(
        restarted.list_regions().await.unwrap(),
        cluster.driver(1).list_regions().await.unwrap()
    );

    // already running regions are not started twice
    assert_eq!(restarted.restart_local_regions().await.unwrap(), 0);

    cluster.shutdown().await;
}
