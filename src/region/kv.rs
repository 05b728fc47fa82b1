//! Region data engine
//!
//! One [`RegionKvStateMachine`] runs per region replica and serves a plain
//! string key-value command set. Commands and queries are JSON, tagged by
//! `op`; the snapshot is the JSON encoding of the whole map.

use crate::common::{Error, Result};
use crate::consensus::{GroupId, ReplicaId, StateMachine, StateMachineFactory};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Mutating region commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Read-only region queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvQuery {
    Get { key: String },
    List,
}

pub struct RegionKvStateMachine {
    region_id: GroupId,
    replica_id: ReplicaId,
    data: Mutex<BTreeMap<String, String>>,
}

impl RegionKvStateMachine {
    pub fn new(region_id: GroupId, replica_id: ReplicaId) -> Self {
        Self {
            region_id,
            replica_id,
            data: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn factory() -> StateMachineFactory {
        Arc::new(|region, replica| {
            Box::new(RegionKvStateMachine::new(region, replica)) as Box<dyn StateMachine>
        })
    }

    pub fn region_id(&self) -> GroupId {
        self.region_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::UnsupportedOperation(e.to_string()))
}

impl StateMachine for RegionKvStateMachine {
    /// Returns the previous value (`null` if none) as JSON.
    fn update(&self, entry: &[u8]) -> Result<Vec<u8>> {
        let cmd: KvCommand = decode(entry)?;
        let mut data = self.data.lock();
        let previous = match cmd {
            KvCommand::Set { key, value } => data.insert(key, value),
            KvCommand::Delete { key } => match data.remove(&key) {
                Some(old) => Some(old),
                None => return Err(Error::KeyNotFound(key)),
            },
        };
        Ok(serde_json::to_vec(&previous)?)
    }

    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>> {
        let query: KvQuery = decode(query)?;
        let data = self.data.lock();
        match query {
            KvQuery::Get { key } => match data.get(&key) {
                Some(value) => Ok(serde_json::to_vec(value)?),
                None => Err(Error::KeyNotFound(key)),
            },
            KvQuery::List => Ok(serde_json::to_vec(&*data)?),
        }
    }

    fn save_snapshot(&self, writer: &mut dyn Write) -> Result<()> {
        let data = self.data.lock();
        serde_json::to_writer(writer, &*data)?;
        Ok(())
    }

    fn recover_from_snapshot(&self, reader: &mut dyn Read) -> Result<()> {
        let restored: BTreeMap<String, String> = serde_json::from_reader(reader)
            .map_err(|e| Error::SnapshotCorrupted(e.to_string()))?;
        *self.data.lock() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(c: KvCommand) -> Vec<u8> {
        serde_json::to_vec(&c).unwrap()
    }

    fn query(q: KvQuery) -> Vec<u8> {
        serde_json::to_vec(&q).unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let sm = RegionKvStateMachine::new(2, 1);
        let prev = sm
            .update(&cmd(KvCommand::Set {
                key: "a".into(),
                value: "1".into(),
            }))
            .unwrap();
        assert_eq!(prev, b"null");

        let prev = sm
            .update(&cmd(KvCommand::Set {
                key: "a".into(),
                value: "2".into(),
            }))
            .unwrap();
        assert_eq!(serde_json::from_slice::<Option<String>>(&prev).unwrap(), Some("1".into()));

        let got = sm.lookup(&query(KvQuery::Get { key: "a".into() })).unwrap();
        assert_eq!(serde_json::from_slice::<String>(&got).unwrap(), "2");

        sm.update(&cmd(KvCommand::Delete { key: "a".into() })).unwrap();
        let err = sm
            .lookup(&query(KvQuery::Get { key: "a".into() }))
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));

        let err = sm
            .update(&cmd(KvCommand::Delete { key: "a".into() }))
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
    }

    #[test]
    fn test_unknown_op_is_unsupported() {
        let sm = RegionKvStateMachine::new(2, 1);
        let err = sm.update(br#"{"op":"increment","key":"a"}"#).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let sm = RegionKvStateMachine::new(2, 1);
        for (k, v) in [("x", "1"), ("y", "2")] {
            sm.update(&cmd(KvCommand::Set {
                key: k.into(),
                value: v.into(),
            }))
            .unwrap();
        }
        let mut buf = Vec::new();
        sm.save_snapshot(&mut buf).unwrap();

        let restored = RegionKvStateMachine::new(2, 3);
        restored.recover_from_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(
            restored.lookup(&query(KvQuery::List)).unwrap(),
            sm.lookup(&query(KvQuery::List)).unwrap()
        );
        assert_eq!(restored.replica_id(), 3);

        let err = restored
            .recover_from_snapshot(&mut &b"garbage"[..])
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotCorrupted(_)));
    }
}
