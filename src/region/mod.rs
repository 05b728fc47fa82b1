//! Per-region data engine

pub mod kv;

pub use kv::{KvCommand, KvQuery, RegionKvStateMachine};
