//! # pdkv
//!
//! A placement driver (PD) for a sharded, replicated key-value store:
//! - Node registry fed by periodic self-announces
//! - Region allocation and key routing over `[start, end)` ranges
//! - Region lifecycle orchestration (create, start, membership changes)
//! - Replicated metadata state machine with checksummed snapshots
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        PD group (group id 1)             │
//! │  MetadataStateMachine on every member    │
//! │   - node registry                        │
//! │   - routing table                        │
//! └───────────┬──────────────────────────────┘
//!             │ propose / read
//! ┌───────────▼──────────────┐   HTTP   ┌──────────────┐
//! │ PlacementDriver (node 1) │◄────────►│ node 2, 3... │
//! └───────────┬──────────────┘          └──────────────┘
//!             │ start / join
//!   ┌─────────┴──────────┬──────────────┐
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ Region 2   │   │ Region 3   │   │ Region 4   │
//! │ (KV group) │   │ (KV group) │   │ (KV group) │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a three node development cluster
//! ```bash
//! pd-server --nodes 3 --replication-factor 3
//! ```
//!
//! ### Use the CLI
//! ```bash
//! pdctl --server 127.0.0.1:11001 create
//! pdctl --server 127.0.0.1:11001 locate user42
//! pdctl --server 127.0.0.1:11001 members 2
//! pdctl --server 127.0.0.1:11001 health
//! ```

pub mod common;
pub mod consensus;
pub mod placement;
pub mod region;

// Re-export commonly used types
pub use common::{Error, PdConfig, Result};
pub use consensus::{Consensus, LocalNetwork, LocalNodeHost, StateMachine};
pub use placement::{HttpPeerClient, PdServer, PeerClient, PlacementDriver};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
