//! Placement driver: metadata state machine, orchestrator and HTTP API

pub mod driver;
pub mod http;
pub mod metadata;
pub mod peer;
pub mod routing;
pub mod server;
pub mod state_machine;
pub mod types;

pub use driver::{Alert, PlacementDriver};
pub use http::{create_router, PdState};
pub use metadata::PlacementState;
pub use peer::{HttpPeerClient, PeerClient};
pub use server::PdServer;
pub use state_machine::MetadataStateMachine;
pub use types::{
    Command, NodeRecord, Query, RegionDescriptor, RegionState, RoutingTable, PD_GROUP_ID,
};
