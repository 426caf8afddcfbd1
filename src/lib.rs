//! # chat-mesh: coordination core for a peer-to-peer chat backend
//!
//! Several independent chat servers present one logical service. Clients
//! attach to any server, while client identities and room ids stay unique
//! across the whole cluster without a shared database. This crate is the
//! coordination subsystem that makes that work:
//!
//! - **Cluster state** ([`ClusterState`]) - view, leader and the global
//!   client/room registries with atomic check-and-reserve
//! - **Fast Bully election** ([`Election`]) - picks the most senior live server
//! - **Heartbeat** ([`Heartbeat`]) - leader probes the view, followers probe
//!   the leader and re-elect on failure
//! - **Recovery** ([`Recovery`]) - rebuilds view, leader and registries at
//!   startup
//! - **Global registry** ([`Coordinator`]) - leader-mediated two-step
//!   reservation of identities and rooms
//! - **Messenger** ([`Messenger`]) - one-shot peer requests and broadcasts
//!
//! ## Quick Start
//!
//! ```ignore
//! use chat_mesh::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let topology = Topology::load("servers.conf", "s1")?;
//!     let node = CoordinatorNode::new(topology, ClusterConfig::default());
//!     node.start().await?;
//!
//!     let registry = node.coordinator();
//!     if registry.request_identity("alice").await? {
//!         // create the client locally, then:
//!         registry.confirm_identity("alice").await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Wire protocol
//!
//! Peers exchange one JSON object per line over a fresh TCP connection per
//! request. See [`Message`] for the record types.

pub mod config;
pub mod election;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod messenger;
pub mod network;
pub mod node;
pub mod recovery;
pub mod registry;
pub mod state;
pub mod types;

// Public API exports
pub use config::{ClusterConfig, ServerEntry, Topology, parse_servers};
pub use election::Election;
pub use error::{MeshError, MeshResult};
pub use handler::PeerHandler;
pub use heartbeat::{Heartbeat, HeartbeatOutcome};
pub use messenger::Messenger;
pub use network::{Connection, Listener, Message, ReservationStep};
pub use node::{ClusterStatus, CoordinatorNode};
pub use recovery::{Recovery, RecoveryOutcome};
pub use registry::Coordinator;
pub use state::{ClusterState, Reservation};
pub use types::{ServerDescriptor, main_hall, parse_priority};

pub use chrono::{DateTime, Utc};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use chat_mesh::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ClusterConfig, Topology};
    pub use crate::error::{MeshError, MeshResult};
    pub use crate::node::{ClusterStatus, CoordinatorNode};
    pub use crate::registry::Coordinator;
    pub use crate::state::ClusterState;
    pub use crate::types::ServerDescriptor;
}
