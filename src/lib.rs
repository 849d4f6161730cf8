//! Host networking layer for a peer-to-peer node.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;

pub use config::schema::{NetworkPreferences, NodeConfig};
pub use net::{Connection, Network, NetworkHooks};
