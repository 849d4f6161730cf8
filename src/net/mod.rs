//! Host network layer.
//!
//! # Data Flow
//! ```text
//! Network::start()
//!     → host.rs (bind 0.0.0.0:listen_port, ephemeral fallback)
//!     → host.rs (endpoint precedence: user > confirmed > UPnP > private)
//!         → nat.rs (UPnP gateway mapping, best effort)
//!     → NetworkHooks::on_startup
//!     → connection.rs (accept loop → Arc<Connection> → on_connection)
//!     → engine.rs (tick every run interval → on_run)
//!
//! Network::stop()
//!     → on_shutdown polled each tick until ready
//!     → acceptor closed, NAT mapping released
//!
//! Connection States:
//!     Idle → Accepting | Connecting → Established → Closed
//! ```
//!
//! # Design Decisions
//! - One engine thread runs accepts, ticks and hooks sequentially
//! - start/stop serialize on a mutex and block until the transition lands
//! - Endpoint resolution never fails startup; binding does

pub mod connection;
pub mod engine;
pub mod error;
pub mod host;
pub mod nat;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use engine::{Network, NetworkHooks, NetworkState, NoHooks};
pub use error::{ConnectionError, NetworkError};
pub use host::{EndpointSource, HostNetwork, ResolvedEndpoint};
pub use nat::{NatMapping, NatTraversal, NoNat, Upnp};
