//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a node's
//! host-network layer. All types derive Serde traits for deserialization
//! from config files.

use serde::{Deserialize, Serialize};

/// Default TCP port peers expect to reach us on.
pub const DEFAULT_LISTEN_PORT: u16 = 30303;

/// Root configuration for the node.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Host network preferences (listen port, public IP, UPnP).
    pub network: NetworkPreferences,

    /// Event loop tuning.
    pub engine: EngineConfig,

    /// UPnP gateway negotiation settings.
    pub upnp: UpnpConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Network preferences.
///
/// Immutable once handed to [`Network`](crate::net::Network). Range checks
/// are the caller's job; see [`validate_config`](crate::config::validation::validate_config).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkPreferences {
    /// Preferred listen port. An ephemeral port is used if it is taken.
    pub listen_port: u16,

    /// User-provided public IP. Empty means autodetect.
    pub public_ip: String,

    /// Attempt UPnP port mapping.
    pub upnp: bool,

    /// Allow private addresses to be advertised as our endpoint.
    pub local_networking: bool,
}

impl NetworkPreferences {
    pub fn new(listen_port: u16, public_ip: impl Into<String>, upnp: bool, local_networking: bool) -> Self {
        Self {
            listen_port,
            public_ip: public_ip.into(),
            upnp,
            local_networking,
        }
    }
}

impl Default for NetworkPreferences {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            public_ip: String::new(),
            upnp: true,
            local_networking: false,
        }
    }
}

/// Event loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maintenance tick period in milliseconds.
    pub run_interval_ms: u64,

    /// Cap on shutdown polls before the listener is closed regardless.
    /// `None` polls until the hook reports ready.
    pub max_shutdown_polls: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_interval_ms: 10,
            max_shutdown_polls: None,
        }
    }
}

/// UPnP configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpnpConfig {
    /// Gateway discovery timeout in milliseconds.
    pub discovery_timeout_ms: u64,

    /// Upper bound on a whole gateway exchange (discovery, mapping and
    /// external address lookup, or removal), in milliseconds.
    pub mapping_timeout_ms: u64,

    /// Mapping lease in seconds (0 = gateway default).
    pub lease_secs: u32,

    /// Description attached to the port mapping.
    pub description: String,
}

impl Default for UpnpConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 2000,
            mapping_timeout_ms: 5000,
            lease_secs: 0,
            description: "hostnet".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}
