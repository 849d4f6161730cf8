//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NodeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;

use crate::config::schema::NodeConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("network.public_ip '{0}' is not an IPv4 address")]
    InvalidPublicIp(String),

    #[error("engine.run_interval_ms must be greater than zero")]
    ZeroRunInterval,

    #[error("engine.max_shutdown_polls must be greater than zero when set")]
    ZeroShutdownPolls,

    #[error("upnp.discovery_timeout_ms must be greater than zero")]
    ZeroDiscoveryTimeout,

    #[error("upnp.mapping_timeout_ms must be greater than zero")]
    ZeroMappingTimeout,

    #[error("observability.metrics_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),
}

pub fn validate_config(config: &NodeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let public_ip = config.network.public_ip.trim();
    if !public_ip.is_empty() && public_ip.parse::<Ipv4Addr>().is_err() {
        errors.push(ValidationError::InvalidPublicIp(public_ip.to_string()));
    }

    if config.engine.run_interval_ms == 0 {
        errors.push(ValidationError::ZeroRunInterval);
    }
    if config.engine.max_shutdown_polls == Some(0) {
        errors.push(ValidationError::ZeroShutdownPolls);
    }

    if config.upnp.discovery_timeout_ms == 0 {
        errors.push(ValidationError::ZeroDiscoveryTimeout);
    }
    if config.upnp.mapping_timeout_ms == 0 {
        errors.push(ValidationError::ZeroMappingTimeout);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
