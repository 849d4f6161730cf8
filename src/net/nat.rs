//! NAT traversal via UPnP Internet Gateway Devices.
//!
//! # Responsibilities
//! - Discover a gateway on the local network within a bounded time
//! - Map an external TCP port to our listen port
//! - Report the public endpoint and the local interface the gateway sees
//! - Release the mapping on shutdown
//!
//! Everything here is best effort. Failures are logged and surface as
//! `None`; callers always have a fallback.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use igd_next::aio::tokio::{search_gateway, Tokio};
use igd_next::aio::Gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time;

use crate::config::UpnpConfig;
use crate::net::host::is_private;
use crate::observability::metrics;

/// A port mapping negotiated with a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatMapping {
    /// Public address and external port peers can dial.
    pub external: SocketAddr,
    /// Local interface address the mapping forwards to.
    pub local_interface: IpAddr,
}

/// Seam for NAT traversal strategies.
pub trait NatTraversal: Send + Sync + 'static {
    /// Negotiate a mapping to `listen_port`. `None` when no gateway answered
    /// or the gateway refused.
    fn traverse_nat(
        &self,
        if_addresses: &[IpAddr],
        listen_port: u16,
    ) -> impl Future<Output = Option<NatMapping>>;

    /// Undo a mapping returned by [`traverse_nat`](Self::traverse_nat).
    fn release(&self, _mapping: &NatMapping) -> impl Future<Output = ()> {
        async {}
    }
}

/// Traversal that never maps anything. Useful when the host is known to be
/// directly reachable, and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNat;

impl NatTraversal for NoNat {
    async fn traverse_nat(&self, _if_addresses: &[IpAddr], _listen_port: u16) -> Option<NatMapping> {
        None
    }
}

#[derive(Debug, Error)]
enum NatError {
    #[error("gateway discovery failed: {0}")]
    Discovery(#[from] igd_next::SearchError),

    #[error("gateway did not report an external address: {0}")]
    ExternalIp(#[from] igd_next::GetExternalIpError),

    #[error("gateway refused port mapping: {0}")]
    Mapping(#[from] igd_next::AddAnyPortError),

    #[error("no local interface routes to gateway {0}")]
    NoLocalInterface(SocketAddr),

    #[error("gateway exchange timed out after {0:?}")]
    Timeout(Duration),
}

/// UPnP IGD traversal backed by `igd-next`.
#[derive(Debug, Clone, Default)]
pub struct Upnp {
    config: UpnpConfig,
}

impl Upnp {
    pub fn new(config: UpnpConfig) -> Self {
        Self { config }
    }

    fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.config.mapping_timeout_ms)
    }

    /// [`map`](Self::map) with the whole exchange time-bounded; a gateway
    /// that stops answering mid-way must not stall startup.
    async fn map_within_deadline(&self, if_addresses: &[IpAddr], listen_port: u16) -> Result<NatMapping, NatError> {
        let limit = self.exchange_timeout();
        time::timeout(limit, self.map(if_addresses, listen_port))
            .await
            .map_err(|_| NatError::Timeout(limit))?
    }

    async fn discover(&self) -> Result<Gateway<Tokio>, NatError> {
        let options = SearchOptions {
            timeout: Some(Duration::from_millis(self.config.discovery_timeout_ms)),
            ..Default::default()
        };
        Ok(search_gateway(options).await?)
    }

    async fn map(&self, if_addresses: &[IpAddr], listen_port: u16) -> Result<NatMapping, NatError> {
        let gateway = self.discover().await?;
        let gateway_addr = SocketAddr::from(gateway.addr);
        tracing::debug!(gateway = %gateway_addr, "UPnP gateway found");

        let local_interface = local_interface_for(gateway_addr, if_addresses)
            .await
            .ok_or(NatError::NoLocalInterface(gateway_addr))?;
        let local = SocketAddr::new(local_interface, listen_port);

        // Same external port as internal first, then whatever the gateway offers.
        let external_port = match gateway
            .add_port(
                PortMappingProtocol::TCP,
                listen_port,
                local,
                self.config.lease_secs,
                &self.config.description,
            )
            .await
        {
            Ok(()) => listen_port,
            Err(e) => {
                tracing::debug!(port = listen_port, error = %e, "Preferred external port refused");
                gateway
                    .add_any_port(
                        PortMappingProtocol::TCP,
                        local,
                        self.config.lease_secs,
                        &self.config.description,
                    )
                    .await?
            }
        };

        let external_ip = gateway.get_external_ip().await?;

        Ok(NatMapping {
            external: SocketAddr::new(external_ip.into(), external_port),
            local_interface,
        })
    }
}

impl NatTraversal for Upnp {
    async fn traverse_nat(&self, if_addresses: &[IpAddr], listen_port: u16) -> Option<NatMapping> {
        match self.map_within_deadline(if_addresses, listen_port).await {
            Ok(mapping) if !mapping.external.ip().is_unspecified() => {
                tracing::info!(
                    external = %mapping.external,
                    local_interface = %mapping.local_interface,
                    "UPnP port mapping established"
                );
                metrics::record_upnp_mapping("mapped");
                Some(mapping)
            }
            Ok(mapping) => {
                tracing::warn!(external = %mapping.external, "UPnP gateway reported an unspecified address");
                metrics::record_upnp_mapping("unspecified");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "UPnP traversal failed");
                metrics::record_upnp_mapping("failed");
                None
            }
        }
    }

    async fn release(&self, mapping: &NatMapping) {
        let removal = async {
            let gateway = match self.discover().await {
                Ok(gateway) => gateway,
                Err(e) => {
                    tracing::debug!(error = %e, "UPnP gateway gone, mapping left to expire");
                    return;
                }
            };
            match gateway
                .remove_port(PortMappingProtocol::TCP, mapping.external.port())
                .await
            {
                Ok(()) => tracing::info!(external = %mapping.external, "UPnP port mapping removed"),
                Err(e) => tracing::warn!(external = %mapping.external, error = %e, "Failed to remove UPnP mapping"),
            }
        };
        if time::timeout(self.exchange_timeout(), removal).await.is_err() {
            tracing::warn!(external = %mapping.external, "UPnP gateway stopped answering, mapping left to expire");
        }
    }
}

/// The local address that routes to `gateway`, falling back to the first
/// private IPv4 interface address.
async fn local_interface_for(gateway: SocketAddr, if_addresses: &[IpAddr]) -> Option<IpAddr> {
    let routed = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
        socket.connect(gateway).await.ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_unspecified()).then_some(ip)
    }
    .await;

    routed.or_else(|| {
        if_addresses
            .iter()
            .copied()
            .find(|addr| addr.is_ipv4() && is_private(addr))
    })
}
