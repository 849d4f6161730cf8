//! Host address discovery and listener binding.
//!
//! # Responsibilities
//! - Enumerate interface addresses (private and public)
//! - Pick the endpoint peers should dial us on
//! - Remember public addresses confirmed by peers or the gateway
//! - Bind the IPv4 listener, falling back to an ephemeral port
//!
//! # Endpoint precedence
//! ```text
//! User provided > Confirmed public > UPnP [> Private] > Unspecified
//! ```

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;

use crate::config::NetworkPreferences;
use crate::net::error::NetworkError;
use crate::net::nat::{NatMapping, NatTraversal};

/// Where a resolved public endpoint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    /// `public_ip` from the preferences.
    UserProvided,
    /// An address already present in the confirmed public set.
    Confirmed,
    /// A gateway port mapping.
    Upnp(NatMapping),
    /// A private interface address (local networking only).
    Private,
}

/// Result of endpoint resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: SocketAddr,
    pub source: EndpointSource,
}

/// Static view of the host's network interfaces plus the public addresses
/// we have learned. Not thread-safe; the owning engine serializes access.
#[derive(Debug, Clone, Default)]
pub struct HostNetwork {
    /// Interface addresses in OS enumeration order.
    if_addresses: Vec<IpAddr>,
    /// Public addresses that peers (can) know us by.
    public_addresses: BTreeSet<IpAddr>,
    /// Subset of `public_addresses` only a live gateway mapping vouches for.
    mapped_addresses: BTreeSet<IpAddr>,
}

impl HostNetwork {
    /// Capture the host's current interface addresses.
    pub fn new() -> Self {
        Self::with_interfaces(interface_addresses())
    }

    pub fn with_interfaces(if_addresses: Vec<IpAddr>) -> Self {
        Self {
            if_addresses,
            public_addresses: BTreeSet::new(),
            mapped_addresses: BTreeSet::new(),
        }
    }

    pub fn interface_addresses(&self) -> &[IpAddr] {
        &self.if_addresses
    }

    pub fn public_addresses(&self) -> &BTreeSet<IpAddr> {
        &self.public_addresses
    }

    /// Record an address a peer confirmed we are reachable on. A peer
    /// confirmation outlives any gateway mapping for the same address.
    /// Unspecified addresses are never stored.
    pub fn add_public_address(&mut self, addr: IpAddr) -> bool {
        if addr.is_unspecified() {
            return false;
        }
        self.mapped_addresses.remove(&addr);
        self.public_addresses.insert(addr)
    }

    /// Forget the external address of a released gateway mapping, unless
    /// it was confirmed some other way.
    pub fn release_mapping(&mut self, mapping: &NatMapping) -> bool {
        let ip = mapping.external.ip();
        if self.mapped_addresses.remove(&ip) {
            self.public_addresses.remove(&ip);
            return true;
        }
        false
    }

    /// Fold addresses learned on a copy of this host back in.
    pub fn merge(&mut self, resolved: &HostNetwork) {
        for addr in &resolved.public_addresses {
            if resolved.mapped_addresses.contains(addr) {
                self.add_mapped_address(*addr);
            } else {
                self.add_public_address(*addr);
            }
        }
    }

    fn add_mapped_address(&mut self, addr: IpAddr) {
        if !addr.is_unspecified() && self.public_addresses.insert(addr) {
            self.mapped_addresses.insert(addr);
        }
    }

    /// Choose the endpoint peers should use to reach us on `listen_port`.
    ///
    /// Returns `None` when no source yields an address; the node then only
    /// listens. The chosen public address is added to the confirmed set.
    pub async fn resolve_public_endpoint<N: NatTraversal>(
        &mut self,
        prefs: &NetworkPreferences,
        listen_port: u16,
        nat: &N,
    ) -> Option<ResolvedEndpoint> {
        let requested = requested_public_ip(prefs);

        if let Some(ip) = requested {
            if is_public(&ip) || (is_private(&ip) && prefs.local_networking) {
                self.add_public_address(ip);
                return Some(ResolvedEndpoint {
                    endpoint: SocketAddr::new(ip, listen_port),
                    source: EndpointSource::UserProvided,
                });
            }
            tracing::warn!(
                public_ip = %ip,
                local_networking = prefs.local_networking,
                "Ignoring configured public IP"
            );
        }

        if let Some(ip) = self.public_addresses.iter().find(|ip| ip.is_ipv4()) {
            return Some(ResolvedEndpoint {
                endpoint: SocketAddr::new(*ip, listen_port),
                source: EndpointSource::Confirmed,
            });
        }

        if prefs.upnp {
            if let Some(mapping) = nat.traverse_nat(&self.if_addresses, listen_port).await {
                if !mapping.external.ip().is_unspecified() && !mapping.local_interface.is_unspecified() {
                    self.add_mapped_address(mapping.external.ip());
                    return Some(ResolvedEndpoint {
                        endpoint: mapping.external,
                        source: EndpointSource::Upnp(mapping),
                    });
                }
            }
        }

        if requested.is_none() && prefs.local_networking {
            if let Some(ip) = self
                .if_addresses
                .iter()
                .find(|ip| ip.is_ipv4() && is_private(ip))
            {
                return Some(ResolvedEndpoint {
                    endpoint: SocketAddr::new(*ip, listen_port),
                    source: EndpointSource::Private,
                });
            }
        }

        None
    }
}

/// Parsed `public_ip` preference. Empty, unparsable and unspecified values
/// all count as unset.
fn requested_public_ip(prefs: &NetworkPreferences) -> Option<IpAddr> {
    let raw = prefs.public_ip.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<IpAddr>() {
        Ok(ip) if !ip.is_unspecified() => Some(ip),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(public_ip = %raw, error = %e, "Configured public IP does not parse");
            None
        }
    }
}

/// Addresses currently assigned to this host's interfaces, in OS order.
/// An enumeration failure yields an empty list.
pub fn interface_addresses() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.into_iter().map(|iface| iface.ip()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to enumerate network interfaces");
            Vec::new()
        }
    }
}

/// Bind `0.0.0.0:listen_port`, or an OS-assigned port if that fails.
/// Returns the listener and the port actually bound.
pub async fn bind_and_listen(prefs: &NetworkPreferences) -> Result<(TcpListener, u16), NetworkError> {
    let bind = |port: u16| async move {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let port = listener.local_addr()?.port();
        Ok::<_, io::Error>((listener, port))
    };

    match bind(prefs.listen_port).await {
        Ok(bound) => Ok(bound),
        Err(e) if prefs.listen_port != 0 => {
            tracing::warn!(
                port = prefs.listen_port,
                error = %e,
                "Preferred listen port unavailable, falling back to ephemeral port"
            );
            bind(0).await.map_err(|source| NetworkError::Bind {
                port: prefs.listen_port,
                source,
            })
        }
        Err(source) => Err(NetworkError::Bind { port: 0, source }),
    }
}

pub fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

pub fn is_local_host(addr: &IpAddr) -> bool {
    addr.is_loopback()
}

pub fn is_public(addr: &IpAddr) -> bool {
    if addr.is_unspecified() || addr.is_multicast() || is_local_host(addr) || is_private(addr) {
        return false;
    }
    match addr {
        IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_broadcast(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}
