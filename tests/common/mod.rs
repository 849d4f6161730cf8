//! Shared utilities for integration tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hostnet::config::{EngineConfig, NetworkPreferences};
use hostnet::net::{Connection, HostNetwork, NatMapping, NatTraversal, Network, NetworkHooks, NoNat};

/// Hooks that count every invocation and keep accepted connections alive.
#[derive(Default)]
pub struct CountingHooks {
    pub startups: AtomicUsize,
    pub runs: AtomicUsize,
    pub connections: AtomicUsize,
    pub shutdown_polls: AtomicUsize,
    /// Number of polls answered with "not ready".
    pub not_ready_for: usize,
    pub held: Mutex<Vec<Arc<Connection>>>,
}

impl NetworkHooks for CountingHooks {
    fn on_startup(&self) {
        self.startups.fetch_add(1, Ordering::SeqCst);
    }

    fn on_run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection(&self, connection: Arc<Connection>) {
        self.held.lock().unwrap().push(connection);
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn on_shutdown(&self) -> bool {
        self.shutdown_polls.fetch_add(1, Ordering::SeqCst) >= self.not_ready_for
    }
}

/// Gateway stand-in that always grants the same mapping and counts calls.
pub struct MappingNat {
    pub mapping: NatMapping,
    pub traversals: AtomicUsize,
    pub releases: AtomicUsize,
    /// Listen port requested by the most recent traversal.
    pub last_port: Mutex<Option<u16>>,
}

impl MappingNat {
    #[allow(dead_code)]
    pub fn new(external: SocketAddr) -> Self {
        Self {
            mapping: NatMapping {
                external,
                local_interface: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            },
            traversals: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            last_port: Mutex::new(None),
        }
    }
}

impl NatTraversal for MappingNat {
    async fn traverse_nat(&self, _if_addresses: &[IpAddr], listen_port: u16) -> Option<NatMapping> {
        self.traversals.fetch_add(1, Ordering::SeqCst);
        *self.last_port.lock().unwrap() = Some(listen_port);
        Some(self.mapping)
    }

    async fn release(&self, mapping: &NatMapping) {
        assert_eq!(*mapping, self.mapping);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Preferences that bind an ephemeral port and never touch UPnP.
#[allow(dead_code)]
pub fn ephemeral_prefs() -> NetworkPreferences {
    NetworkPreferences::new(0, "", false, false)
}

/// An engine with no NAT traversal and no real interface enumeration.
#[allow(dead_code)]
pub fn test_network(prefs: NetworkPreferences, hooks: CountingHooks) -> Network<CountingHooks, NoNat> {
    Network::with_host(prefs, EngineConfig::default(), hooks, NoNat, HostNetwork::default())
}

#[allow(dead_code)]
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Poll `condition` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// An engine whose gateway always grants `nat`'s mapping.
#[allow(dead_code)]
pub fn mapped_network(prefs: NetworkPreferences, nat: MappingNat) -> Network<CountingHooks, MappingNat> {
    Network::with_host(prefs, EngineConfig::default(), CountingHooks::default(), nat, HostNetwork::default())
}
