//! End-to-end tests for the network engine lifecycle.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use hostnet::config::NetworkPreferences;
use hostnet::net::{ConnectionState, NetworkState};

mod common;

use common::{ephemeral_prefs, loopback, mapped_network, test_network, wait_until, CountingHooks, MappingNat};

#[test]
fn sequential_connections_each_reach_on_connection() {
    let net = test_network(ephemeral_prefs(), CountingHooks::default());
    net.start(true).unwrap();
    let port = net.listen_port().unwrap();

    let mut clients = Vec::new();
    for n in 1..=10 {
        clients.push(TcpStream::connect(loopback(port)).expect("acceptor still open"));
        assert!(
            wait_until(Duration::from_secs(2), || net.hooks().connections.load(Ordering::SeqCst) == n),
            "connection {} not delivered",
            n
        );
    }

    {
        let held = net.hooks().held.lock().unwrap();
        assert_eq!(held.len(), 10);
        for (connection, client) in held.iter().zip(&clients) {
            assert_eq!(connection.state(), ConnectionState::Established);
            assert_eq!(connection.remote_endpoint().unwrap(), client.local_addr().unwrap());
        }
    }

    net.stop(true);
    assert_eq!(net.hooks().connections.load(Ordering::SeqCst), 10);
}

#[test]
fn concurrent_starts_bind_once() {
    let net = Arc::new(test_network(ephemeral_prefs(), CountingHooks::default()));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let net = net.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                net.start(true)
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(net.state(), NetworkState::Running);
    assert_eq!(net.hooks().startups.load(Ordering::SeqCst), 1);

    net.stop(true);
    assert_eq!(net.state(), NetworkState::Stopped);
}

#[test]
fn concurrent_stops_shut_down_once() {
    let hooks = CountingHooks {
        not_ready_for: 2,
        ..Default::default()
    };
    let net = Arc::new(test_network(ephemeral_prefs(), hooks));
    net.start(true).unwrap();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let net = net.clone();
            thread::spawn(move || net.stop(true))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(net.state(), NetworkState::Stopped);
    assert_eq!(net.hooks().shutdown_polls.load(Ordering::SeqCst), 3);
}

#[test]
fn occupied_listen_port_falls_back() {
    let occupied = TcpListener::bind("0.0.0.0:0").unwrap();
    let taken = occupied.local_addr().unwrap().port();

    let net = test_network(NetworkPreferences::new(taken, "", false, false), CountingHooks::default());
    net.start(true).unwrap();

    let bound = net.listen_port().unwrap();
    assert_ne!(bound, taken);
    TcpStream::connect(loopback(bound)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        net.hooks().connections.load(Ordering::SeqCst) == 1
    }));

    net.stop(true);
}

#[test]
fn stop_waits_for_shutdown_hook_and_then_closes_acceptor() {
    let hooks = CountingHooks {
        not_ready_for: 3,
        ..Default::default()
    };
    let net = test_network(ephemeral_prefs(), hooks);
    net.start(true).unwrap();
    let port = net.listen_port().unwrap();

    net.stop(true);

    assert_eq!(net.hooks().shutdown_polls.load(Ordering::SeqCst), 4);
    assert!(TcpStream::connect(loopback(port)).is_err());
    assert_eq!(net.listen_port(), None);
}

#[test]
fn connections_still_delivered_while_stopping() {
    let hooks = CountingHooks {
        not_ready_for: 50,
        ..Default::default()
    };
    let net = Arc::new(test_network(ephemeral_prefs(), hooks));
    net.start(true).unwrap();
    let port = net.listen_port().unwrap();

    net.stop(false);
    assert!(wait_until(Duration::from_secs(2), || net.state() == NetworkState::Stopping));

    let _client = TcpStream::connect(loopback(port)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        net.hooks().connections.load(Ordering::SeqCst) == 1
    }));

    net.stop(true);
    assert_eq!(net.state(), NetworkState::Stopped);
}

#[test]
fn user_public_ip_is_advertised() {
    let prefs = NetworkPreferences::new(0, "203.0.113.50", true, false);
    let net = test_network(prefs, CountingHooks::default());
    net.start(true).unwrap();

    let endpoint = net.public_endpoint().unwrap();
    assert_eq!(endpoint.ip().to_string(), "203.0.113.50");
    assert_eq!(Some(endpoint.port()), net.listen_port());
    assert!(net.public_addresses().contains(&endpoint.ip()));

    net.stop(true);
    assert_eq!(net.public_endpoint(), None);
    // Confirmed addresses outlive a restart.
    assert!(net.public_addresses().contains(&endpoint.ip()));
}

#[test]
fn listen_only_without_any_endpoint() {
    let net = test_network(NetworkPreferences::new(0, "", true, true), CountingHooks::default());
    net.start(true).unwrap();

    assert!(net.is_running());
    assert_eq!(net.public_endpoint(), None);

    net.stop(true);
}

#[test]
fn confirmed_public_address_used_on_next_start() {
    let net = test_network(ephemeral_prefs(), CountingHooks::default());
    assert!(net.add_public_address("198.51.100.3".parse().unwrap()));
    assert!(!net.add_public_address("0.0.0.0".parse().unwrap()));

    net.start(true).unwrap();
    assert_eq!(net.public_endpoint().unwrap().ip().to_string(), "198.51.100.3");
    net.stop(true);
}

#[test]
fn maintenance_ticks_only_while_running() {
    let net = test_network(ephemeral_prefs(), CountingHooks::default());
    net.start(true).unwrap();
    assert!(wait_until(Duration::from_secs(2), || net.hooks().runs.load(Ordering::SeqCst) >= 3));
    net.stop(true);

    let after_stop = net.hooks().runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(net.hooks().runs.load(Ordering::SeqCst), after_stop);
}

#[test]
fn dropping_network_stops_it() {
    let net = test_network(ephemeral_prefs(), CountingHooks::default());
    net.start(true).unwrap();
    let port = net.listen_port().unwrap();

    drop(net);
    assert!(TcpStream::connect(loopback(port)).is_err());
}

#[test]
fn upnp_mapping_renegotiated_on_every_start() {
    let external: SocketAddr = "198.51.100.20:40000".parse().unwrap();
    let net = mapped_network(NetworkPreferences::new(0, "", true, false), MappingNat::new(external));

    for round in 1..=2 {
        net.start(true).unwrap();
        assert_eq!(net.public_endpoint(), Some(external), "round {}", round);
        assert_eq!(net.nat().traversals.load(Ordering::SeqCst), round);
        assert_eq!(*net.nat().last_port.lock().unwrap(), net.listen_port());
        assert!(net.public_addresses().contains(&external.ip()));

        net.stop(true);
        assert_eq!(net.nat().releases.load(Ordering::SeqCst), round);
        assert!(!net.public_addresses().contains(&external.ip()));
    }
}

#[test]
fn peer_confirmed_address_outlives_released_mapping() {
    let external: SocketAddr = "198.51.100.20:40000".parse().unwrap();
    let net = mapped_network(NetworkPreferences::new(0, "", true, false), MappingNat::new(external));

    net.start(true).unwrap();
    net.add_public_address(external.ip());
    net.stop(true);
    assert_eq!(net.nat().releases.load(Ordering::SeqCst), 1);
    assert!(net.public_addresses().contains(&external.ip()));

    // Now a confirmed address, it wins over a fresh traversal.
    net.start(true).unwrap();
    assert_eq!(net.nat().traversals.load(Ordering::SeqCst), 1);
    assert_eq!(net.public_endpoint().map(|e| e.ip()), Some(external.ip()));
    assert_eq!(net.public_endpoint().map(|e| e.port()), net.listen_port());
    net.stop(true);
    assert_eq!(net.nat().releases.load(Ordering::SeqCst), 1);
}
