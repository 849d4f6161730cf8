//! Network engine: listener ownership, accept loop, maintenance ticks.
//!
//! # State machine
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!              │                     ▲
//!              └── bind failure ─────┘ (straight to Stopped)
//! ```
//!
//! `start`/`stop` run on the caller's thread and only drive transitions;
//! the loop itself (accepts, ticks, hooks) runs on the engine's worker
//! thread. A mutex serializes `start`/`stop` so concurrent callers queue
//! up instead of racing.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::{EngineConfig, NetworkPreferences};
use crate::lifecycle::shutdown::{Shutdown, ShutdownListener};
use crate::lifecycle::worker::{Work, Worker};
use crate::net::connection::{accept_loop, Connection};
use crate::net::error::NetworkError;
use crate::net::host::{bind_and_listen, EndpointSource, HostNetwork};
use crate::net::nat::{NatMapping, NatTraversal};
use crate::observability::metrics;

/// Extension points for the protocol layer.
///
/// Hooks run on the engine thread, one at a time. They must not call
/// [`Network::start`] or [`Network::stop`] on their own engine.
pub trait NetworkHooks: Send + Sync + 'static {
    /// Called once after the listener is bound, before any connection is accepted.
    fn on_startup(&self) {}

    /// Called once per maintenance tick while running.
    fn on_run(&self) {}

    /// Called once per accepted inbound connection. May still fire while
    /// the engine is stopping.
    fn on_connection(&self, _connection: Arc<Connection>) {}

    /// Called once per tick while stopping. Return `false` to be polled
    /// again on the next tick. Must eventually return `true` unless
    /// `max_shutdown_polls` is configured.
    fn on_shutdown(&self) -> bool {
        true
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl NetworkHooks for NoHooks {}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

#[derive(Debug)]
struct Status {
    state: NetworkState,
    error: Option<NetworkError>,
    listen_port: Option<u16>,
    public_endpoint: Option<SocketAddr>,
}

/// State shared between the caller-facing handle and the engine thread.
struct Shared<H, N> {
    prefs: NetworkPreferences,
    config: EngineConfig,
    hooks: H,
    nat: N,
    host: Mutex<HostNetwork>,
    status: Mutex<Status>,
    changed: Condvar,
}

impl<H, N> Shared<H, N> {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host(&self) -> MutexGuard<'_, HostNetwork> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> NetworkState {
        self.status().state
    }

    fn set_state(&self, state: NetworkState) {
        let mut status = self.status();
        if status.state == state {
            return;
        }
        tracing::info!(from = ?status.state, to = ?state, "Network state changed");
        status.state = state;
        if state == NetworkState::Stopped {
            status.listen_port = None;
            status.public_endpoint = None;
        }
        metrics::record_network_state(state);
        self.changed.notify_all();
    }

    /// Block until `waiting(state)` is false and return that state.
    fn wait_while(&self, waiting: impl Fn(NetworkState) -> bool) -> NetworkState {
        let status = self
            .changed
            .wait_while(self.status(), |status| waiting(status.state))
            .unwrap_or_else(PoisonError::into_inner);
        status.state
    }

    fn run_interval(&self) -> Duration {
        Duration::from_millis(self.config.run_interval_ms.max(1))
    }
}

/// Host network engine.
pub struct Network<H: NetworkHooks, N: NatTraversal> {
    shared: Arc<Shared<H, N>>,
    /// Serializes start/stop transitions.
    run: Mutex<Worker>,
}

impl<H: NetworkHooks, N: NatTraversal> Network<H, N> {
    /// Create a stopped engine. Interface addresses are captured now.
    pub fn new(prefs: NetworkPreferences, hooks: H, nat: N) -> Self {
        Self::with_config(prefs, EngineConfig::default(), hooks, nat)
    }

    pub fn with_config(prefs: NetworkPreferences, config: EngineConfig, hooks: H, nat: N) -> Self {
        Self::with_host(prefs, config, hooks, nat, HostNetwork::new())
    }

    /// Create an engine and start it, returning once it is running.
    pub fn started(prefs: NetworkPreferences, config: EngineConfig, hooks: H, nat: N) -> Result<Self, NetworkError> {
        let network = Self::with_config(prefs, config, hooks, nat);
        network.start(true)?;
        Ok(network)
    }

    /// Like [`with_config`](Self::with_config) with an explicit interface view.
    pub fn with_host(prefs: NetworkPreferences, config: EngineConfig, hooks: H, nat: N, host: HostNetwork) -> Self {
        tracing::debug!(interfaces = ?host.interface_addresses(), "Host interfaces captured");
        Self {
            shared: Arc::new(Shared {
                prefs,
                config,
                hooks,
                nat,
                host: Mutex::new(host),
                status: Mutex::new(Status {
                    state: NetworkState::Stopped,
                    error: None,
                    listen_port: None,
                    public_endpoint: None,
                }),
                changed: Condvar::new(),
            }),
            run: Mutex::new(Worker::new("hostnet")),
        }
    }

    /// Start the network. No-op if already running.
    ///
    /// With `blocking`, returns once the listener is bound and the loop is
    /// live, or with the error that aborted startup. Without it, returns as
    /// soon as the engine thread exists.
    pub fn start(&self, blocking: bool) -> Result<(), NetworkError> {
        let mut worker = self.lock_run();

        match self.shared.state() {
            NetworkState::Running => return Ok(()),
            NetworkState::Starting | NetworkState::Stopping => {
                if !blocking {
                    return Ok(());
                }
                let settled = self
                    .shared
                    .wait_while(|s| matches!(s, NetworkState::Starting | NetworkState::Stopping));
                if settled == NetworkState::Running {
                    return Ok(());
                }
            }
            NetworkState::Stopped => {}
        }

        worker.join();
        self.shared.status().error = None;
        self.shared.set_state(NetworkState::Starting);

        let work = NetworkWork::new(self.shared.clone());
        if let Err(e) = worker.start_working(work) {
            self.shared.set_state(NetworkState::Stopped);
            return Err(NetworkError::Worker(e));
        }

        if !blocking {
            return Ok(());
        }

        match self.shared.wait_while(|s| s == NetworkState::Starting) {
            NetworkState::Stopped => {
                worker.join();
                Err(self
                    .shared
                    .status()
                    .error
                    .take()
                    .unwrap_or(NetworkError::StartupAborted))
            }
            _ => Ok(()),
        }
    }

    /// Stop the network. No-op if already stopped.
    ///
    /// With `blocking`, returns once the shutdown hook reported ready, the
    /// listener is closed and the engine thread has exited.
    pub fn stop(&self, blocking: bool) {
        let mut worker = self.lock_run();

        if self.shared.state() == NetworkState::Starting {
            self.shared.wait_while(|s| s == NetworkState::Starting);
        }
        if self.shared.state() == NetworkState::Stopped {
            worker.join();
            return;
        }

        worker.request_stop();
        if blocking {
            worker.join();
        }
    }

    pub fn state(&self) -> NetworkState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NetworkState::Running
    }

    /// Port the listener is bound to while the network is up.
    pub fn listen_port(&self) -> Option<u16> {
        self.shared.status().listen_port
    }

    /// Endpoint advertised to peers, if one was resolved.
    pub fn public_endpoint(&self) -> Option<SocketAddr> {
        self.shared.status().public_endpoint
    }

    pub fn public_addresses(&self) -> BTreeSet<IpAddr> {
        self.shared.host().public_addresses().clone()
    }

    pub fn interface_addresses(&self) -> Vec<IpAddr> {
        self.shared.host().interface_addresses().to_vec()
    }

    /// Record an address a peer told us we are reachable on.
    pub fn add_public_address(&self, addr: IpAddr) -> bool {
        self.shared.host().add_public_address(addr)
    }

    pub fn preferences(&self) -> &NetworkPreferences {
        &self.shared.prefs
    }

    pub fn hooks(&self) -> &H {
        &self.shared.hooks
    }

    pub fn nat(&self) -> &N {
        &self.shared.nat
    }

    fn lock_run(&self) -> MutexGuard<'_, Worker> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: NetworkHooks, N: NatTraversal> Drop for Network<H, N> {
    fn drop(&mut self) {
        self.stop(true);
    }
}

/// The part of the engine that lives on the worker thread.
struct NetworkWork<H: NetworkHooks, N: NatTraversal> {
    shared: Arc<Shared<H, N>>,
    acceptor: Shutdown,
    accept_task: Option<JoinHandle<()>>,
    mapping: Option<NatMapping>,
}

impl<H: NetworkHooks, N: NatTraversal> NetworkWork<H, N> {
    fn new(shared: Arc<Shared<H, N>>) -> Self {
        Self {
            shared,
            acceptor: Shutdown::new(),
            accept_task: None,
            mapping: None,
        }
    }

    async fn startup(&mut self) -> Result<(), NetworkError> {
        let shared = self.shared.clone();

        let (listener, port) = bind_and_listen(&shared.prefs).await?;
        tracing::info!(port, preferred = shared.prefs.listen_port, "Listener bound");

        // Resolve on a copy so readers are not blocked during UPnP discovery.
        let mut host = shared.host().clone();
        let resolved = host.resolve_public_endpoint(&shared.prefs, port, &shared.nat).await;
        shared.host().merge(&host);

        match resolved {
            Some(resolved) => {
                tracing::info!(endpoint = %resolved.endpoint, source = ?resolved.source, "Public endpoint resolved");
                if let EndpointSource::Upnp(mapping) = resolved.source {
                    self.mapping = Some(mapping);
                }
            }
            None => tracing::warn!("No externally reachable endpoint, listening only"),
        }
        {
            let mut status = shared.status();
            status.listen_port = Some(port);
            status.public_endpoint = resolved.map(|r| r.endpoint);
        }

        shared.hooks.on_startup();

        let hooks = shared.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.acceptor.subscribe(),
            move |connection| hooks.hooks.on_connection(connection),
        )));

        Ok(())
    }
}

impl<H: NetworkHooks, N: NatTraversal> Work for NetworkWork<H, N> {
    async fn started_working(&mut self) -> bool {
        match self.startup().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Network startup failed");
                self.shared.status().error = Some(e);
                false
            }
        }
    }

    async fn work(&mut self, stop: &mut ShutdownListener) {
        let period = self.shared.run_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.shared.set_state(NetworkState::Running);

        loop {
            tokio::select! {
                _ = stop.triggered() => break,
                _ = ticker.tick() => self.shared.hooks.on_run(),
            }
        }
    }

    async fn done_working(&mut self) {
        self.shared.set_state(NetworkState::Stopping);

        let mut ticker = time::interval(self.shared.run_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polls: u32 = 0;
        loop {
            ticker.tick().await;
            polls = polls.saturating_add(1);
            if self.shared.hooks.on_shutdown() {
                break;
            }
            if let Some(max) = self.shared.config.max_shutdown_polls {
                if polls >= max {
                    tracing::warn!(polls, "Shutdown hook never reported ready, closing anyway");
                    break;
                }
            }
            tracing::trace!(polls, "Shutdown hook not ready");
        }

        self.acceptor.trigger();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop ended abnormally");
            }
        }

        if let Some(mapping) = self.mapping.take() {
            self.shared.nat.release(&mapping).await;
            // The external address stays confirmed only if a peer vouched for it.
            self.shared.host().release_mapping(&mapping);
        }

        self.shared.set_state(NetworkState::Stopped);
    }
}

impl<H: NetworkHooks, N: NatTraversal> Drop for NetworkWork<H, N> {
    fn drop(&mut self) {
        // Failed startup or a panicking hook: release anyone waiting.
        self.acceptor.trigger();
        self.shared.set_state(NetworkState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::nat::NoNat;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        startups: AtomicUsize,
        runs: AtomicUsize,
        shutdown_polls: AtomicUsize,
        not_ready_for: usize,
        listener_closed_at_ready: AtomicBool,
        port: Mutex<Option<u16>>,
    }

    impl NetworkHooks for Recorder {
        fn on_startup(&self) {
            self.startups.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn on_shutdown(&self) -> bool {
            let polls = self.shutdown_polls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(port) = *self.port.lock().unwrap() {
                let refused = std::net::TcpStream::connect(("127.0.0.1", port)).is_err();
                self.listener_closed_at_ready.store(refused, Ordering::SeqCst);
            }
            polls > self.not_ready_for
        }
    }

    fn prefs() -> NetworkPreferences {
        NetworkPreferences::new(0, "", false, false)
    }

    fn network(hooks: Recorder) -> Network<Recorder, NoNat> {
        Network::with_host(prefs(), EngineConfig::default(), hooks, NoNat, HostNetwork::default())
    }

    #[test]
    fn start_twice_runs_once() {
        let net = network(Recorder::default());
        net.start(true).unwrap();
        net.start(true).unwrap();

        assert!(net.is_running());
        assert_eq!(net.hooks().startups.load(Ordering::SeqCst), 1);
        assert!(net.listen_port().is_some());

        net.stop(true);
        assert_eq!(net.state(), NetworkState::Stopped);
        assert_eq!(net.listen_port(), None);
    }

    #[test]
    fn stop_when_stopped_is_noop() {
        let net = network(Recorder::default());
        net.stop(true);
        net.stop(false);
        assert_eq!(net.state(), NetworkState::Stopped);
        assert_eq!(net.hooks().shutdown_polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ticks_drive_on_run() {
        let net = network(Recorder::default());
        net.start(true).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        net.stop(true);

        assert!(net.hooks().runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn shutdown_polls_until_ready() {
        let net = network(Recorder {
            not_ready_for: 3,
            ..Default::default()
        });
        net.start(true).unwrap();
        let port = net.listen_port().unwrap();
        *net.hooks().port.lock().unwrap() = Some(port);

        net.stop(true);

        assert_eq!(net.hooks().shutdown_polls.load(Ordering::SeqCst), 4);
        // The listener was still open when the hook finally reported ready.
        assert!(!net.hooks().listener_closed_at_ready.load(Ordering::SeqCst));
        assert_eq!(net.state(), NetworkState::Stopped);
        assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_err());
    }

    #[test]
    fn shutdown_poll_cap_forces_close() {
        let config = EngineConfig {
            run_interval_ms: 5,
            max_shutdown_polls: Some(5),
        };
        let hooks = Recorder {
            not_ready_for: usize::MAX,
            ..Default::default()
        };
        let net = Network::with_host(prefs(), config, hooks, NoNat, HostNetwork::default());
        net.start(true).unwrap();
        net.stop(true);

        assert_eq!(net.hooks().shutdown_polls.load(Ordering::SeqCst), 5);
        assert_eq!(net.state(), NetworkState::Stopped);
    }

    #[test]
    fn started_engine_is_running_on_return() {
        let net = Network::started(prefs(), EngineConfig::default(), Recorder::default(), NoNat).unwrap();
        assert!(net.is_running());
        assert!(net.listen_port().is_some());
        assert_eq!(net.hooks().startups.load(Ordering::SeqCst), 1);
        net.stop(true);
    }

    #[test]
    fn restart_after_stop() {
        let net = network(Recorder::default());
        net.start(true).unwrap();
        net.stop(true);
        net.start(true).unwrap();
        assert!(net.is_running());
        assert_eq!(net.hooks().startups.load(Ordering::SeqCst), 2);
        net.stop(true);
    }

    #[test]
    fn non_blocking_transitions_settle() {
        let net = network(Recorder::default());
        net.start(false).unwrap();
        assert_eq!(
            net.shared.wait_while(|s| s == NetworkState::Starting),
            NetworkState::Running
        );

        net.stop(false);
        assert_eq!(
            net.shared.wait_while(|s| s != NetworkState::Stopped),
            NetworkState::Stopped
        );
        net.stop(true);
    }
}
