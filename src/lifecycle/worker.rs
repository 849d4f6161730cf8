//! Managed background thread.
//!
//! A [`Worker`] owns one OS thread running a single-threaded Tokio runtime.
//! Everything a [`Work`] does happens on that thread, one step at a time.
//!
//! ```text
//! start_working()  → thread spawned → started_working()
//!                                       ├─ false → thread exits
//!                                       └─ true  → work(stop) until stop_working()
//!                                                  → done_working() (exactly once)
//! ```

use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};

use crate::lifecycle::shutdown::{Shutdown, ShutdownListener};

/// Lifecycle callbacks driven by a [`Worker`].
pub trait Work: Send + 'static {
    /// Bring the work up. Returning `false` aborts: neither `work` nor
    /// `done_working` will run.
    fn started_working(&mut self) -> impl Future<Output = bool>;

    /// Main loop. Must return once `stop` is triggered.
    fn work(&mut self, stop: &mut ShutdownListener) -> impl Future<Output = ()>;

    /// Tear down after `work` returned.
    fn done_working(&mut self) -> impl Future<Output = ()>;
}

/// Start/stop handle for one background thread at a time.
#[derive(Debug)]
pub struct Worker {
    name: String,
    stop: Option<Shutdown>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop: None,
            thread: None,
        }
    }

    /// Spawn the thread and run `work` on it. A previous thread is joined
    /// first. Returns as soon as the thread exists; readiness is the work's
    /// business.
    pub fn start_working<W: Work>(&mut self, mut work: W) -> io::Result<()> {
        self.join();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let stop = Shutdown::new();
        let mut stop_listener = stop.subscribe();
        let name = self.name.clone();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                runtime.block_on(async {
                    if !work.started_working().await {
                        tracing::debug!(worker = %name, "Worker aborted during startup");
                        return;
                    }
                    work.work(&mut stop_listener).await;
                    work.done_working().await;
                });
                tracing::debug!(worker = %name, "Worker thread exiting");
            })?;

        self.stop = Some(stop);
        self.thread = Some(thread);
        Ok(())
    }

    /// Ask the work loop to finish without waiting for it.
    pub fn request_stop(&self) {
        if let Some(stop) = &self.stop {
            stop.trigger();
        }
    }

    /// Signal the work loop and wait for the thread to exit.
    pub fn stop_working(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Wait for the thread to exit. Never joins from the worker thread itself.
    pub fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            self.stop = None;
            return;
        };

        if thread.thread().id() == thread::current().id() {
            tracing::warn!(worker = %self.name, "Refusing to join worker from its own thread");
            self.thread = Some(thread);
            return;
        }

        if thread.join().is_err() {
            tracing::error!(worker = %self.name, "Worker thread panicked");
        }
        self.stop = None;
    }

    pub fn is_working(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_working();
    }
}
