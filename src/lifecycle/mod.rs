//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Worker (worker.rs):
//!     start_working → started_working → work loop → done_working
//!
//! Shutdown (shutdown.rs):
//!     trigger → worker loop exits / acceptor closes
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary stops the network
//! ```
//!
//! # Design Decisions
//! - One dedicated thread per worker; all its work runs sequentially
//! - Shutdown signals are latched, so late subscribers still see them
//! - Ordered shutdown: drain hook, close acceptor, release NAT mapping

pub mod shutdown;
pub mod signals;
pub mod worker;

pub use shutdown::{Shutdown, ShutdownListener};
pub use worker::{Work, Worker};
