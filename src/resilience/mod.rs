//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! accept() fails (EMFILE, ECONNABORTED, ...)
//!     → backoff.rs (delay grows with consecutive failures)
//!     → accept loop retries; a success resets the backoff
//! ```
//!
//! # Design Decisions
//! - Failures never end the accept loop; only closing the acceptor does
//! - Jitter keeps retries from synchronizing

pub mod backoff;
