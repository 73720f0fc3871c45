//! GNFS - file-sharing client library
//!
//! Publish, search, download and unindex content through a file-sharing
//! service, with every running operation persisted so it resumes after a
//! restart. The state machines live in `gnfs-core`; this crate re-exports
//! them and wires up logging.

pub use gnfs_core::*;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber filtered by `level`
///
/// `level` takes the usual `EnvFilter` directives, e.g. `info` or
/// `gnfs_core::download=trace`. Calling this twice is harmless.
pub fn init_logging(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
