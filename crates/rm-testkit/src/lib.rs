//! Resource manager testing infrastructure
//!
//! Resource types with small, well-understood algebras (rings and byte
//! extents), an in-memory network that routes encoded envelopes between
//! domains, the three-server creditor chain used by scenario tests, proptest
//! strategies and a checker for the right algebra laws.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod extents;
pub mod harness;
pub mod laws;
pub mod network;
pub mod rings;
pub mod strategies;

pub use extents::{ExtentType, Extents, EXTENTS_TYPE};
pub use harness::{RecordingOps, Server, ThreeServers, RESOURCE};
pub use laws::check_right_laws;
pub use network::{MemoryNetwork, MemoryTransport};
pub use rings::*;

use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`; later calls are no-ops
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
