//! Convoy End-to-End Harness
//!
//! Wires the mediator, the in-memory stores, the projection runtime, and the
//! flow engine into one process the way a deployment would, around a small
//! order-processing domain. The integration tests in `tests/` drive whole
//! scenarios through this harness.

pub mod orders;
pub mod setup;

pub use orders::*;
pub use setup::ConvoyHarness;

/// Initialize tracing for harness binaries and tests. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
