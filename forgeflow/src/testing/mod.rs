//! Testing utilities for forgeflow runs.
//!
//! This module provides:
//! - Mock work-unit handlers (success, failing, flaky, slow, recording)
//! - A tracing subscriber for tests

mod mocks;

pub use mocks::{
    ExecutionRecorder, FailingHandler, FlakyHandler, RecordedCall, RecordingHandler, SlowHandler,
    SuccessHandler,
};

use tracing_subscriber::EnvFilter;

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `warn`.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
