//! Process-wide tracing setup.

pub mod subscriber;

pub use subscriber::{LogFormat, ObservabilityConfig};

/// Install the global subscriber from `RUST_LOG` / `LOG_FORMAT`.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    subscriber::init(&ObservabilityConfig::from_env());
}
