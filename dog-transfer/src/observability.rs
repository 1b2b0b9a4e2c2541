//! Tracing setup for binaries and tests embedding the engine
//!
//! The engine only emits `tracing` events; installing a subscriber is left to
//! the application unless the `tracing-basic` feature is enabled.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "dog_transfer=info";

/// Install a fmt subscriber filtered by `RUST_LOG`
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}

/// Same as [`init_tracing`] but emitting one JSON object per event
pub fn init_json_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        init_tracing();
        assert!(!init_json_tracing());
    }
}
