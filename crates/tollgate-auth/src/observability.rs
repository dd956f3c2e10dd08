// Tracing setup for processes embedding the engine, with a reloadable level.
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// Calling it again is harmless; only the first call installs anything.
pub fn init_tracing(level: &str) {
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let (filter_layer, handle) = reload::Layer::new(base_filter);

    if tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
    {
        let _ = FILTER_HANDLE.set(handle);
    }
}

/// Changes the log level of a subscriber installed by [`init_tracing`].
///
/// Returns `false` if no subscriber was installed by this module.
pub fn set_log_level(level: &str) -> bool {
    FILTER_HANDLE
        .get()
        .is_some_and(|handle| handle.modify(|f| *f = EnvFilter::new(level)).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("debug");
        init_tracing("info");
        tracing::info!(target: "tollgate_auth::observability", "tracing initialised");
        // Another test binary may have installed a subscriber first.
        if FILTER_HANDLE.get().is_some() {
            assert!(set_log_level("warn"));
        }
    }
}
