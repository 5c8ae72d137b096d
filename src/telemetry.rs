//! Tracing setup for embedding processes.
//!
//! The engine itself only emits through `tracing`; hosts that have no
//! subscriber of their own can install this one. `RUST_LOG` overrides the
//! default directive.

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber with env-filter support. Safe to call
/// more than once; only the first call wins.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("info");
        init_tracing("debug");
    }
}
