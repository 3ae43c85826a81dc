//! Diagnostic tracing for the `patchgate` binary.
//!
//! Log lines go to stderr only. Stdout carries the `serve` protocol, one JSON
//! object per line, and a stray log line there would corrupt it for the agent.
//!
//! The audit trail is separate: patch records, apply logs and verification
//! logs are written under the run directory by `io::session` whatever the
//! `RUST_LOG` level is.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` selects the filter; `warn` when unset.
///
/// ```bash
/// RUST_LOG=patchgate::engine=debug,patchgate=info patchgate serve --tag trial
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    tracing_subscriber::registry().with(filter).with(stderr).init();
}
