// Logging
//
// The tracer logs through the `tracing` crate and never installs a
// subscriber on its own. Hosts that have no subscriber can call
// `init_tracing`.

use std::fmt::Display;

use tracing::{trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber filtered by `RUST_LOG`
///
/// Without `RUST_LOG` the filter is `interlace=debug` in debug mode and
/// `interlace=warn` otherwise. Returns false when a global subscriber was
/// already installed.
pub fn init_tracing(debug: bool) -> bool {
    let default_filter = if debug {
        "interlace=debug,interlace_core=debug"
    } else {
        "interlace=warn,interlace_core=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Sink for internal errors that must never reach the host
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics {
    debug: bool,
}

impl Diagnostics {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Record an absorbed error: visible at warn in debug mode, trace otherwise
    pub fn absorb<E: Display + ?Sized>(&self, err: &E, context: &str) {
        if self.debug {
            warn!(error = %err, context = context, "Tracing error absorbed");
        } else {
            trace!(error = %err, context = context, "Tracing error absorbed");
        }
    }

    /// Record a call that was ignored (after close, outside any interaction)
    pub fn ignored(&self, operation: &str, reason: &str) {
        if self.debug {
            warn!(operation = operation, reason = reason, "Tracing call ignored");
        } else {
            trace!(operation = operation, reason = reason, "Tracing call ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interlace_core::TracerError;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let _ = init_tracing(true);
        assert!(!init_tracing(false));
    }

    #[test]
    fn test_absorb_never_panics() {
        let err = TracerError::already_closed("evt-1");
        Diagnostics::new(true).absorb(&err, "finish");
        Diagnostics::new(false).absorb(&err, "finish");
        Diagnostics::default().ignored("track_signal", "tracer closed");
        assert!(!Diagnostics::default().is_debug());
    }
}
