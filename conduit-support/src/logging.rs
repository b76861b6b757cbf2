//! Process-wide logging setup.
//!
//! The teacher crate's `logging::init` built a logger config from an
//! inline TOML string but never installed the resulting logger anywhere
//! — every call site still logged through a per-struct logger built from
//! a discard sink. This version completes the pattern: `init` installs a
//! global `tracing` subscriber, and every module logs through the
//! `tracing` macros directly instead of threading a logger handle through
//! every constructor.

use tracing_subscriber::EnvFilter;

/// Installs a global subscriber controlled by `RUST_LOG` (defaulting to
/// `info` when unset). Safe to call more than once; subsequent calls are
/// no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
