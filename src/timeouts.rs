//! Per-operation timeout budget.
//!
//! Each awaited completion has its own deadline, defaulting to four minutes
//! and overridable through `HOSTCOMPUTE_TIMEOUT_*` environment variables
//! (whole seconds). Values are read once per process.

use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_OPERATION: Duration = Duration::from_secs(4 * 60);

/// Grace period before a lost process-exit notification is presumed dead and
/// the wait is force-unblocked. Tunable, not semantically meaningful.
pub const SIGNAL_GRACE: Duration = Duration::from_secs(1);

fn from_env(var: &str, cell: &OnceLock<Duration>) -> Duration {
    *cell.get_or_init(|| {
        std::env::var(var)
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_OPERATION)
    })
}

pub fn system_create() -> Duration {
    static CELL: OnceLock<Duration> = OnceLock::new();
    from_env("HOSTCOMPUTE_TIMEOUT_SYSTEM_CREATE", &CELL)
}

pub fn system_start() -> Duration {
    static CELL: OnceLock<Duration> = OnceLock::new();
    from_env("HOSTCOMPUTE_TIMEOUT_SYSTEM_START", &CELL)
}

pub fn system_pause() -> Duration {
    static CELL: OnceLock<Duration> = OnceLock::new();
    from_env("HOSTCOMPUTE_TIMEOUT_SYSTEM_PAUSE", &CELL)
}

pub fn system_resume() -> Duration {
    static CELL: OnceLock<Duration> = OnceLock::new();
    from_env("HOSTCOMPUTE_TIMEOUT_SYSTEM_RESUME", &CELL)
}
