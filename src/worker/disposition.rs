//! Terminal disposition of a worker.

use nix::sys::wait::WaitStatus;
use serde::Serialize;
use std::fmt;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Disposition {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal number.
    Signaled(i32),
}

impl Disposition {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "Exited with exitcode = {}", code),
            Self::Signaled(signal) => write!(f, "Killed with signal {}", signal),
        }
    }
}

/// Map a terminal `WaitStatus` to a disposition.
///
/// Returns `None` for non-terminal states (stopped, continued, still alive).
pub fn analyze_wait_status(status: WaitStatus) -> Option<Disposition> {
    match status {
        WaitStatus::Exited(_, code) => Some(Disposition::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(Disposition::Signaled(signal as i32)),
        _ => None,
    }
}
