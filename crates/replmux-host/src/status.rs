//! Exit status and stop strategy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How an inner process ended.
///
/// A non-zero code or a signal is an ordinary way for an interactive
/// session to end and is reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,

    /// Whether the process was signaled
    pub signaled: bool,

    /// Signal number if signaled
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success() -> Self {
        Self::with_code(0)
    }

    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signaled: false,
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signaled: true,
            signal: Some(signal),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            Self::with_code(code)
        } else if let Some(sig) = status.signal() {
            Self::signaled(sig)
        } else {
            Self::with_code(-1)
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Stop mode for process termination
#[derive(Debug, Clone, Copy)]
pub enum StopMode {
    /// SIGTERM, wait up to `timeout`, then SIGKILL
    Graceful { timeout: Duration },
    /// SIGKILL right away
    Force,
}

impl Default for StopMode {
    fn default() -> Self {
        Self::Graceful {
            timeout: Duration::from_secs(2),
        }
    }
}
