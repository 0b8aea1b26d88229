use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// One program launch inside a live sandbox.
pub struct ExecRequest<'a> {
    /// Rendered argv; `argv[0]` is an allowed binary name or a workspace path.
    pub argv: &'a [String],
    pub stdin: &'a [u8],
    pub timeout: Duration,
    /// Cancelling takes the same forced-termination path as a timeout.
    pub cancel: &'a CancellationToken,
}

/// How a launched program ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    /// Killed by a signal it did not handle (signal number).
    Signaled(i32),
    TimedOut,
    Cancelled,
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Shell-style exit code: the code itself, or `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(signal) => Some(128 + signal),
            Self::TimedOut | Self::Cancelled => None,
        }
    }
}

#[derive(Debug)]
pub struct ProcessExit {
    pub outcome: ExitOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ExitOutcome::Exited(3).exit_code(), Some(3));
        assert_eq!(ExitOutcome::Signaled(11).exit_code(), Some(139));
        assert_eq!(ExitOutcome::TimedOut.exit_code(), None);
        assert!(ExitOutcome::Exited(0).is_success());
        assert!(!ExitOutcome::Cancelled.is_success());
    }
}
