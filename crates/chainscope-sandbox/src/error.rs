//! Error types for the sandbox executor.

use thiserror::Error;

/// Errors that can occur during sandbox execution and session management.
///
/// A non-zero exit code from the executed code is **not** an error — it is
/// reported in the [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The requested session does not exist (or has expired).
    #[error("session not found: {id}")]
    SessionNotFound {
        /// The session id that was requested.
        id: String,
    },

    /// The session exists but belongs to a different owner.
    #[error("session {id} is owned by another caller")]
    SessionForbidden {
        /// The session id that was requested.
        id: String,
    },

    /// The session cap is reached and no idle session could be evicted.
    #[error("session limit reached (max {max} sessions, none idle)")]
    SessionCapExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Execution exceeded its deadline and the process was killed.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Execution was cancelled by the caller before completion.
    #[error("execution cancelled")]
    Cancelled,

    /// Workspace or staging I/O failed.
    #[error("workspace I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The container backend failed (spawn, exec, or teardown).
    #[error("sandbox backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

impl SandboxError {
    /// Static error kind for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound { .. } => "session_not_found",
            Self::SessionForbidden { .. } => "session_forbidden",
            Self::SessionCapExceeded { .. } => "session_cap_exceeded",
            Self::CodeTooLarge { .. } => "code_too_large",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Backend(_) => "backend",
        }
    }
}

// Compile-time assertion: SandboxError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<SandboxError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_session_errors() {
        let err = SandboxError::SessionNotFound { id: "abc".into() };
        assert_eq!(err.to_string(), "session not found: abc");
        assert_eq!(err.kind(), "session_not_found");

        let err = SandboxError::SessionForbidden { id: "abc".into() };
        assert!(err.to_string().contains("another caller"));

        let err = SandboxError::SessionCapExceeded { max: 4 };
        assert!(err.to_string().contains('4'));
    }

    #[test]
    fn timeout_and_cancelled_are_distinct_kinds() {
        assert_eq!(SandboxError::Timeout { timeout_ms: 1000 }.kind(), "timeout");
        assert_eq!(SandboxError::Cancelled.kind(), "cancelled");
    }
}
