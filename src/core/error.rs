//! Error taxonomy for generation work.
//!
//! Every per-node failure is a [`GenerationError`]; its [`ErrorKind`] is the
//! tag that travels on the event stream. Display strings are shown to users
//! verbatim, so they stay short.

use serde::{Deserialize, Serialize};

/// Wire tag attached to error and info events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    MissingInput,
    ProviderRejected,
    ProviderMalformed,
    Timeout,
    DependencyUnresolved,
    PlannerAbandoned,
    Deadlock,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingInput => "missing-input",
            ErrorKind::ProviderRejected => "provider-rejected",
            ErrorKind::ProviderMalformed => "provider-malformed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DependencyUnresolved => "dependency-unresolved",
            ErrorKind::PlannerAbandoned => "planner-abandoned",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single generation job.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// No prompt, or no source images where the request family needs them.
    #[error("{0}")]
    MissingInput(String),

    /// Transport answered with a non-2xx status.
    #[error("provider rejected the request (HTTP {status}): {message}")]
    ProviderRejected { status: u16, message: String },

    /// Transport never produced an HTTP answer (connection refused, reset...).
    #[error("provider unreachable: {0}")]
    Transport(String),

    /// 2xx answer without a usable media URL.
    #[error("provider returned no media: {0}")]
    ProviderMalformed(String),

    #[error("generation timed out after {0}s")]
    Timeout(u64),

    /// An upstream node lost its content between analysis and dispatch.
    #[error("waiting on {0}")]
    DependencyUnresolved(String),

    #[error("cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn missing_input(msg: impl Into<String>) -> Self {
        Self::MissingInput(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::ProviderMalformed(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::MissingInput(_) => ErrorKind::MissingInput,
            GenerationError::ProviderRejected { .. } | GenerationError::Transport(_) => {
                ErrorKind::ProviderRejected
            }
            GenerationError::ProviderMalformed(_) => ErrorKind::ProviderMalformed,
            GenerationError::Timeout(_) => ErrorKind::Timeout,
            GenerationError::DependencyUnresolved(_) => ErrorKind::DependencyUnresolved,
            GenerationError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the transport may try the same request again within its
    /// attempt budget. Rejections are final for the run.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Transport(_) => true,
            GenerationError::ProviderRejected { status, .. } => {
                matches!(status, 429 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}
