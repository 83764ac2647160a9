//! Error taxonomy for the proxy core.

use thiserror::Error;

/// Failure classes surfaced by the proxy.
///
/// `Transport` is the only locally-recoverable kind (the router retries a
/// forwarded call at most once; the health monitor counts it toward
/// demotion). Everything else is surfaced directly with the matching
/// JSON-RPC error code.
#[derive(Debug, Error)]
pub enum HubError {
    /// The compose document is malformed or unreadable.
    #[error("config error: {0}")]
    Config(String),

    /// Outbound I/O failure: connect, TLS, timeout, non-2xx HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend produced a response that is not valid JSON-RPC 2.0.
    #[error("backend protocol violation: {0}")]
    Protocol(String),

    /// A well-formed JSON-RPC error response from a backend.
    #[error("backend error {code}: {message}")]
    Application {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The requested tool/resource/prompt is not in the current index.
    #[error("not found: {0}")]
    NotFound(String),

    /// A per-request or per-call deadline fired.
    #[error("deadline exceeded")]
    Deadline,
}

impl HubError {
    /// Stable label used for the `errors_total` counter and log fields.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Config(_) => ErrorKind::Config,
            HubError::Transport(_) => ErrorKind::Transport,
            HubError::Protocol(_) => ErrorKind::Protocol,
            HubError::Application { .. } => ErrorKind::Application,
            HubError::NotFound(_) => ErrorKind::NotFound,
            HubError::Deadline => ErrorKind::Deadline,
        }
    }
}

/// Discriminant-only view of [`HubError`] for counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transport,
    Protocol,
    Application,
    NotFound,
    Deadline,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Config,
        ErrorKind::Transport,
        ErrorKind::Protocol,
        ErrorKind::Application,
        ErrorKind::NotFound,
        ErrorKind::Deadline,
    ];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Application => "application",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Deadline => "deadline",
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
