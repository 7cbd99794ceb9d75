//! Error types for Listmail

use thiserror::Error;

/// Who is allowed to see the detail of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Only the administrator hears about it; the sender gets a generic apology
    Administrator,
    /// The sender gets a bounce stating the reason
    Sender,
}

/// Main error type for Listmail
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Sender(String),

    #[error("{reason}: {detail}")]
    Parse { reason: String, detail: String },

    #[error("{0} is already subscribed to this list.")]
    AlreadyMember(String),

    #[error("{0} is not subscribed to this list.")]
    NotMember(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Listmail
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds a parse error from a reason and the offending input
    pub fn parse(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Parse {
            reason: reason.into(),
            detail: detail.into(),
        }
    }

    /// Returns who may see the detail of this error
    pub fn audience(&self) -> Audience {
        match self {
            Error::Sender(_)
            | Error::Parse { .. }
            | Error::AlreadyMember(_)
            | Error::NotMember(_) => Audience::Sender,
            Error::Config(_)
            | Error::Transport(_)
            | Error::Storage(_)
            | Error::LockTimeout(_)
            | Error::Internal(_)
            | Error::Other(_) => Audience::Administrator,
        }
    }

    /// Returns the subject line used when reporting this error
    pub fn report_subject(&self) -> &'static str {
        match self {
            Error::Config(_) => "List Manager Invalid Configuration",
            Error::Sender(_) | Error::AlreadyMember(_) | Error::NotMember(_) => {
                "List Manager Sender Error"
            }
            Error::Parse { .. } => "List Manager Parse Error",
            Error::Transport(_) => "List Manager Sendmail Error",
            Error::Storage(_) => "List Manager Storage Error",
            Error::LockTimeout(_) => "List Manager Lock Timeout",
            Error::Internal(_) => "List Manager Critical Error",
            Error::Other(_) => "List Manager Exception",
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Sender(_) => "SENDER_ERROR",
            Error::Parse { .. } => "PARSE_ERROR",
            Error::AlreadyMember(_) => "ALREADY_MEMBER",
            Error::NotMember(_) => "NOT_MEMBER",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::LockTimeout(_) => "LOCK_TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the invocation should be retried by the MTA instead of bounced
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(format!("Database (de)serialization failed: {}", e))
    }
}
