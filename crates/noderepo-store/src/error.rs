use std::fmt;

/// Error code reported by the coordination store.
///
/// Callers translate store failures by inspecting this code rather than by
/// matching on message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NodeExists,
    NoNode,
    NotEmpty,
    ConnectionLoss,
    SessionClosed,
    BadArguments,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NodeExists => "NODEEXISTS",
            Self::NoNode => "NONODE",
            Self::NotEmpty => "NOTEMPTY",
            Self::ConnectionLoss => "CONNECTIONLOSS",
            Self::SessionClosed => "SESSIONCLOSED",
            Self::BadArguments => "BADARGUMENTS",
        };
        write!(f, "{s}")
    }
}

/// Errors from coordination store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A node already exists at the path.
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// No node exists at the path (or its parent is missing on create).
    #[error("no node: {path}")]
    NoNode { path: String },

    /// The node still has children and cannot be deleted.
    #[error("node has children: {path}")]
    NotEmpty { path: String },

    /// The store could not be reached, even after retrying.
    #[error("connection loss: {0}")]
    ConnectionLoss(String),

    /// The session was closed by its owner.
    #[error("session is closed")]
    SessionClosed,

    /// The path is not a well-formed absolute node path.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The connector was asked to reach a different address than it serves.
    #[error("address mismatch: store serves {expected}, config asks for {actual}")]
    AddressMismatch { expected: String, actual: String },
}

impl StoreError {
    /// The store-level error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NodeExists { .. } => ErrorCode::NodeExists,
            Self::NoNode { .. } => ErrorCode::NoNode,
            Self::NotEmpty { .. } => ErrorCode::NotEmpty,
            Self::ConnectionLoss(_) => ErrorCode::ConnectionLoss,
            Self::SessionClosed => ErrorCode::SessionClosed,
            Self::InvalidPath { .. } | Self::AddressMismatch { .. } => ErrorCode::BadArguments,
        }
    }

    /// Returns `true` for failures a retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
