//! Error types for repository operations.

use noderepo_store::{ErrorCode, StoreError};
use thiserror::Error;

use crate::item::ItemId;

/// One or more reasons an item was rejected before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .messages.join("; "))]
pub struct ValidationError {
    messages: Vec<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    /// `Ok(())` if `messages` is empty, otherwise an error carrying all of
    /// them.
    pub fn check(messages: Vec<String>) -> Result<(), Self> {
        if messages.is_empty() {
            Ok(())
        } else {
            Err(Self { messages })
        }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

/// Failure to turn an item into bytes or back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    /// Input that a hand-written codec refused.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Errors loading or checking a repository configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from repository operations.
///
/// `DuplicateKey` and `NotFound` are expected outcomes callers branch on.
/// `Io` may be transient. `Decode` and `InvariantViolation` mean the stored
/// state or the calling code is broken; see [`RepoError::is_fatal`].
#[derive(Debug, Error)]
pub enum RepoError {
    /// The item failed its own validation; nothing was written.
    #[error("item {id} failed validation: {source}")]
    Validation {
        id: ItemId,
        #[source]
        source: ValidationError,
    },

    /// An item with this id is already stored.
    #[error("an item with id {id} already exists")]
    DuplicateKey { id: ItemId },

    /// No item with this id is stored.
    #[error("no item with id {id}")]
    NotFound { id: ItemId },

    /// Any other store or transport failure.
    #[error("store failure while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: StoreError,
    },

    /// Stored bytes could not be decoded into an item.
    #[error("stored item {id} is corrupt: {source}")]
    Decode {
        id: ItemId,
        #[source]
        source: CodecError,
    },

    /// The item could not be encoded; nothing was written.
    #[error("item {id} could not be encoded: {source}")]
    Encode {
        id: ItemId,
        #[source]
        source: CodecError,
    },

    /// The repository root is missing from the store.
    #[error("root path does not exist in the store: {path}")]
    RootMissing { path: String },

    /// Misuse of the repository or a foreign node under its root.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The change notifier thread could not be started.
    #[error("could not start change notifier: {0}")]
    Notifier(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RepoError {
    pub(crate) fn io(context: impl Into<String>, source: StoreError) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Translate a failed create of item `id`.
    pub(crate) fn on_create(id: ItemId, source: StoreError) -> Self {
        match source.code() {
            ErrorCode::NodeExists => Self::DuplicateKey { id },
            _ => Self::io(format!("adding item {id}"), source),
        }
    }

    /// Translate a failed operation on the existing item `id`.
    pub(crate) fn on_existing(id: ItemId, action: &str, source: StoreError) -> Self {
        match source.code() {
            ErrorCode::NoNode => Self::NotFound { id },
            _ => Self::io(format!("{action} item {id}"), source),
        }
    }

    /// Conditions the repository cannot recover from and callers should not
    /// retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::InvariantViolation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

/// Convenience alias used throughout the repository crate.
pub type RepoResult<T> = Result<T, RepoError>;
