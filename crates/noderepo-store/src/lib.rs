//! Coordination-store client contract for noderepo.
//!
//! A coordination store is a tree of named nodes, each holding a byte
//! payload, with atomic per-node create/read/update/delete and subscription
//! to child-set changes. This crate defines the slice of such a client that
//! a repository needs, independent of any particular backend.
//!
//! # Modules
//!
//! - [`error`]: [`StoreError`] and the [`ErrorCode`] callers translate on
//! - [`traits`]: [`StoreConnector`] and [`CoordinationStore`]
//! - [`watch`]: children-watch events and subscriptions
//! - [`path`]: node path composition and validation
//! - [`config`]: session connection parameters
//! - [`memory`]: [`InMemoryStore`], a watch-capable in-process tree
//!
//! # Contract
//!
//! 1. Nodes are addressed by absolute `/`-separated paths.
//! 2. Create, set, and delete are individually atomic; there are no
//!    cross-node transactions.
//! 3. Errors carry a store error code so callers can tell "already exists"
//!    and "no node" apart from transport failures.
//! 4. A children watch delivers events on a stream that is never restarted;
//!    it ends when cancelled or when its session closes.

pub mod config;
pub mod error;
pub mod memory;
pub mod path;
pub mod traits;
pub mod watch;

pub use config::StoreConfig;
pub use error::{ErrorCode, StoreError, StoreResult};
pub use memory::{InMemorySession, InMemoryStore};
pub use path::{child_path, join_paths, PathError};
pub use traits::{CoordinationStore, StoreConnector};
pub use watch::{ChildrenWatch, WatchEvent, WatchEventKind, WatchId, WatchStream};
