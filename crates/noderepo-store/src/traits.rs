//! The coordination-store client contract.
//!
//! Any backend (ZooKeeper, etcd, the bundled in-memory tree) implements
//! these traits to serve as the storage and notification layer under a
//! repository.

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::watch::{ChildrenWatch, WatchId};

/// Opens sessions against a coordination store.
pub trait StoreConnector: Send + Sync {
    type Store: CoordinationStore + 'static;

    /// Start a new, independent session using the given connection
    /// parameters. Blocks until connected or the connect timeout elapses.
    fn connect(&self, config: &StoreConfig) -> StoreResult<Self::Store>;
}

/// One session against a hierarchical, watch-capable node store.
///
/// Implementations must be thread-safe and provide per-node atomicity: a
/// single create, set, or delete either happens entirely or not at all.
/// No cross-node transactions are assumed.
pub trait CoordinationStore: Send + Sync {
    /// Whether a node exists at `path`.
    fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Create a persistent node holding `data`.
    ///
    /// Fails with `NodeExists` if the node is already present, and with
    /// `NoNode` if the parent is missing and `create_parents` is `false`.
    /// Parents created on the way hold empty payloads.
    fn create_persistent(&self, path: &str, data: &[u8], create_parents: bool) -> StoreResult<()>;

    /// Read a node's payload. Fails with `NoNode` if absent.
    fn read(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Overwrite an existing node's payload. Fails with `NoNode` if absent;
    /// never creates a node.
    fn write(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    /// Delete a leaf node. Fails with `NoNode` if absent.
    fn delete(&self, path: &str) -> StoreResult<()>;

    /// Names of the direct children of `path`, sorted.
    fn list_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Subscribe to changes of the direct children of `path`.
    fn watch_children(&self, path: &str) -> StoreResult<ChildrenWatch>;

    /// Cancel a watch. Its stream ends once queued events are drained.
    /// Unknown ids are ignored.
    fn unwatch(&self, id: WatchId) -> StoreResult<()>;

    /// Close the session, cancelling all of its watches. Idempotent.
    fn close(&self) -> StoreResult<()>;
}
