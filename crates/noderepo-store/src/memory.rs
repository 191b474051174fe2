//! In-memory coordination store for tests and embedding.
//!
//! [`InMemoryStore`] plays the role of the server: a single node tree shared
//! by every session opened against it. [`InMemorySession`] is one client
//! session. All mutations and watch routing happen under one lock, so every
//! watcher observes child events in mutation order.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::path::{parent_and_name, validate_node_path};
use crate::traits::{CoordinationStore, StoreConnector};
use crate::watch::{ChildrenWatch, WatchEvent, WatchEventKind, WatchId};

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    children: BTreeSet<String>,
}

struct Watcher {
    session: u64,
    id: WatchId,
    path: String,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

struct TreeState {
    nodes: HashMap<String, Node>,
    watchers: Vec<Watcher>,
    available: bool,
}

impl TreeState {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self {
            nodes,
            watchers: Vec::new(),
            available: true,
        }
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::ConnectionLoss("store unavailable".into()))
        }
    }

    /// Deliver a child event to the watchers of `parent`, pruning watchers
    /// whose receivers are gone.
    fn route(&mut self, parent: &str, event: WatchEvent) {
        self.watchers.retain(|w| {
            if w.path == parent {
                w.sender.send(event.clone()).is_ok()
            } else {
                !w.sender.is_closed()
            }
        });
    }

    fn broadcast(&mut self, kind: WatchEventKind) {
        self.watchers
            .retain(|w| w.sender.send(WatchEvent::bare(kind)).is_ok());
    }

    fn insert_node(&mut self, path: &str, data: &[u8], create_parents: bool) -> StoreResult<()> {
        if self.nodes.contains_key(path) {
            return Err(StoreError::NodeExists {
                path: path.to_string(),
            });
        }
        let Some((parent, name)) = parent_and_name(path) else {
            return Err(StoreError::NodeExists {
                path: path.to_string(),
            });
        };
        if !self.nodes.contains_key(parent) {
            if !create_parents {
                return Err(StoreError::NoNode {
                    path: path.to_string(),
                });
            }
            self.insert_node(parent, &[], true)?;
        }

        let (parent, name) = (parent.to_string(), name.to_string());
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                children: BTreeSet::new(),
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.insert(name);
        }
        self.route(&parent, WatchEvent::child(WatchEventKind::ChildAdded, path));
        Ok(())
    }
}

struct Shared {
    address: String,
    state: RwLock<TreeState>,
    next_session: AtomicU64,
    next_watch: AtomicU64,
}

/// A shared, in-process node tree that sessions connect to.
///
/// Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Create an empty tree (holding only `/`) served at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                address: address.into(),
                state: RwLock::new(TreeState::new()),
                next_session: AtomicU64::new(1),
                next_watch: AtomicU64::new(1),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Simulate losing or regaining contact with the store.
    ///
    /// While unavailable, every session operation fails with
    /// `ConnectionLoss` once its retries are spent. Watchers receive
    /// `ConnectionSuspended` / `ConnectionReconnected`.
    pub fn set_available(&self, available: bool) {
        let mut state = self.shared.state.write().expect("lock poisoned");
        if state.available == available {
            return;
        }
        state.available = available;
        let kind = if available {
            WatchEventKind::ConnectionReconnected
        } else {
            WatchEventKind::ConnectionSuspended
        };
        state.broadcast(kind);
        info!(address = %self.shared.address, available, "store availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.shared.state.read().expect("lock poisoned").available
    }

    /// Number of nodes in the tree, the root included.
    pub fn node_count(&self) -> usize {
        self.shared.state.read().expect("lock poisoned").nodes.len()
    }

    /// Number of live watch subscriptions across all sessions.
    pub fn watcher_count(&self) -> usize {
        let state = self.shared.state.read().expect("lock poisoned");
        state
            .watchers
            .iter()
            .filter(|w| !w.sender.is_closed())
            .count()
    }
}

impl StoreConnector for InMemoryStore {
    type Store = InMemorySession;

    fn connect(&self, config: &StoreConfig) -> StoreResult<InMemorySession> {
        if config.address != self.shared.address {
            return Err(StoreError::AddressMismatch {
                expected: self.shared.address.clone(),
                actual: config.address.clone(),
            });
        }

        let deadline = Instant::now() + config.connect_timeout();
        while !self.is_available() {
            if Instant::now() >= deadline {
                return Err(StoreError::ConnectionLoss(format!(
                    "could not connect to {} within {}ms",
                    config.address, config.connect_timeout_ms
                )));
            }
            thread::sleep(CONNECT_POLL_INTERVAL);
        }

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, address = %config.address, "session opened");
        Ok(InMemorySession {
            shared: Arc::clone(&self.shared),
            id,
            config: config.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("address", &self.shared.address)
            .field("node_count", &self.node_count())
            .finish()
    }
}

/// One client session against an [`InMemoryStore`].
pub struct InMemorySession {
    shared: Arc<Shared>,
    id: u64,
    config: StoreConfig,
    closed: AtomicBool,
}

impl InMemorySession {
    pub fn session_id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `op`, retrying transient failures per the session's retry policy.
    fn run<R>(&self, op: &str, path: &str, mut f: impl FnMut() -> StoreResult<R>) -> StoreResult<R> {
        if self.is_closed() {
            return Err(StoreError::SessionClosed);
        }
        validate_node_path(path).map_err(|e| StoreError::InvalidPath {
            path: path.to_string(),
            reason: e.reason,
        })?;

        let mut attempt = 0;
        loop {
            match f() {
                Err(e) if e.is_transient() && attempt < self.config.retry_count => {
                    attempt += 1;
                    debug!(session = self.id, op, path, attempt, error = %e, "retrying store operation");
                    thread::sleep(self.config.retry_backoff());
                }
                Err(e) if e.is_transient() => {
                    return Err(StoreError::ConnectionLoss(format!(
                        "{op} {path} failed after {} attempts: {e}",
                        attempt + 1
                    )));
                }
                other => return other,
            }
        }
    }
}

impl CoordinationStore for InMemorySession {
    fn exists(&self, path: &str) -> StoreResult<bool> {
        self.run("exists", path, || {
            let state = self.shared.state.read().expect("lock poisoned");
            state.ensure_available()?;
            Ok(state.nodes.contains_key(path))
        })
    }

    fn create_persistent(&self, path: &str, data: &[u8], create_parents: bool) -> StoreResult<()> {
        self.run("create", path, || {
            let mut state = self.shared.state.write().expect("lock poisoned");
            state.ensure_available()?;
            state.insert_node(path, data, create_parents)
        })
    }

    fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.run("read", path, || {
            let state = self.shared.state.read().expect("lock poisoned");
            state.ensure_available()?;
            state
                .nodes
                .get(path)
                .map(|n| n.data.clone())
                .ok_or_else(|| StoreError::NoNode {
                    path: path.to_string(),
                })
        })
    }

    fn write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        self.run("write", path, || {
            let mut state = self.shared.state.write().expect("lock poisoned");
            state.ensure_available()?;
            let node = state.nodes.get_mut(path).ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })?;
            node.data = data.to_vec();
            if let Some((parent, _)) = parent_and_name(path) {
                let parent = parent.to_string();
                state.route(&parent, WatchEvent::child(WatchEventKind::ChildUpdated, path));
            }
            Ok(())
        })
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        self.run("delete", path, || {
            let mut state = self.shared.state.write().expect("lock poisoned");
            state.ensure_available()?;
            let Some((parent, name)) = parent_and_name(path) else {
                return Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "the root cannot be deleted".into(),
                });
            };
            match state.nodes.get(path) {
                None => {
                    return Err(StoreError::NoNode {
                        path: path.to_string(),
                    })
                }
                Some(node) if !node.children.is_empty() => {
                    return Err(StoreError::NotEmpty {
                        path: path.to_string(),
                    })
                }
                Some(_) => {}
            }
            state.nodes.remove(path);
            if let Some(p) = state.nodes.get_mut(parent) {
                p.children.remove(name);
            }
            state.route(parent, WatchEvent::child(WatchEventKind::ChildRemoved, path));
            Ok(())
        })
    }

    fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.run("list_children", path, || {
            let state = self.shared.state.read().expect("lock poisoned");
            state.ensure_available()?;
            state
                .nodes
                .get(path)
                .map(|n| n.children.iter().cloned().collect())
                .ok_or_else(|| StoreError::NoNode {
                    path: path.to_string(),
                })
        })
    }

    fn watch_children(&self, path: &str) -> StoreResult<ChildrenWatch> {
        self.run("watch_children", path, || {
            let mut state = self.shared.state.write().expect("lock poisoned");
            state.ensure_available()?;
            let populated = match state.nodes.get(path) {
                Some(node) => !node.children.is_empty(),
                None => {
                    return Err(StoreError::NoNode {
                        path: path.to_string(),
                    })
                }
            };

            let (tx, rx) = mpsc::unbounded_channel();
            if populated {
                // Receiver is alive; the send cannot fail.
                let _ = tx.send(WatchEvent::bare(WatchEventKind::Initialized));
            }
            let id = WatchId(self.shared.next_watch.fetch_add(1, Ordering::Relaxed));
            state.watchers.push(Watcher {
                session: self.id,
                id,
                path: path.to_string(),
                sender: tx,
            });
            debug!(session = self.id, %id, path, populated, "children watch started");
            Ok(ChildrenWatch::new(id, path, rx))
        })
    }

    fn unwatch(&self, id: WatchId) -> StoreResult<()> {
        let mut state = self.shared.state.write().expect("lock poisoned");
        state
            .watchers
            .retain(|w| !(w.session == self.id && w.id == id));
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.shared.state.write().expect("lock poisoned");
        let before = state.watchers.len();
        state.watchers.retain(|w| w.session != self.id);
        let cancelled = before - state.watchers.len();
        if cancelled > 0 {
            warn!(session = self.id, cancelled, "session closed with active watches");
        }
        debug!(session = self.id, "session closed");
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for InMemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySession")
            .field("id", &self.id)
            .field("address", &self.config.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}
