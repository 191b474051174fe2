//! The repository: typed CRUD over one namespace of a coordination store.
//!
//! Every read and write goes straight to the store; there is no local
//! cache. Change callbacks fire asynchronously from the [`ChangeNotifier`]
//! thread and never share a lock with CRUD callers.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::mem;
use std::sync::{Arc, Mutex};

use noderepo_store::{child_path, CoordinationStore, ErrorCode, StoreConnector};
use tracing::{debug, error, info, warn};

use crate::config::RepositoryConfig;
use crate::error::{RepoError, RepoResult};
use crate::item::{parse_node_name, ItemId, ItemLookup, RepositoryItem};
use crate::notifier::{CallbackRegistry, ChangeNotifier};

enum Lifecycle<S> {
    Created,
    Open {
        session: Arc<S>,
        notifier: ChangeNotifier,
    },
    Closed,
}

impl<S> Lifecycle<S> {
    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Open { .. } => "open",
            Self::Closed => "closed",
        }
    }
}

/// A repository of `T` items stored under one root path.
///
/// Lifecycle: [`new`](Self::new) → [`open`](Self::open) → CRUD →
/// [`close`](Self::close). Using CRUD before `open` or after `close`, or
/// opening twice, fails with [`RepoError::InvariantViolation`].
pub struct Repository<T: RepositoryItem, C: StoreConnector> {
    connector: C,
    config: RepositoryConfig,
    callbacks: CallbackRegistry,
    lifecycle: Mutex<Lifecycle<C::Store>>,
    _item: PhantomData<fn() -> T>,
}

impl<T: RepositoryItem, C: StoreConnector> Repository<T, C> {
    /// Bind a repository to a connector and configuration. No I/O happens
    /// until [`init_root`](Self::init_root) or [`open`](Self::open).
    pub fn new(connector: C, config: RepositoryConfig) -> RepoResult<Self> {
        config.validate()?;
        Ok(Self {
            connector,
            config,
            callbacks: CallbackRegistry::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
            _item: PhantomData,
        })
    }

    pub fn root_path(&self) -> &str {
        &self.config.root_path
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), Lifecycle::Open { .. })
    }

    /// Create the root node (and its ancestors) if absent.
    ///
    /// Idempotent, and usable in any lifecycle state: it runs on its own
    /// short-lived session. Meant for first-time setup, not for every start.
    pub fn init_root(&self) -> RepoResult<()> {
        let root = self.root_path();
        let session = self
            .connector
            .connect(&self.config.store)
            .map_err(|e| RepoError::io(format!("connecting to initialize {root}"), e))?;

        let created = match session.exists(root) {
            Ok(true) => Ok(false),
            Ok(false) => match session.create_persistent(root, b"", true) {
                Ok(()) => Ok(true),
                // Someone else initialized it between our check and create.
                Err(e) if e.code() == ErrorCode::NodeExists => Ok(false),
                Err(e) => Err(RepoError::io(format!("creating root {root}"), e)),
            },
            Err(e) => Err(RepoError::io(format!("checking root {root}"), e)),
        };

        if let Err(e) = session.close() {
            warn!(root, error = %e, "could not close initialization session");
        }
        let created = created?;
        info!(root, created, "repository root initialized");
        Ok(())
    }

    /// Connect, assert the root exists, and start change notification.
    pub fn open(&self) -> RepoResult<()> {
        let root = self.root_path();
        let mut lifecycle = self.lock();
        if !matches!(*lifecycle, Lifecycle::Created) {
            return Err(RepoError::InvariantViolation(format!(
                "cannot open repository at {root}: it is already {}",
                lifecycle.name()
            )));
        }

        let session = Arc::new(
            self.connector
                .connect(&self.config.store)
                .map_err(|e| RepoError::io(format!("connecting to open {root}"), e))?,
        );

        let mut notifier = ChangeNotifier::new();
        let started = match session.exists(root) {
            Ok(true) => notifier.start(&*session, root, self.callbacks.clone()),
            Ok(false) => Err(RepoError::RootMissing {
                path: root.to_string(),
            }),
            Err(e) => Err(RepoError::io(format!("checking root {root}"), e)),
        };
        if let Err(e) = started {
            if let Err(close) = session.close() {
                warn!(root, error = %close, "could not close session after failed open");
            }
            return Err(e);
        }

        *lifecycle = Lifecycle::Open { session, notifier };
        info!(root, address = %self.config.store.address, "repository opened");
        Ok(())
    }

    /// Stop change notification and release the store session.
    ///
    /// Idempotent; closing a repository that was never opened does nothing.
    /// A closed repository cannot be reopened.
    pub fn close(&self) -> RepoResult<()> {
        let previous = {
            let mut lifecycle = self.lock();
            if !matches!(*lifecycle, Lifecycle::Open { .. }) {
                return Ok(());
            }
            mem::replace(&mut *lifecycle, Lifecycle::Closed)
        };

        // The lock is released: callbacks still running on the notifier
        // thread may call back into the repository without deadlocking.
        let Lifecycle::Open {
            session,
            mut notifier,
        } = previous
        else {
            return Ok(());
        };
        notifier.cancel(&*session);
        let closed = session.close();
        notifier.join();
        closed.map_err(|e| RepoError::io(format!("closing session for {}", self.root_path()), e))?;
        info!(root = self.root_path(), "repository closed");
        Ok(())
    }

    /// Store a new item. Fails with `DuplicateKey` if its id is taken.
    pub fn add(&self, item: &T) -> RepoResult<()> {
        let session = self.session()?;
        let id = item.id();
        let bytes = self.prepare(item)?;
        let path = self.node_path(id)?;
        session
            .create_persistent(&path, &bytes, false)
            .map_err(|e| RepoError::on_create(id, e))?;
        debug!(id, %path, bytes = bytes.len(), "item added");
        Ok(())
    }

    /// Overwrite a stored item. Fails with `NotFound` if its id is absent;
    /// never creates a node.
    pub fn update(&self, item: &T) -> RepoResult<()> {
        let session = self.session()?;
        let id = item.id();
        let bytes = self.prepare(item)?;
        let path = self.node_path(id)?;
        session
            .write(&path, &bytes)
            .map_err(|e| RepoError::on_existing(id, "updating", e))?;
        debug!(id, %path, bytes = bytes.len(), "item updated");
        Ok(())
    }

    /// Delete a stored item. Fails with `NotFound` if its id is absent.
    ///
    /// Check and delete are separate store calls; losing a race to another
    /// deleter in between still counts as success.
    pub fn remove(&self, id: ItemId) -> RepoResult<()> {
        let session = self.session()?;
        let path = self.node_path(id)?;
        let present = session
            .exists(&path)
            .map_err(|e| RepoError::io(format!("removing item {id}"), e))?;
        if !present {
            return Err(RepoError::NotFound { id });
        }
        match session.delete(&path) {
            Ok(()) => debug!(id, %path, "item removed"),
            Err(e) if e.code() == ErrorCode::NoNode => {
                debug!(id, %path, "item already removed by a concurrent deleter")
            }
            Err(e) => return Err(RepoError::io(format!("removing item {id}"), e)),
        }
        Ok(())
    }

    /// Read and decode one item.
    pub fn get(&self, id: ItemId) -> RepoResult<T> {
        let session = self.session()?;
        self.read_item(&*session, id)
    }

    /// Whether an item with this id is stored.
    pub fn contains(&self, id: ItemId) -> RepoResult<bool> {
        let session = self.session()?;
        let path = self.node_path(id)?;
        session
            .exists(&path)
            .map_err(|e| RepoError::io(format!("checking item {id}"), e))
    }

    /// Ids of all stored items, ascending.
    pub fn ids(&self) -> RepoResult<Vec<ItemId>> {
        let session = self.session()?;
        self.list_ids(&*session)
    }

    /// Read every stored item into a map, live from the store.
    ///
    /// Items deleted between the listing and their read are left out.
    pub fn snapshot(&self) -> RepoResult<BTreeMap<ItemId, T>> {
        let session = self.session()?;
        let mut items = BTreeMap::new();
        for id in self.list_ids(&*session)? {
            match self.read_item(&*session, id) {
                Ok(item) => {
                    items.insert(id, item);
                }
                Err(RepoError::NotFound { .. }) => {
                    debug!(id, "item vanished while taking snapshot")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    /// Register a handler run after every change to the item set.
    ///
    /// Handlers run in registration order on the notifier thread and must
    /// not block. They stay registered for the repository's lifetime.
    /// Registering before [`open`](Self::open) also observes the initial
    /// load of a non-empty root.
    pub fn register_change_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.register(Arc::new(callback));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle<C::Store>> {
        self.lifecycle.lock().expect("lifecycle lock poisoned")
    }

    fn session(&self) -> RepoResult<Arc<C::Store>> {
        match &*self.lock() {
            Lifecycle::Open { session, .. } => Ok(Arc::clone(session)),
            Lifecycle::Created => Err(RepoError::InvariantViolation(format!(
                "repository at {} used before open",
                self.root_path()
            ))),
            Lifecycle::Closed => Err(RepoError::InvariantViolation(format!(
                "repository at {} used after close",
                self.root_path()
            ))),
        }
    }

    fn node_path(&self, id: ItemId) -> RepoResult<String> {
        child_path(self.root_path(), &id.to_string())
            .map_err(|e| RepoError::InvariantViolation(e.to_string()))
    }

    /// Validate and encode an item ahead of a write.
    fn prepare(&self, item: &T) -> RepoResult<Vec<u8>> {
        let id = item.id();
        item.validate(self)
            .map_err(|source| RepoError::Validation { id, source })?;
        item.encode().map_err(|source| RepoError::Encode { id, source })
    }

    fn read_item(&self, session: &C::Store, id: ItemId) -> RepoResult<T> {
        let path = self.node_path(id)?;
        let bytes = session
            .read(&path)
            .map_err(|e| RepoError::on_existing(id, "reading", e))?;
        T::decode(&bytes).map_err(|source| {
            error!(id, %path, error = %source, "stored item does not decode");
            RepoError::Decode { id, source }
        })
    }

    fn list_ids(&self, session: &C::Store) -> RepoResult<Vec<ItemId>> {
        let root = self.root_path();
        let names = session
            .list_children(root)
            .map_err(|e| RepoError::io(format!("listing children of {root}"), e))?;
        let mut ids = names
            .iter()
            .map(|name| {
                parse_node_name(name).ok_or_else(|| {
                    error!(root, %name, "foreign node under repository root");
                    RepoError::InvariantViolation(format!(
                        "node {name:?} under {root} is not an item id"
                    ))
                })
            })
            .collect::<RepoResult<Vec<_>>>()?;
        ids.sort_unstable();
        Ok(ids)
    }
}

impl<T: RepositoryItem, C: StoreConnector> ItemLookup<T> for Repository<T, C> {
    fn get(&self, id: ItemId) -> RepoResult<T> {
        Repository::get(self, id)
    }

    fn contains(&self, id: ItemId) -> RepoResult<bool> {
        Repository::contains(self, id)
    }

    fn snapshot(&self) -> RepoResult<BTreeMap<ItemId, T>> {
        Repository::snapshot(self)
    }
}

impl<T: RepositoryItem, C: StoreConnector> Drop for Repository<T, C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(root = self.root_path(), error = %e, "error closing repository on drop");
        }
    }
}

impl<T: RepositoryItem, C: StoreConnector> std::fmt::Debug for Repository<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("root_path", &self.config.root_path)
            .field("address", &self.config.store.address)
            .field("state", &self.lock().name())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::thread;
    use std::time::{Duration, Instant};

    use noderepo_store::{
        ChildrenWatch, InMemorySession, InMemoryStore, StoreConfig, StoreResult, WatchId,
    };
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::codec::{BincodeCodec, JsonCodec};
    use crate::error::ValidationError;

    const ROOT: &str = "/test_repository";
    const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct TestEntity {
        id: u64,
        name: String,
    }

    impl TestEntity {
        fn new(id: u64, name: &str) -> Self {
            Self {
                id,
                name: name.into(),
            }
        }
    }

    impl RepositoryItem for TestEntity {
        type Codec = JsonCodec;

        fn id(&self) -> ItemId {
            self.id
        }

        fn validate(&self, _repository: &dyn ItemLookup<Self>) -> Result<(), ValidationError> {
            let mut errors = Vec::new();
            if self.id > i16::MAX as u64 {
                errors.push(format!("id must not exceed {}", i16::MAX));
            }
            if self.name.is_empty() {
                errors.push("name must not be empty".to_string());
            }
            ValidationError::check(errors)
        }
    }

    /// Rejects a name already used by a different stored item.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct UniqueName {
        id: u64,
        name: String,
    }

    impl RepositoryItem for UniqueName {
        type Codec = BincodeCodec;

        fn id(&self) -> ItemId {
            self.id
        }

        fn validate(&self, repository: &dyn ItemLookup<Self>) -> Result<(), ValidationError> {
            let taken = repository
                .snapshot()
                .map_err(|e| ValidationError::new(format!("cannot check names: {e}")))?
                .values()
                .any(|other| other.id != self.id && other.name == self.name);
            if taken {
                return Err(ValidationError::new(format!("name {:?} is taken", self.name)));
            }
            Ok(())
        }
    }

    type TestRepository = Repository<TestEntity, InMemoryStore>;

    fn config(store: &InMemoryStore) -> RepositoryConfig {
        RepositoryConfig::new(
            ROOT,
            StoreConfig {
                connect_timeout_ms: 100,
                retry_count: 1,
                retry_backoff_ms: 1,
                ..StoreConfig::with_address(store.address())
            },
        )
    }

    fn raw_session(store: &InMemoryStore) -> InMemorySession {
        store.connect(&config(store).store).unwrap()
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn open_repository(store: &InMemoryStore) -> TestRepository {
        init_tracing();
        let repo = TestRepository::new(store.clone(), config(store)).unwrap();
        repo.init_root().unwrap();
        repo.open().unwrap();
        repo
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    #[test]
    fn entity_crud_scenario() {
        let store = InMemoryStore::new("memory:crud");
        let repo = open_repository(&store);

        let first = TestEntity::new(1, "testEntity1");
        repo.add(&first).unwrap();
        assert_eq!(repo.get(1).unwrap(), first);

        let err = repo.add(&TestEntity::new(1, "dup")).unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(repo.get(1).unwrap(), first);

        assert!(repo.get(2).unwrap_err().is_not_found());
        assert!(repo.update(&TestEntity::new(3, "x")).unwrap_err().is_not_found());
        assert!(repo.remove(2).unwrap_err().is_not_found());

        repo.add(&TestEntity::new(2, "testEntity2")).unwrap();
        let renamed = TestEntity::new(2, "TestEntity2Update");
        repo.update(&renamed).unwrap();
        assert_eq!(repo.get(2).unwrap(), renamed);

        repo.remove(2).unwrap();
        assert!(repo.get(2).unwrap_err().is_not_found());
        assert!(repo.remove(3).unwrap_err().is_not_found());
        repo.close().unwrap();
    }

    #[test]
    fn failed_update_creates_nothing() {
        let store = InMemoryStore::new("memory:crud");
        let repo = open_repository(&store);
        let nodes = store.node_count();

        assert!(repo.update(&TestEntity::new(9, "ghost")).is_err());
        assert_eq!(store.node_count(), nodes);
        assert!(!repo.contains(9).unwrap());
    }

    #[test]
    fn validation_gates_add_and_update() {
        let store = InMemoryStore::new("memory:crud");
        let repo = open_repository(&store);
        let nodes = store.node_count();

        let too_large = TestEntity::new(40_000, "big");
        assert!(matches!(
            repo.add(&too_large).unwrap_err(),
            RepoError::Validation { id: 40_000, .. }
        ));
        let unnamed = TestEntity::new(1, "");
        assert!(matches!(
            repo.add(&unnamed).unwrap_err(),
            RepoError::Validation { .. }
        ));
        assert_eq!(store.node_count(), nodes);

        repo.add(&TestEntity::new(1, "named")).unwrap();
        let err = repo.update(&unnamed).unwrap_err();
        match err {
            RepoError::Validation { source, .. } => {
                assert_eq!(source.messages(), ["name must not be empty"]);
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        assert_eq!(repo.get(1).unwrap().name, "named");
    }

    #[test]
    fn validation_reports_every_failure() {
        let store = InMemoryStore::new("memory:crud");
        let repo = open_repository(&store);
        match repo.add(&TestEntity::new(50_000, "")).unwrap_err() {
            RepoError::Validation { source, .. } => assert_eq!(source.messages().len(), 2),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn validation_can_consult_stored_items() {
        let store = InMemoryStore::new("memory:unique");
        let repo: Repository<UniqueName, _> =
            Repository::new(store.clone(), config(&store)).unwrap();
        repo.init_root().unwrap();
        repo.open().unwrap();

        let ferrari = UniqueName {
            id: 1,
            name: "Ferrari".into(),
        };
        repo.add(&ferrari).unwrap();
        let clash = UniqueName {
            id: 2,
            name: "Ferrari".into(),
        };
        assert!(matches!(
            repo.add(&clash).unwrap_err(),
            RepoError::Validation { id: 2, .. }
        ));
        // Re-saving an item under its own name is fine.
        repo.update(&ferrari).unwrap();
        assert_eq!(repo.get(1).unwrap(), ferrari);
    }

    #[test]
    fn nodes_hold_encoded_items_named_by_id() {
        let store = InMemoryStore::new("memory:layout");
        let repo = open_repository(&store);
        repo.add(&TestEntity::new(12, "layout")).unwrap();

        let raw = raw_session(&store);
        assert_eq!(raw.list_children(ROOT).unwrap(), vec!["12"]);
        assert_eq!(
            raw.read("/test_repository/12").unwrap(),
            br#"{"id":12,"name":"layout"}"#
        );
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    #[test]
    fn snapshot_tracks_every_mutation() {
        let store = InMemoryStore::new("memory:snapshot");
        let repo = open_repository(&store);
        assert!(repo.snapshot().unwrap().is_empty());

        repo.add(&TestEntity::new(1, "a")).unwrap();
        repo.add(&TestEntity::new(10, "b")).unwrap();
        repo.add(&TestEntity::new(2, "c")).unwrap();
        let snap = repo.snapshot().unwrap();
        assert_eq!(snap.keys().copied().collect::<Vec<_>>(), vec![1, 2, 10]);
        assert_eq!(repo.ids().unwrap(), vec![1, 2, 10]);

        repo.update(&TestEntity::new(10, "b2")).unwrap();
        assert_eq!(repo.snapshot().unwrap()[&10].name, "b2");

        repo.remove(1).unwrap();
        let snap = repo.snapshot().unwrap();
        assert!(!snap.contains_key(&1));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn foreign_child_name_is_an_invariant_violation() {
        let store = InMemoryStore::new("memory:foreign");
        let repo = open_repository(&store);
        repo.add(&TestEntity::new(1, "ok")).unwrap();

        let raw = raw_session(&store);
        raw.create_persistent("/test_repository/not-a-number", b"{}", false)
            .unwrap();
        let err = repo.snapshot().unwrap_err();
        assert!(matches!(err, RepoError::InvariantViolation(_)));
        assert!(err.is_fatal());

        raw.delete("/test_repository/not-a-number").unwrap();
        raw.create_persistent("/test_repository/007", b"{}", false).unwrap();
        assert!(repo.ids().unwrap_err().is_fatal());
    }

    #[test]
    fn corrupt_payload_is_a_decode_failure() {
        let store = InMemoryStore::new("memory:corrupt");
        let repo = open_repository(&store);

        let raw = raw_session(&store);
        raw.create_persistent("/test_repository/5", b"\x00garbage", false)
            .unwrap();
        let err = repo.get(5).unwrap_err();
        assert!(matches!(err, RepoError::Decode { id: 5, .. }));
        assert!(err.is_fatal());
        assert!(repo.snapshot().unwrap_err().is_fatal());
    }

    // -----------------------------------------------------------------------
    // Races with other clients
    // -----------------------------------------------------------------------

    /// Connector whose sessions let a rival session delete a node in the
    /// gap between two of the repository's store calls.
    #[derive(Clone)]
    struct InterleavingStore {
        inner: InMemoryStore,
        after_exists: Arc<Mutex<Option<String>>>,
        before_read: Arc<Mutex<Option<String>>>,
    }

    impl InterleavingStore {
        fn new(inner: InMemoryStore) -> Self {
            Self {
                inner,
                after_exists: Arc::default(),
                before_read: Arc::default(),
            }
        }

        /// Delete `path` once, right after the next `exists` on it returns.
        fn delete_after_exists(&self, path: &str) {
            *self.after_exists.lock().unwrap() = Some(path.to_string());
        }

        /// Delete `path` once, right before the next `read` of it.
        fn delete_before_read(&self, path: &str) {
            *self.before_read.lock().unwrap() = Some(path.to_string());
        }
    }

    impl StoreConnector for InterleavingStore {
        type Store = InterleavingSession;

        fn connect(&self, config: &StoreConfig) -> StoreResult<InterleavingSession> {
            Ok(InterleavingSession {
                inner: self.inner.connect(config)?,
                rival: self.inner.connect(config)?,
                after_exists: Arc::clone(&self.after_exists),
                before_read: Arc::clone(&self.before_read),
            })
        }
    }

    struct InterleavingSession {
        inner: InMemorySession,
        rival: InMemorySession,
        after_exists: Arc<Mutex<Option<String>>>,
        before_read: Arc<Mutex<Option<String>>>,
    }

    fn take_if_armed(slot: &Mutex<Option<String>>, path: &str) -> bool {
        let mut slot = slot.lock().unwrap();
        if slot.as_deref() == Some(path) {
            *slot = None;
            true
        } else {
            false
        }
    }

    impl CoordinationStore for InterleavingSession {
        fn exists(&self, path: &str) -> StoreResult<bool> {
            let present = self.inner.exists(path)?;
            if take_if_armed(&self.after_exists, path) {
                self.rival.delete(path)?;
            }
            Ok(present)
        }

        fn create_persistent(&self, path: &str, data: &[u8], create_parents: bool) -> StoreResult<()> {
            self.inner.create_persistent(path, data, create_parents)
        }

        fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
            if take_if_armed(&self.before_read, path) {
                self.rival.delete(path)?;
            }
            self.inner.read(path)
        }

        fn write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
            self.inner.write(path, data)
        }

        fn delete(&self, path: &str) -> StoreResult<()> {
            self.inner.delete(path)
        }

        fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
            self.inner.list_children(path)
        }

        fn watch_children(&self, path: &str) -> StoreResult<ChildrenWatch> {
            self.inner.watch_children(path)
        }

        fn unwatch(&self, id: WatchId) -> StoreResult<()> {
            self.inner.unwatch(id)
        }

        fn close(&self) -> StoreResult<()> {
            self.rival.close()?;
            self.inner.close()
        }
    }

    fn open_interleaving(store: &InterleavingStore) -> Repository<TestEntity, InterleavingStore> {
        init_tracing();
        let repo = Repository::new(store.clone(), config(&store.inner)).unwrap();
        repo.init_root().unwrap();
        repo.open().unwrap();
        repo
    }

    #[test]
    fn remove_losing_race_to_another_deleter_succeeds() {
        let store = InterleavingStore::new(InMemoryStore::new("memory:race-remove"));
        let repo = open_interleaving(&store);
        repo.add(&TestEntity::new(1, "a")).unwrap();

        store.delete_after_exists(&format!("{ROOT}/1"));
        repo.remove(1).unwrap();
        assert!(!repo.contains(1).unwrap());

        // Without a race, an absent id is still reported.
        assert!(repo.remove(1).unwrap_err().is_not_found());
    }

    #[test]
    fn snapshot_skips_item_deleted_before_its_read() {
        let store = InterleavingStore::new(InMemoryStore::new("memory:race-snapshot"));
        let repo = open_interleaving(&store);
        for id in 1..=3 {
            repo.add(&TestEntity::new(id, "x")).unwrap();
        }

        store.delete_before_read(&format!("{ROOT}/2"));
        let snap = repo.snapshot().unwrap();
        assert_eq!(snap.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(repo.get(2).unwrap_err().is_not_found());
    }

    // -----------------------------------------------------------------------
    // Store failures
    // -----------------------------------------------------------------------

    #[test]
    fn unreachable_store_surfaces_as_io_failure() {
        let store = InMemoryStore::new("memory:flaky");
        let repo = open_repository(&store);
        repo.add(&TestEntity::new(1, "before")).unwrap();

        store.set_available(false);
        let err = repo.add(&TestEntity::new(2, "during")).unwrap_err();
        match &err {
            RepoError::Io { source, .. } => assert!(source.is_transient()),
            other => panic!("expected Io, got {other:?}"),
        }
        assert!(matches!(repo.get(1).unwrap_err(), RepoError::Io { .. }));
        assert!(matches!(repo.remove(1).unwrap_err(), RepoError::Io { .. }));
        assert!(matches!(repo.snapshot().unwrap_err(), RepoError::Io { .. }));

        store.set_available(true);
        assert_eq!(repo.get(1).unwrap().name, "before");
        assert!(!repo.contains(2).unwrap());
    }

    #[test]
    fn open_fails_when_store_unreachable() {
        let store = InMemoryStore::new("memory:down");
        let repo = TestRepository::new(store.clone(), config(&store)).unwrap();
        repo.init_root().unwrap();
        store.set_available(false);
        assert!(matches!(repo.open().unwrap_err(), RepoError::Io { .. }));

        store.set_available(true);
        repo.open().unwrap();
        assert!(repo.is_open());
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn init_root_is_idempotent_and_creates_ancestors() {
        let store = InMemoryStore::new("memory:init");
        let mut cfg = config(&store);
        cfg.root_path = "/apps_root/cars".into();
        let repo: TestRepository = Repository::new(store.clone(), cfg).unwrap();

        repo.init_root().unwrap();
        repo.init_root().unwrap();
        let raw = raw_session(&store);
        assert!(raw.exists("/apps_root/cars").unwrap());
        // init_root leaves no session or watch behind.
        assert_eq!(store.watcher_count(), 0);
    }

    #[test]
    fn open_requires_existing_root() {
        let store = InMemoryStore::new("memory:noroot");
        let repo = TestRepository::new(store.clone(), config(&store)).unwrap();
        assert!(matches!(
            repo.open().unwrap_err(),
            RepoError::RootMissing { .. }
        ));
        assert!(!repo.is_open());
        assert_eq!(store.watcher_count(), 0);
    }

    #[test]
    fn crud_before_open_fails_fast() {
        let store = InMemoryStore::new("memory:life");
        let repo = TestRepository::new(store.clone(), config(&store)).unwrap();
        repo.init_root().unwrap();
        for err in [
            repo.add(&TestEntity::new(1, "a")).unwrap_err(),
            repo.get(1).unwrap_err(),
            repo.remove(1).unwrap_err(),
            repo.snapshot().unwrap_err(),
        ] {
            assert!(matches!(err, RepoError::InvariantViolation(_)), "{err:?}");
        }
    }

    #[test]
    fn double_open_is_rejected() {
        let store = InMemoryStore::new("memory:life");
        let repo = open_repository(&store);
        assert!(matches!(
            repo.open().unwrap_err(),
            RepoError::InvariantViolation(_)
        ));
        assert!(repo.is_open());
        assert_eq!(store.watcher_count(), 1);
    }

    #[test]
    fn crud_after_close_fails_fast() {
        let store = InMemoryStore::new("memory:life");
        let repo = open_repository(&store);
        repo.add(&TestEntity::new(1, "kept")).unwrap();
        repo.close().unwrap();
        repo.close().unwrap();

        assert!(!repo.is_open());
        assert_eq!(store.watcher_count(), 0);
        assert!(matches!(
            repo.update(&TestEntity::new(1, "late")).unwrap_err(),
            RepoError::InvariantViolation(_)
        ));
        assert!(matches!(
            repo.open().unwrap_err(),
            RepoError::InvariantViolation(_)
        ));

        // Nodes outlive the repository object.
        let reopened = open_repository(&store);
        assert_eq!(reopened.get(1).unwrap().name, "kept");
    }

    #[test]
    fn close_without_open_is_a_no_op() {
        let store = InMemoryStore::new("memory:life");
        let repo = TestRepository::new(store.clone(), config(&store)).unwrap();
        repo.close().unwrap();
        repo.init_root().unwrap();
        repo.open().unwrap();
    }

    #[test]
    fn rejects_invalid_config() {
        let store = InMemoryStore::new("memory:cfg");
        let mut cfg = config(&store);
        cfg.root_path = "relative/root".into();
        assert!(matches!(
            TestRepository::new(store, cfg).unwrap_err(),
            RepoError::Config(_)
        ));
    }

    #[test]
    fn wrong_address_fails_init() {
        let store = InMemoryStore::new("memory:here");
        let mut cfg = config(&store);
        cfg.store.address = "memory:elsewhere".into();
        let repo = TestRepository::new(store, cfg).unwrap();
        assert!(matches!(repo.init_root().unwrap_err(), RepoError::Io { .. }));
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_adds_of_distinct_ids() {
        let store = InMemoryStore::new("memory:concurrent");
        let repo = Arc::new(open_repository(&store));

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || {
                    for i in 0..10 {
                        let id = t * 10 + i;
                        repo.add(&TestEntity::new(id, &format!("item-{id}"))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(repo.snapshot().unwrap().len(), 80);
    }

    #[test]
    fn only_one_concurrent_add_of_an_id_wins() {
        let store = InMemoryStore::new("memory:race");
        let repo = Arc::new(open_repository(&store));

        let handles: Vec<_> = (0..6)
            .map(|t| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || repo.add(&TestEntity::new(7, &format!("writer-{t}"))))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(RepoError::is_duplicate));
    }

    // -----------------------------------------------------------------------
    // Change notification
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        last: Mutex<BTreeMap<ItemId, TestEntity>>,
    }

    impl Recorder {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last(&self) -> BTreeMap<ItemId, TestEntity> {
            self.last.lock().unwrap().clone()
        }
    }

    /// Register a callback that copies the current snapshot on every change.
    fn record_snapshots(repo: &Arc<TestRepository>) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<TestRepository> = Arc::downgrade(repo);
        let rec = Arc::clone(&recorder);
        repo.register_change_callback(move || {
            let Some(repo) = weak.upgrade() else { return };
            if let Ok(snapshot) = repo.snapshot() {
                *rec.last.lock().unwrap() = snapshot;
            }
            rec.calls.fetch_add(1, Ordering::SeqCst);
        });
        recorder
    }

    #[test]
    fn notification_and_snapshot() {
        let store = InMemoryStore::new("memory:notify");
        let repo = Arc::new(open_repository(&store));
        let recorder = record_snapshots(&repo);

        let entity = TestEntity::new(1, "TestEntity1");
        repo.add(&entity).unwrap();
        assert!(wait_until(NOTIFY_TIMEOUT, || {
            recorder.calls() == 1 && recorder.last().get(&1) == Some(&entity)
        }));

        let updated = TestEntity::new(1, "TestEntityUpdated");
        repo.update(&updated).unwrap();
        assert!(wait_until(NOTIFY_TIMEOUT, || {
            recorder.calls() == 2 && recorder.last().get(&1) == Some(&updated)
        }));

        repo.remove(1).unwrap();
        assert!(wait_until(NOTIFY_TIMEOUT, || {
            recorder.calls() == 3 && recorder.last().is_empty()
        }));
        repo.close().unwrap();
    }

    #[test]
    fn every_callback_runs_per_change() {
        let store = InMemoryStore::new("memory:fanout");
        let repo = open_repository(&store);
        let counts: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for c in &counts {
            let c = Arc::clone(c);
            repo.register_change_callback(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        repo.add(&TestEntity::new(1, "a")).unwrap();
        repo.add(&TestEntity::new(2, "b")).unwrap();
        assert!(wait_until(NOTIFY_TIMEOUT, || {
            counts.iter().all(|c| c.load(Ordering::SeqCst) == 2)
        }));
    }

    #[test]
    fn opening_populated_root_fires_initial_load_once() {
        let store = InMemoryStore::new("memory:initial");
        {
            let seeding = open_repository(&store);
            seeding.add(&TestEntity::new(1, "existing")).unwrap();
            seeding.add(&TestEntity::new(2, "existing")).unwrap();
        }

        let repo = TestRepository::new(store.clone(), config(&store)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        repo.register_change_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        repo.open().unwrap();

        assert!(wait_until(NOTIFY_TIMEOUT, || calls.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn opening_empty_root_fires_nothing() {
        let store = InMemoryStore::new("memory:initial");
        let repo = TestRepository::new(store.clone(), config(&store)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        repo.register_change_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        repo.init_root().unwrap();
        repo.open().unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_operations_notify_nobody() {
        let store = InMemoryStore::new("memory:quiet");
        let repo = Arc::new(open_repository(&store));
        let recorder = record_snapshots(&repo);
        repo.add(&TestEntity::new(1, "a")).unwrap();
        assert!(wait_until(NOTIFY_TIMEOUT, || recorder.calls() == 1));

        assert!(repo.add(&TestEntity::new(1, "dup")).is_err());
        assert!(repo.update(&TestEntity::new(2, "missing")).is_err());
        assert!(repo.remove(3).is_err());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.calls(), 1);
    }

    #[test]
    fn slow_callback_does_not_block_crud() {
        let store = InMemoryStore::new("memory:slow");
        let repo = open_repository(&store);
        repo.register_change_callback(|| thread::sleep(Duration::from_millis(200)));

        let started = Instant::now();
        for id in 1..=5 {
            repo.add(&TestEntity::new(id, "fast")).unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(repo.ids().unwrap().len(), 5);
    }

    #[test]
    fn callback_may_close_the_repository() {
        let store = InMemoryStore::new("memory:reentrant");
        let repo = Arc::new(open_repository(&store));
        let weak = Arc::downgrade(&repo);
        let closed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        repo.register_change_callback(move || {
            if let Some(repo) = weak.upgrade() {
                if repo.close().is_ok() {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        repo.add(&TestEntity::new(1, "trigger")).unwrap();
        assert!(wait_until(NOTIFY_TIMEOUT, || !repo.is_open()));
        assert!(wait_until(NOTIFY_TIMEOUT, || store.watcher_count() == 0));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
