//! Change notification over a children watch.
//!
//! The notifier owns one thread that drains the store's watch stream for
//! the repository root. Each raw event is classified; every qualifying
//! event triggers one pass over all registered callbacks, in registration
//! order, on that thread. Bursts are neither coalesced nor deduplicated.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use noderepo_store::{CoordinationStore, WatchEventKind, WatchId};
use tracing::{debug, error, warn};

use crate::error::{RepoError, RepoResult};

const NOTIFIER_THREAD_NAME: &str = "noderepo-notifier";

/// A change to the repository's set of items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    Added,
    Removed,
    Updated,
    /// The initial listing of a non-empty root was loaded.
    InitialLoad,
}

impl ChangeEvent {
    /// Map a raw watch event to a change, or `None` for events that do not
    /// concern the item set (connection state and the like).
    pub fn classify(kind: WatchEventKind) -> Option<Self> {
        match kind {
            WatchEventKind::ChildAdded => Some(Self::Added),
            WatchEventKind::ChildRemoved => Some(Self::Removed),
            WatchEventKind::ChildUpdated => Some(Self::Updated),
            WatchEventKind::Initialized => Some(Self::InitialLoad),
            WatchEventKind::ConnectionSuspended
            | WatchEventKind::ConnectionReconnected
            | WatchEventKind::ConnectionLost => None,
        }
    }
}

/// Whether a raw watch event should fire change callbacks.
pub fn qualifies(kind: WatchEventKind) -> bool {
    ChangeEvent::classify(kind).is_some()
}

/// A registered change handler.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Append-only, copy-on-write list of change callbacks.
///
/// Dispatch takes a snapshot of the list under a short read lock and runs
/// the callbacks without holding it, so registration never waits on a slow
/// callback and vice versa.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<Arc<Vec<ChangeCallback>>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: ChangeCallback) {
        let mut guard = self.callbacks.write().expect("callback lock poisoned");
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(callback);
        *guard = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().expect("callback lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback once, in registration order. A panicking
    /// callback is logged and skipped. Returns the number of callbacks that
    /// completed normally.
    pub fn dispatch(&self, event: ChangeEvent) -> usize {
        let current = self.callbacks.read().expect("callback lock poisoned").clone();
        let mut completed = 0;
        for (index, callback) in current.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(()) => completed += 1,
                Err(_) => error!(?event, index, "change callback panicked"),
            }
        }
        completed
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.len())
            .finish()
    }
}

/// Running state of a notifier.
struct Watching {
    watch_id: WatchId,
    thread: JoinHandle<()>,
}

/// Bridges a store children watch to a [`CallbackRegistry`].
///
/// `Stopped → start → Watching → cancel/join → Stopped`.
#[derive(Default)]
pub struct ChangeNotifier {
    watching: Option<Watching>,
    cancelled: Option<JoinHandle<()>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_watching(&self) -> bool {
        self.watching.is_some()
    }

    /// Subscribe to the children of `root` and start delivering changes to
    /// `callbacks` on a dedicated thread.
    pub fn start<S>(&mut self, store: &S, root: &str, callbacks: CallbackRegistry) -> RepoResult<()>
    where
        S: CoordinationStore + ?Sized,
    {
        if self.watching.is_some() {
            return Err(RepoError::InvariantViolation(format!(
                "change notifier for {root} is already watching"
            )));
        }

        let mut watch = store
            .watch_children(root)
            .map_err(|e| RepoError::io(format!("watching children of {root}"), e))?;
        let watch_id = watch.id();
        let root_path = root.to_string();

        let spawned = thread::Builder::new()
            .name(NOTIFIER_THREAD_NAME.into())
            .spawn(move || {
                while let Some(event) = watch.next_blocking() {
                    match ChangeEvent::classify(event.kind) {
                        Some(change) => {
                            let delivered = callbacks.dispatch(change);
                            debug!(root = %root_path, ?change, path = ?event.path, delivered, "change dispatched");
                        }
                        None => debug!(root = %root_path, kind = %event.kind, "watch event ignored"),
                    }
                }
                debug!(root = %root_path, "watch stream ended");
            });

        match spawned {
            Ok(thread) => {
                self.watching = Some(Watching { watch_id, thread });
                debug!(root, %watch_id, "change notifier started");
                Ok(())
            }
            Err(e) => {
                if let Err(unwatch) = store.unwatch(watch_id) {
                    warn!(root, error = %unwatch, "could not cancel watch after spawn failure");
                }
                Err(RepoError::Notifier(e))
            }
        }
    }

    /// Cancel the watch. Events already queued are still delivered; the
    /// thread exits once the stream ends.
    pub fn cancel<S>(&mut self, store: &S)
    where
        S: CoordinationStore + ?Sized,
    {
        if let Some(Watching { watch_id, thread }) = self.watching.take() {
            if let Err(e) = store.unwatch(watch_id) {
                warn!(%watch_id, error = %e, "could not cancel children watch");
            }
            self.cancelled = Some(thread);
        }
    }

    /// Wait for a cancelled notifier's thread to finish.
    ///
    /// Returns immediately when called from the notifier thread itself,
    /// i.e. from inside a change callback.
    pub fn join(&mut self) {
        let Some(thread) = self.cancelled.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            debug!("join requested from the notifier thread; detaching");
            return;
        }
        if thread.join().is_err() {
            error!("change notifier thread panicked");
        }
    }

    /// Cancel and join.
    pub fn stop<S>(&mut self, store: &S)
    where
        S: CoordinationStore + ?Sized,
    {
        self.cancel(store);
        self.join();
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("watching", &self.watching.as_ref().map(|w| w.watch_id))
            .finish()
    }
}
