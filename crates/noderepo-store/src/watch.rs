use std::fmt;

use tokio::sync::mpsc;

/// Raw notification kinds produced by a children watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// A direct child was created.
    ChildAdded,
    /// A direct child's payload was overwritten.
    ChildUpdated,
    /// A direct child was deleted.
    ChildRemoved,
    /// The initial listing of a non-empty namespace has been loaded.
    Initialized,
    /// The session lost contact with the store.
    ConnectionSuspended,
    /// The session regained contact with the store.
    ConnectionReconnected,
    /// The session is gone for good.
    ConnectionLost,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ChildAdded => "ChildAdded",
            Self::ChildUpdated => "ChildUpdated",
            Self::ChildRemoved => "ChildRemoved",
            Self::Initialized => "Initialized",
            Self::ConnectionSuspended => "ConnectionSuspended",
            Self::ConnectionReconnected => "ConnectionReconnected",
            Self::ConnectionLost => "ConnectionLost",
        };
        write!(f, "{s}")
    }
}

/// One raw notification from a children watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Full path of the affected child, if the event concerns one.
    pub path: Option<String>,
}

impl WatchEvent {
    pub fn child(kind: WatchEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }

    pub fn bare(kind: WatchEventKind) -> Self {
        Self { kind, path: None }
    }
}

/// Identifier of a watch subscription within one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Receiving half of a children watch.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// A live subscription to the children of one node.
///
/// The event stream is lazy, unbounded, and cannot be restarted: it ends
/// (yields `None`) once the watch is cancelled through
/// [`CoordinationStore::unwatch`](crate::CoordinationStore::unwatch) or the
/// owning session closes.
#[derive(Debug)]
pub struct ChildrenWatch {
    id: WatchId,
    path: String,
    events: WatchStream,
}

impl ChildrenWatch {
    pub fn new(id: WatchId, path: impl Into<String>, events: WatchStream) -> Self {
        Self {
            id,
            path: path.into(),
            events,
        }
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Block the current thread until the next event, or `None` once the
    /// watch has ended. Must not be called from inside an async runtime.
    pub fn next_blocking(&mut self) -> Option<WatchEvent> {
        self.events.blocking_recv()
    }

    /// Take the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }
}
