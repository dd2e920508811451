use pkg_types::{Kind, Object};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    /// Store revision produced by the write.
    pub revision: u64,
    pub event_type: EventType,
    /// The object after the write; for deletes, its last stored state.
    pub object: Object,
}

impl WatchEvent {
    pub fn kind(&self) -> Kind {
        self.object.kind()
    }
}

/// Sending half kept by the store, one per subscriber.
pub(crate) struct WatcherEntry {
    pub(crate) kind: Kind,
    pub(crate) tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Receiving half of a watch subscription.
///
/// Only events emitted after registration are delivered. The stream ends
/// (`recv` yields `None`) when the store drops the subscription, e.g. on
/// `close` or `disconnect_watchers`. Dropping the watcher unsubscribes it.
pub struct Watcher {
    id: u64,
    kind: Kind,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watcher {
    pub(crate) fn new(id: u64, kind: Kind, rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { id, kind, rx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `None` when nothing is buffered right now.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<WatchEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}
