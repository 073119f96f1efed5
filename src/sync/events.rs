//! Progress notifications for push and pull.

use tokio::sync::broadcast;

use super::push::PushStatus;
use crate::queue::OperationKind;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PushStarted { tables: Vec<String> },
    ItemWillBePushed { table: String, item_id: String, kind: OperationKind },
    ItemWasPushed { table: String, item_id: String, kind: OperationKind, success: bool },
    PushFinished { status: PushStatus },
    PullStarted { table: String, query_id: String },
    ItemWillBeStored { table: String, item_id: String },
    ItemWasStored { table: String, item_id: String, deleted: bool },
    PullFinished { table: String, query_id: String, items: u64, success: bool },
}

/// Sending side of the event channel. Sends never block and are dropped
/// when nobody listens.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}
