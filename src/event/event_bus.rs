use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::model::{Document, NodeId};

/// What changed about a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ChangeKind {
    Value,
    Relevance,
    /// A repeat instance was added or removed.
    Structure,
    Requiredness,
    Readonly,
    Validity,
    /// The option list of a select node was rebuilt.
    Itemset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Template path of the node.
    pub path: String,
    /// 0-based index among nodes sharing the template path.
    pub index: usize,
    /// Innermost repeat series enclosing the node, if any.
    pub repeat_path: Option<String>,
    pub repeat_index: Option<usize>,
    #[serde(skip)]
    pub node: NodeId,
}

impl ChangeEvent {
    /// Describes `node` as it currently sits in `doc`. `is_series` tells
    /// which template paths are repeat series.
    pub fn for_node(
        doc: &Document,
        node: NodeId,
        kind: ChangeKind,
        is_series: impl Fn(&str) -> bool,
    ) -> Self {
        let path = doc.template_path(node);
        let index = doc.index_of(node);
        let mut repeat = None;
        let mut chain = vec![node];
        chain.extend(doc.ancestors(node));
        for candidate in chain {
            let candidate_path = doc.template_path(candidate);
            if is_series(&candidate_path) {
                repeat = Some((candidate_path, doc.index_of(candidate)));
                break;
            }
        }
        let (repeat_path, repeat_index) = match repeat {
            Some((p, i)) => (Some(p), Some(i)),
            None => (None, None),
        };
        Self {
            kind,
            path,
            index,
            repeat_path,
            repeat_index,
            node,
        }
    }
}

pub type EventResult<T> = Result<T, EventError>;

/// # EventBus
///
/// Broadcast hub for [`ChangeEvent`]s. Publishing never blocks: a receiver
/// that falls more than `capacity` events behind observes
/// [`EventError::Lagged`] once and then reads on from the oldest event the
/// channel still holds.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe())
    }

    /// Broadcasts `event`. Having no subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        debug_event("Publishing", &event);
        if self.sender.send(event).is_err() {
            trace!("No subscribers for change event");
        }
    }

    pub fn subscribers_size(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub fn debug_event(prefix: &str, event: &ChangeEvent) {
    match event.kind {
        ChangeKind::Value => trace!("{} Event: {:?}", prefix, event),
        _ => debug!("{} Event: {:?}", prefix, event),
    }
}

pub struct EventReceiver {
    pub receiver: broadcast::Receiver<ChangeEvent>,
    missed: u64,
}

impl EventReceiver {
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            receiver,
            missed: 0,
        }
    }

    /// Events overwritten before this receiver could read them.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn lagged(&mut self, count: u64) -> EventError {
        self.missed += count;
        warn!(count, total = self.missed, "Event receiver lagged");
        EventError::Lagged { count }
    }

    /// Waits for the next event. On lag, reports how many events were lost;
    /// the next call returns the oldest event still buffered.
    pub async fn recv(&mut self) -> EventResult<ChangeEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(self.lagged(n)),
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> EventResult<Option<ChangeEvent>> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(self.lagged(n)),
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Collects every buffered event. After a lag this is whatever the
    /// channel still holds; the loss is counted in [`Self::missed`].
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(EventError::Lagged { .. }) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Receiver lagged behind by {count} events")]
    Lagged { count: u64 },

    #[error("Event Receive failed: {message}")]
    ReceiveFailed { message: String },
}
