// ABOUTME: Lifecycle event types, pull-based event subscriptions and an in-process fan-out hub
// ABOUTME: Every subscriber gets its own copy of events published after it subscribed, with no replay

use crate::error::StreamError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    TaskStart,
    TaskExit { exit_status: Option<i64> },
    TaskOom,
    TaskDelete,
}

/// Immutable record broadcast by the execution engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub container_id: String,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl LifecycleEvent {
    pub fn task_exit(container_id: impl Into<String>, pid: u32, exit_status: Option<i64>) -> Self {
        Self {
            container_id: container_id.into(),
            pid,
            timestamp: Utc::now(),
            kind: EventKind::TaskExit { exit_status },
        }
    }

    /// True when this is the exit of the process instance `(id, pid)`
    pub fn is_exit_of(&self, id: &str, pid: u32) -> bool {
        matches!(self.kind, EventKind::TaskExit { .. })
            && self.container_id == id
            && self.pid == pid
    }
}

type EventItem = Result<LifecycleEvent>;

/// One consumer's view of the event stream.
///
/// Dropping the subscription cancels its token, which unregisters it from
/// whatever is feeding it.
pub struct EventSubscription {
    receiver: mpsc::UnboundedReceiver<EventItem>,
    cancel: CancellationToken,
}

impl EventSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<EventItem>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// Wait for the next event. Returns `StreamError::Cancelled` once the
    /// subscription's token is cancelled, even if events are still queued.
    pub async fn next(&mut self) -> Result<LifecycleEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
            item = self.receiver.recv() => match item {
                Some(item) => item,
                None => Err(StreamError::Closed),
            },
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Subscribable feed of lifecycle events for every task in the engine
#[async_trait]
pub trait EventService: Send + Sync {
    /// Start receiving events. Only events published after this call
    /// returns are delivered.
    async fn subscribe(&self, cancel: CancellationToken) -> Result<EventSubscription>;
}

struct Subscriber {
    sender: mpsc::UnboundedSender<EventItem>,
    cancel: CancellationToken,
}

/// Fan-out of a single event feed to any number of independent subscribers
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live subscriber, pruning the ones that were
    /// cancelled or dropped.
    pub async fn publish(&self, event: LifecycleEvent) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|subscriber| {
            !subscriber.cancel.is_cancelled() && subscriber.sender.send(Ok(event.clone())).is_ok()
        });
    }

    /// Terminate every current subscription with `error`
    pub async fn fail_all(&self, error: StreamError) {
        let mut subscribers = self.subscribers.write().await;
        debug!(
            "Terminating {} event subscriptions: {}",
            subscribers.len(),
            error
        );
        for subscriber in subscribers.drain(..) {
            let _ = subscriber.sender.send(Err(error.clone()));
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers
            .iter()
            .filter(|subscriber| !subscriber.cancel.is_cancelled())
            .count()
    }
}

#[async_trait]
impl EventService for EventHub {
    async fn subscribe(&self, cancel: CancellationToken) -> Result<EventSubscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().await;
        subscribers.push(Subscriber {
            sender,
            cancel: cancel.clone(),
        });
        Ok(EventSubscription::new(receiver, cancel))
    }
}
