//! Message bus abstraction used for request/reply between the dispatcher and
//! the capture workers.
//!
//! The bus offers four primitives:
//!
//! - **publish** with a reply address,
//! - **subscribe** (every message on a topic reaches this subscriber),
//! - **group subscribe** (each message reaches exactly one member of a group,
//!   i.e. competing consumers),
//! - **reply** to a reply address.
//!
//! Subscriptions hand out an explicit [`Delivery`] so consumers never have to
//! infer a disconnect from an empty payload.

use crate::BusError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A message received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    /// Reply address set by the publisher, `None` for replies themselves.
    pub reply_to: Option<String>,
}

/// Outcome of waiting on a subscription.
#[derive(Debug, Clone)]
pub enum Delivery {
    Message(Message),
    /// The subscription ended normally: cancelled, released or the bus shut down.
    Closed,
    /// The transport failed while draining the subscription.
    Failed(BusError),
}

/// Pub/sub transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Best-effort send. Fails only on transport errors, never because
    /// nobody is listening.
    async fn publish(&self, topic: &str, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Exclusive subscription: every message on `topic` is delivered here.
    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError>;

    /// Competing-consumer subscription: each message on `topic` is delivered
    /// to exactly one live subscriber sharing `group`.
    async fn group_subscribe(
        &self,
        topic: &str,
        group: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError>;

    /// Publish `payload` to a one-off reply address.
    async fn reply(&self, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// Hook run once when a subscription is dropped, used by adapters to
/// unregister the subscriber.
pub(crate) type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Items pushed by an adapter into a subscription.
pub(crate) type Feed = Result<Message, BusError>;

/// Receiving half of a subscription.
///
/// The subscription ends when its cancellation token fires, when the adapter
/// closes the feed, or after the first transport failure. Once ended it keeps
/// returning [`Delivery::Closed`]. Dropping it releases the subscription on the bus.
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<Feed>,
    cancel: CancellationToken,
    finished: bool,
    release: Option<ReleaseHook>,
}

impl Subscription {
    pub(crate) fn new(
        topic: impl Into<String>,
        receiver: mpsc::Receiver<Feed>,
        cancel: CancellationToken,
        release: Option<ReleaseHook>,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            cancel,
            finished: false,
            release,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next delivery.
    pub async fn next(&mut self) -> Delivery {
        if self.finished {
            return Delivery::Closed;
        }

        let delivery = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Delivery::Closed,
            item = self.receiver.recv() => match item {
                Some(Ok(message)) => Delivery::Message(message),
                Some(Err(error)) => Delivery::Failed(error),
                None => Delivery::Closed,
            },
        };

        if !matches!(delivery, Delivery::Message(_)) {
            self.finish();
        }
        delivery
    }

    fn finish(&mut self) {
        self.finished = true;
        self.receiver.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("finished", &self.finished)
            .finish()
    }
}
