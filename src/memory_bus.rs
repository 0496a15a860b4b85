//! In-process message bus
//!
//! Connects a dispatcher and a worker pool living in the same process
//! (standalone mode and tests). Each subscriber owns a bounded channel; group
//! members are served round-robin, skipping members whose buffer is full.
//! When every member is full the publisher waits for room.

use crate::bus::{Feed, Message, MessageBus, ReleaseHook, Subscription};
use crate::BusError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    topics: DashMap<String, Topic>,
    buffer_size: usize,
    next_id: AtomicU64,
    is_closed: AtomicBool,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Member>,
    groups: HashMap<String, Group>,
}

impl Topic {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.groups.is_empty()
    }
}

#[derive(Default)]
struct Group {
    members: Vec<Member>,
    cursor: usize,
}

struct Member {
    id: u64,
    sender: mpsc::Sender<Feed>,
}

impl MemoryBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                buffer_size: buffer_size.max(1),
                next_id: AtomicU64::new(0),
                is_closed: AtomicBool::new(false),
            }),
        }
    }

    /// Close the bus: every open subscription ends with `Closed` and further
    /// publishes fail.
    pub fn shutdown(&self) {
        self.inner.is_closed.store(true, Ordering::SeqCst);
        self.inner.topics.clear();
    }

    /// Number of live subscriptions (exclusive and group) on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|t| {
                t.subscribers.len() + t.groups.values().map(|g| g.members.len()).sum::<usize>()
            })
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.inner.is_closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn register(
        &self,
        topic: &str,
        group: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.buffer_size);
        let member = Member { id, sender };

        {
            let mut entry = self.inner.topics.entry(topic.to_string()).or_default();
            match group {
                Some(group) => entry
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .members
                    .push(member),
                None => entry.subscribers.push(member),
            }
        }

        debug!(topic, ?group, id, "Registered subscriber");

        let release = release_hook(
            Arc::downgrade(&self.inner),
            topic.to_string(),
            group.map(str::to_string),
            id,
        );
        Ok(Subscription::new(topic, receiver, cancel, Some(release)))
    }

    /// Hand `message` to every exclusive subscriber and to one member of
    /// every group. Full buffers are waited on, never skipped over, once no
    /// other member can take the message.
    async fn deliver(&self, topic: &str, message: Message) {
        let mut pending = Vec::new();
        {
            let Some(mut entry) = self.inner.topics.get_mut(topic) else {
                debug!(topic, "Published to topic without subscribers");
                return;
            };

            for member in &entry.subscribers {
                if let Err(TrySendError::Full(_)) = member.sender.try_send(Ok(message.clone())) {
                    pending.push((member.sender.clone(), member.id));
                }
            }

            for (name, group) in entry.groups.iter_mut() {
                match group.offer(&message) {
                    Offer::Taken => {}
                    Offer::Full(sender, id) => pending.push((sender, id)),
                    Offer::NoLiveMember => {
                        warn!(topic, group = %name, "No live group member, message dropped");
                    }
                }
            }
        }

        for (sender, id) in pending {
            debug!(topic, subscriber = id, "Subscriber buffer full, waiting");
            if sender.send(Ok(message.clone())).await.is_err() {
                warn!(topic, subscriber = id, "Subscriber closed before delivery, message dropped");
            }
        }
    }
}

enum Offer {
    Taken,
    /// Every member is full, the message goes to this one once it has room
    Full(mpsc::Sender<Feed>, u64),
    NoLiveMember,
}

impl Group {
    /// Hand `message` to the next member able to accept it right away.
    fn offer(&mut self, message: &Message) -> Offer {
        let len = self.members.len();
        let mut first_full = None;
        for step in 0..len {
            let idx = (self.cursor + step) % len;
            match self.members[idx].sender.try_send(Ok(message.clone())) {
                Ok(()) => {
                    self.cursor = (idx + 1) % len;
                    return Offer::Taken;
                }
                Err(TrySendError::Full(_)) => {
                    first_full.get_or_insert(idx);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        match first_full {
            Some(idx) => {
                self.cursor = (idx + 1) % len;
                let member = &self.members[idx];
                Offer::Full(member.sender.clone(), member.id)
            }
            None => Offer::NoLiveMember,
        }
    }
}

fn release_hook(inner: Weak<Inner>, topic: String, group: Option<String>, id: u64) -> ReleaseHook {
    Box::new(move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        if let Some(mut entry) = inner.topics.get_mut(&topic) {
            match &group {
                Some(name) => {
                    if let Some(g) = entry.groups.get_mut(name) {
                        g.members.retain(|m| m.id != id);
                        if g.members.is_empty() {
                            entry.groups.remove(name);
                        }
                    }
                }
                None => entry.subscribers.retain(|m| m.id != id),
            }
        }
        inner.topics.remove_if(&topic, |_, t| t.is_empty());
    })
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.ensure_open()?;
        self.deliver(
            topic,
            Message {
                payload,
                reply_to: Some(reply_to.to_string()),
            },
        )
        .await;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError> {
        self.register(topic, None, cancel)
    }

    async fn group_subscribe(
        &self,
        topic: &str,
        group: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError> {
        self.register(topic, Some(group), cancel)
    }

    async fn reply(&self, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.ensure_open()?;
        self.deliver(
            reply_to,
            Message {
                payload,
                reply_to: None,
            },
        )
        .await;
        Ok(())
    }
}
