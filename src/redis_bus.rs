//! Redis-backed message bus
//!
//! Lets the dispatcher and capture workers run as separate processes.
//!
//! - Exclusive subscriptions and replies use Redis pub/sub. The payload and
//!   reply address travel in a small JSON envelope. All exclusive
//!   subscriptions of a bus share one pub/sub connection; a router task fans
//!   incoming messages out to the subscriptions registered on each channel.
//! - Group subscriptions use a Redis stream per topic with one consumer group
//!   per subscription group. Entries are acknowledged as soon as they are read,
//!   so delivery is at-most-once.
//! - `publish` writes to both: a `PUBLISH` for exclusive subscribers and an
//!   `XADD ... NOMKSTREAM` that only lands when some group created the stream,
//!   so one-off reply addresses never leave streams behind.

use crate::bus::{Feed, Message, MessageBus, ReleaseHook, Subscription};
use crate::BusError;
use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, MultiplexedConnection, PubSubSink, PubSubStream};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

const FIELD_REPLY: &str = "reply";
const FIELD_DATA: &str = "data";
const STREAM_MAX_LEN: usize = 10_000;
const GROUP_READ_COUNT: usize = 16;
const GROUP_BLOCK: Duration = Duration::from_millis(250);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    data: String,
}

impl Envelope {
    fn encode(reply_to: Option<&str>, payload: &[u8]) -> Result<Vec<u8>, BusError> {
        let envelope = Envelope {
            reply_to: reply_to.map(str::to_string),
            data: base64::engine::general_purpose::STANDARD.encode(payload),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn decode(raw: &[u8]) -> Result<Message, BusError> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(envelope.data)
            .map_err(|e| BusError::Encoding(e.to_string()))?;
        Ok(Message {
            payload,
            reply_to: envelope.reply_to,
        })
    }
}

#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
    /// Serializes SUBSCRIBE / UNSUBSCRIBE against route changes
    sink: Arc<Mutex<PubSubSink>>,
    routes: Arc<Routes>,
    buffer_size: usize,
    _router: Arc<DropGuard>,
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus")
            .field("connection", &"ConnectionManager")
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

impl RedisBus {
    pub async fn connect(
        url: &str,
        buffer_size: usize,
        connect_timeout: Duration,
    ) -> Result<Self, BusError> {
        info!("Connecting to Redis bus at {}", url);

        let client = redis::Client::open(url)
            .map_err(|e| BusError::Connection(format!("invalid redis url {url}: {e}")))?;

        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                BusError::Connection(format!("timed out after {connect_timeout:?} connecting to {url}"))
            })?
            .map_err(|e| BusError::Connection(format!("failed to connect to {url}: {e}")))?;

        let pubsub = tokio::time::timeout(connect_timeout, client.get_async_pubsub())
            .await
            .map_err(|_| {
                BusError::Connection(format!("timed out after {connect_timeout:?} opening pub/sub on {url}"))
            })?
            .map_err(|e| BusError::Connection(format!("failed to open pub/sub on {url}: {e}")))?;
        let (sink, stream) = pubsub.split();

        let routes = Arc::new(Routes::default());
        let stop = CancellationToken::new();
        tokio::spawn(route_messages(stream, routes.clone(), stop.clone()));

        info!("Connected to Redis bus");

        Ok(Self {
            client,
            conn,
            sink: Arc::new(Mutex::new(sink)),
            routes,
            buffer_size: buffer_size.max(1),
            _router: Arc::new(stop.drop_guard()),
        })
    }

    async fn publish_envelope(
        &self,
        topic: &str,
        reply_to: Option<&str>,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let envelope = Envelope::encode(reply_to, payload)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, i64>(topic, envelope)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn append_to_stream(
        &self,
        topic: &str,
        reply_to: &str,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("XADD")
            .arg(topic)
            .arg("NOMKSTREAM")
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg(FIELD_REPLY)
            .arg(reply_to)
            .arg(FIELD_DATA)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        if id.is_none() {
            debug!(topic, "No consumer group on topic, stream append skipped");
        }
        Ok(())
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(topic, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.publish_envelope(topic, Some(reply_to), &payload).await?;
        self.append_to_stream(topic, reply_to, &payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError> {
        let (sender, receiver) = mpsc::channel(self.buffer_size);

        let mut sink = self.sink.lock().await;
        let (id, first) = self.routes.add(topic, sender)?;
        if first {
            if let Err(e) = sink.subscribe(topic).await {
                self.routes.remove(topic, id);
                return Err(BusError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        drop(sink);
        debug!(topic, id, "Registered pub/sub route");

        let release = release_route(self.sink.clone(), self.routes.clone(), topic.to_string(), id);
        Ok(Subscription::new(topic, receiver, cancel, Some(release)))
    }

    async fn group_subscribe(
        &self,
        topic: &str,
        group: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription, BusError> {
        self.ensure_group(topic, group).await?;

        // Blocking reads get their own connection so publishes and replies
        // never queue behind them.
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let consumer = format!("consumer-{}", uuid::Uuid::new_v4());
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let stop = cancel.child_token();
        let reader = GroupReader {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer,
            sender,
            stop: stop.clone(),
        };

        tokio::spawn(reader.run());

        Ok(Subscription::new(
            topic,
            receiver,
            cancel,
            Some(Box::new(move || stop.cancel())),
        ))
    }

    async fn reply(&self, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.publish_envelope(reply_to, None, &payload).await
    }
}

struct Route {
    id: u64,
    sender: mpsc::Sender<Feed>,
}

/// Exclusive subscriptions by channel.
#[derive(Default)]
struct Routes {
    channels: DashMap<String, Vec<Route>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Routes {
    /// Register `sender` on `channel`. Returns the route id and whether it is
    /// the first route on the channel.
    fn add(&self, channel: &str, sender: mpsc::Sender<Feed>) -> Result<(u64, bool), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection("pub/sub connection closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.channels.entry(channel.to_string()).or_default();
        let first = routes.is_empty();
        routes.push(Route { id, sender });
        Ok((id, first))
    }

    /// Drop a route. Returns true when the channel has no routes left.
    fn remove(&self, channel: &str, id: u64) -> bool {
        if let Some(mut routes) = self.channels.get_mut(channel) {
            routes.retain(|r| r.id != id);
        }
        self.channels.remove_if(channel, |_, routes| routes.is_empty());
        !self.channels.contains_key(channel)
    }

    /// Forward a raw pub/sub payload to every route on `channel`. Undecodable
    /// envelopes are forwarded as errors.
    async fn dispatch(&self, channel: &str, raw: &[u8]) {
        let senders: Vec<_> = match self.channels.get(channel) {
            Some(routes) => routes.iter().map(|r| r.sender.clone()).collect(),
            None => return,
        };

        let feed = Envelope::decode(raw);
        if let Err(e) = &feed {
            warn!(channel, "Undecodable envelope: {}", e);
        }
        for sender in senders {
            let _ = sender.send(feed.clone()).await;
        }
    }

    /// Fail every route and refuse new ones.
    async fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);

        let mut senders = Vec::new();
        for entry in self.channels.iter() {
            for route in entry.value() {
                senders.push((entry.key().clone(), route.sender.clone()));
            }
        }
        self.channels.clear();

        for (channel, sender) in senders {
            let _ = sender
                .send(Err(BusError::Receive(channel, reason.to_string())))
                .await;
        }
    }
}

fn release_route(sink: Arc<Mutex<PubSubSink>>, routes: Arc<Routes>, channel: String, id: u64) -> ReleaseHook {
    Box::new(move || {
        if !routes.remove(&channel, id) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let mut sink = sink.lock().await;
            // A new route may have claimed the channel meanwhile
            if routes.channels.contains_key(&channel) {
                return;
            }
            if let Err(e) = sink.unsubscribe(&channel).await {
                debug!(channel = %channel, "Unsubscribe failed: {}", e);
            }
        });
    })
}

async fn route_messages(mut stream: PubSubStream, routes: Arc<Routes>, stop: CancellationToken) {
    loop {
        let msg = tokio::select! {
            _ = stop.cancelled() => break,
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            warn!("Redis pub/sub connection closed");
            routes.close("connection closed").await;
            return;
        };
        routes.dispatch(msg.get_channel_name(), msg.get_payload_bytes()).await;
    }
    debug!("Pub/sub router stopped");
}

struct GroupReader {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    sender: mpsc::Sender<Feed>,
    stop: CancellationToken,
}

impl GroupReader {
    async fn run(mut self) {
        info!(topic = %self.topic, group = %self.group, consumer = %self.consumer, "Group reader started");

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(GROUP_READ_COUNT)
            .block(GROUP_BLOCK.as_millis() as usize);
        let keys = [self.topic.clone()];
        let ids = [">"];

        loop {
            let read = tokio::select! {
                _ = self.stop.cancelled() => break,
                read = self.conn.xread_options::<_, _, Option<StreamReadReply>>(&keys, &ids, &options) => read,
            };

            let reply = match read {
                Ok(Some(reply)) => reply,
                Ok(None) => continue,
                Err(e) => {
                    error!(topic = %self.topic, group = %self.group, "Group read failed: {}", e);
                    let _ = self
                        .sender
                        .send(Err(BusError::Receive(self.topic.clone(), e.to_string())))
                        .await;
                    break;
                }
            };

            for entry in reply.keys.into_iter().flat_map(|key| key.ids) {
                let ack: redis::RedisResult<i64> =
                    self.conn.xack(&self.topic, &self.group, &[&entry.id]).await;
                if let Err(e) = ack {
                    warn!(topic = %self.topic, id = %entry.id, "Failed to acknowledge entry: {}", e);
                }

                let payload: Option<Vec<u8>> = entry.get(FIELD_DATA);
                let Some(payload) = payload else {
                    warn!(topic = %self.topic, id = %entry.id, "Stream entry without data field, skipped");
                    continue;
                };
                let reply_to: Option<String> = entry.get(FIELD_REPLY);

                if self.sender.send(Ok(Message { payload, reply_to })).await.is_err() {
                    self.stop.cancel();
                    break;
                }
            }

            if self.sender.is_closed() {
                break;
            }
        }

        info!(topic = %self.topic, group = %self.group, consumer = %self.consumer, "Group reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Delivery;

    const REDIS_ENV: &str = "SCREENSHOT_TEST_REDIS";

    #[test]
    fn test_envelope_carries_reply_address() {
        let raw = Envelope::encode(Some("reply-7"), b"{\"url\":\"https://a.example\"}").unwrap();
        let message = Envelope::decode(&raw).unwrap();
        assert_eq!(message.reply_to.as_deref(), Some("reply-7"));
        assert_eq!(message.payload, b"{\"url\":\"https://a.example\"}");

        let raw = Envelope::encode(None, b"").unwrap();
        let message = Envelope::decode(&raw).unwrap();
        assert!(message.reply_to.is_none());
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"data":"***"}"#).is_err());
    }

    fn envelope(payload: &[u8]) -> Vec<u8> {
        Envelope::encode(None, payload).unwrap()
    }

    #[tokio::test]
    async fn test_routes_fan_out_per_channel() {
        let routes = Routes::default();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);

        assert!(routes.add("reply-1", tx_a).unwrap().1);
        assert!(!routes.add("reply-1", tx_b).unwrap().1);
        assert!(routes.add("reply-2", tx_c).unwrap().1);

        routes.dispatch("reply-1", &envelope(b"one")).await;
        routes.dispatch("unrouted", &envelope(b"lost")).await;

        assert_eq!(rx_a.recv().await.unwrap().unwrap().payload, b"one");
        assert_eq!(rx_b.recv().await.unwrap().unwrap().payload, b"one");
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_routes_forward_undecodable_envelope_as_error() {
        let routes = Routes::default();
        let (tx, mut rx) = mpsc::channel(4);
        routes.add("reply-1", tx).unwrap();

        routes.dispatch("reply-1", b"not an envelope").await;

        assert!(matches!(rx.recv().await, Some(Err(BusError::Encoding(_)))));
    }

    #[test]
    fn test_routes_report_last_removal() {
        let routes = Routes::default();
        let (tx, _rx) = mpsc::channel(1);
        let (first, _) = routes.add("reply-1", tx.clone()).unwrap();
        let (second, _) = routes.add("reply-1", tx).unwrap();

        assert!(!routes.remove("reply-1", first));
        assert!(routes.remove("reply-1", second));
        assert!(routes.channels.is_empty());
    }

    #[tokio::test]
    async fn test_closed_routes_fail_subscribers() {
        let routes = Routes::default();
        let (tx, mut rx) = mpsc::channel(1);
        routes.add("reply-1", tx).unwrap();

        routes.close("connection closed").await;

        assert!(matches!(rx.recv().await, Some(Err(BusError::Receive(..)))));
        let (tx, _rx) = mpsc::channel(1);
        assert!(routes.add("reply-2", tx).is_err());
    }

    #[tokio::test]
    async fn test_redis_many_reply_subscriptions_share_one_connection() {
        let Ok(url) = std::env::var(REDIS_ENV) else {
            eprintln!("{REDIS_ENV} not set, skipping Redis bus test");
            return;
        };
        let bus = RedisBus::connect(&url, 8, Duration::from_secs(2)).await.unwrap();
        let mut conn = bus.conn.clone();
        let clients_before: String = redis::cmd("CLIENT").arg("LIST").query_async(&mut conn).await.unwrap();

        let mut subscriptions = Vec::new();
        for _ in 0..50 {
            let reply_to = uuid::Uuid::new_v4().to_string();
            let sub = bus.subscribe(&reply_to, CancellationToken::new()).await.unwrap();
            subscriptions.push((reply_to, sub));
        }

        let clients_after: String = redis::cmd("CLIENT").arg("LIST").query_async(&mut conn).await.unwrap();
        // Other tests may connect concurrently, but nowhere near one client per subscription
        assert!(clients_after.lines().count() < clients_before.lines().count() + 10);

        for (reply_to, _) in &subscriptions {
            bus.reply(reply_to, reply_to.as_bytes().to_vec()).await.unwrap();
        }
        for (reply_to, sub) in &mut subscriptions {
            match tokio::time::timeout(Duration::from_secs(2), sub.next()).await {
                Ok(Delivery::Message(m)) => assert_eq!(m.payload, reply_to.as_bytes()),
                other => panic!("unexpected delivery: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_redis_request_reply() {
        let Ok(url) = std::env::var(REDIS_ENV) else {
            eprintln!("{REDIS_ENV} not set, skipping Redis bus test");
            return;
        };
        let bus = RedisBus::connect(&url, 8, Duration::from_secs(2)).await.unwrap();
        let topic = format!("test-topic-{}", uuid::Uuid::new_v4());
        let group = format!("test-group-{}", uuid::Uuid::new_v4());
        let reply_to = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let mut jobs = bus.group_subscribe(&topic, &group, cancel.clone()).await.unwrap();
        let mut replies = bus.subscribe(&reply_to, cancel.clone()).await.unwrap();

        bus.publish(&topic, &reply_to, b"job".to_vec()).await.unwrap();
        let job = match jobs.next().await {
            Delivery::Message(m) => m,
            other => panic!("unexpected delivery: {other:?}"),
        };
        assert_eq!(job.payload, b"job");
        assert_eq!(job.reply_to.as_deref(), Some(reply_to.as_str()));

        bus.reply(&reply_to, b"done".to_vec()).await.unwrap();
        match replies.next().await {
            Delivery::Message(m) => assert_eq!(m.payload, b"done"),
            other => panic!("unexpected delivery: {other:?}"),
        }

        cancel.cancel();
        assert!(matches!(jobs.next().await, Delivery::Closed));
    }
}
