//! Request side of the capture protocol
//!
//! [`Dispatcher::submit`] publishes one [`Job`] per URL, each with its own
//! one-off reply address, and waits for exactly one reply or a timeout per
//! URL. Every URL resolves independently: a slow or failing URL never holds
//! back or fails the others, and the batch returns once all of them resolved.
//! Outcomes come back in input order.

use crate::bus::{Delivery, MessageBus};
use crate::metrics;
use crate::protocol::{CaptureReply, Job, JOB_TOPIC};
use crate::utils::validate_url;
use crate::BusError;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a URL did not produce a screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Not an http(s) URL, nothing was published
    InvalidUrl,
    Publish,
    Subscribe,
    /// No reply within the reply deadline
    Timeout,
    /// The reply subscription closed before any reply arrived
    Disconnected,
    /// A reply arrived but could not be decoded
    Decode,
    /// The worker replied with a failure
    Rejected,
    Cancelled,
    /// The per-URL task panicked
    Aborted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidUrl => "invalid_url",
            FailureKind::Publish => "publish",
            FailureKind::Subscribe => "subscribe",
            FailureKind::Timeout => "timeout",
            FailureKind::Disconnected => "disconnected",
            FailureKind::Decode => "decode",
            FailureKind::Rejected => "rejected",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of dispatching one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub url: String,
    pub success: bool,
    /// Version assigned to the new screenshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl JobOutcome {
    pub fn succeeded(url: impl Into<String>, version: Option<u32>) -> Self {
        Self {
            url: url.into(),
            success: true,
            version,
            error: None,
            failure: None,
        }
    }

    pub fn failed(url: impl Into<String>, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success: false,
            version: None,
            error: Some(error.into()),
            failure: Some(kind),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    wait_reply_timeout: Duration,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, wait_reply_timeout: Duration) -> Self {
        Self {
            bus,
            wait_reply_timeout,
        }
    }

    /// Dispatch every URL and collect one outcome per URL, in input order.
    ///
    /// Cancelling `cancel` (or dropping the returned future) resolves all
    /// pending URLs as cancelled.
    pub async fn submit(&self, urls: Vec<String>, cancel: &CancellationToken) -> Vec<JobOutcome> {
        let started = Instant::now();
        let batch = cancel.child_token();
        let _guard = batch.clone().drop_guard();

        let tasks: Vec<_> = urls
            .iter()
            .cloned()
            .map(|url| {
                tokio::spawn(dispatch_one(
                    self.bus.clone(),
                    url,
                    self.wait_reply_timeout,
                    batch.child_token(),
                ))
            })
            .collect();

        let outcomes: Vec<JobOutcome> = join_all(tasks)
            .await
            .into_iter()
            .zip(urls)
            .map(|(joined, url)| {
                joined.unwrap_or_else(|e| {
                    error!(url = %url, "Dispatch task aborted: {}", e);
                    metrics::record_dispatch_failure(FailureKind::Aborted.as_str());
                    JobOutcome::failed(url, FailureKind::Aborted, e.to_string())
                })
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!(
            "Dispatched {} URLs in {:?}: {} succeeded, {} failed",
            outcomes.len(),
            started.elapsed(),
            succeeded,
            outcomes.len() - succeeded
        );
        outcomes
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("wait_reply_timeout", &self.wait_reply_timeout)
            .finish()
    }
}

async fn dispatch_one(
    bus: Arc<dyn MessageBus>,
    url: String,
    wait: Duration,
    cancel: CancellationToken,
) -> JobOutcome {
    let outcome = exchange(bus.as_ref(), &url, wait, &cancel).await;
    if let Some(kind) = outcome.failure {
        metrics::record_dispatch_failure(kind.as_str());
        warn!(url = %url, failure = %kind, "Screenshot request failed: {}", outcome.error.as_deref().unwrap_or(""));
    }
    outcome
}

async fn exchange(
    bus: &dyn MessageBus,
    url: &str,
    wait: Duration,
    cancel: &CancellationToken,
) -> JobOutcome {
    if let Err(reason) = validate_url(url) {
        return JobOutcome::failed(url, FailureKind::InvalidUrl, reason);
    }

    let reply_to = uuid::Uuid::new_v4().to_string();

    // Subscribed before publishing so that a fast reply cannot be missed.
    let mut replies = match bus.subscribe(&reply_to, cancel.clone()).await {
        Ok(subscription) => subscription,
        Err(e) => return JobOutcome::failed(url, FailureKind::Subscribe, e.to_string()),
    };

    let payload = match Job::new(url).encode() {
        Ok(payload) => payload,
        Err(e) => return JobOutcome::failed(url, FailureKind::Publish, e.to_string()),
    };
    // Publishing waits while every capture worker's buffer is full
    let published = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return JobOutcome::failed(url, FailureKind::Cancelled, "request cancelled");
        }
        published = bus.publish(JOB_TOPIC, &reply_to, payload) => published,
    };
    if let Err(e) = published {
        drop(replies);
        return JobOutcome::failed(url, FailureKind::Publish, e.to_string());
    }
    metrics::record_job_published();
    debug!(url, reply_to = %reply_to, "Published screenshot job");

    let started = Instant::now();
    let delivery = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return JobOutcome::failed(url, FailureKind::Cancelled, "request cancelled");
        }
        delivery = tokio::time::timeout(wait, replies.next()) => delivery,
    };

    match delivery {
        Err(_) => JobOutcome::failed(
            url,
            FailureKind::Timeout,
            format!("no reply within {wait:?}"),
        ),
        Ok(Delivery::Closed) => {
            JobOutcome::failed(url, FailureKind::Disconnected, "no reply received")
        }
        Ok(Delivery::Failed(BusError::Encoding(e))) => JobOutcome::failed(
            url,
            FailureKind::Decode,
            format!("undecodable reply: {e}"),
        ),
        Ok(Delivery::Failed(e)) => JobOutcome::failed(
            url,
            FailureKind::Disconnected,
            format!("no reply received: {e}"),
        ),
        Ok(Delivery::Message(message)) => {
            metrics::record_reply_received(started.elapsed());
            match CaptureReply::decode(&message.payload) {
                Err(e) => JobOutcome::failed(url, FailureKind::Decode, e.to_string()),
                Ok(reply) if reply.success => {
                    let version = reply.record.map(|r| r.version);
                    debug!(url, ?version, "Screenshot captured");
                    JobOutcome::succeeded(url, version)
                }
                Ok(reply) => JobOutcome::failed(
                    url,
                    FailureKind::Rejected,
                    reply.error.unwrap_or_else(|| "capture failed".to_string()),
                ),
            }
        }
    }
}
