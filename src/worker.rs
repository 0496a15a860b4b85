use crate::bus::{Delivery, Message, MessageBus};
use crate::metrics;
use crate::protocol::{CaptureReply, Job, CAPTURE_GROUP, JOB_TOPIC};
use crate::{BusError, CaptureService};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    reply_failures: AtomicU64,
}

/// Snapshot of a pool's job counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub reply_failures: u64,
}

/// Capture workers competing for jobs on the shared bus.
///
/// Every pool joins the same consumer group, so a job published once is
/// handled by exactly one pool across all capture processes. Each job gets
/// its own task and exactly one reply attempt.
#[derive(Clone)]
pub struct WorkerPool {
    bus: Arc<dyn MessageBus>,
    capture: CaptureService,
    handle_timeout: Duration,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(bus: Arc<dyn MessageBus>, capture: CaptureService, handle_timeout: Duration) -> Self {
        Self {
            bus,
            capture,
            handle_timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Join the capture group and drain jobs until `cancel` fires or the
    /// subscription closes.
    ///
    /// Subscription errors are returned here. The returned task finishes after
    /// in-flight jobs have sent their replies.
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, BusError> {
        let mut jobs = self
            .bus
            .group_subscribe(JOB_TOPIC, CAPTURE_GROUP, cancel.clone())
            .await?;
        info!("Capture worker pool joined group {} on {}", CAPTURE_GROUP, JOB_TOPIC);

        let pool = self.clone();
        Ok(tokio::spawn(async move {
            let mut in_flight = JoinSet::new();

            loop {
                tokio::select! {
                    delivery = jobs.next() => match delivery {
                        Delivery::Message(message) => {
                            pool.counters.received.fetch_add(1, Ordering::Relaxed);
                            let worker = pool.clone();
                            let job_cancel = cancel.child_token();
                            in_flight.spawn(async move { worker.handle(message, job_cancel).await });
                        }
                        Delivery::Closed => break,
                        Delivery::Failed(e) => {
                            error!("Job subscription failed: {}", e);
                            break;
                        }
                    },
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            error!("Job task aborted: {}", e);
                        }
                    }
                }
            }

            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!("Job task aborted: {}", e);
                }
            }

            info!("Capture worker pool stopped: {:?}", pool.stats());
        }))
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            reply_failures: self.counters.reply_failures.load(Ordering::Relaxed),
        }
    }

    async fn handle(&self, message: Message, cancel: CancellationToken) {
        let Some(reply_to) = message.reply_to else {
            warn!("Dropping job without reply address");
            return;
        };

        let started = Instant::now();
        let reply = match Job::decode(&message.payload) {
            Ok(job) => self.run(&job.url, &cancel).await,
            Err(e) => {
                warn!(reply_to = %reply_to, "Undecodable job payload: {}", e);
                CaptureReply::failure(format!("invalid job payload: {e}"))
            }
        };

        if reply.success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_job_handled(reply.success);

        let sent = match reply.encode() {
            Ok(payload) => self.bus.reply(&reply_to, payload).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => debug!(reply_to = %reply_to, success = reply.success, "Replied in {:?}", started.elapsed()),
            Err(e) => {
                self.counters.reply_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_reply_failure();
                error!(reply_to = %reply_to, "Failed to send reply: {}", e);
            }
        }
    }

    async fn run(&self, url: &str, cancel: &CancellationToken) -> CaptureReply {
        debug!(url, "Handling screenshot job");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return CaptureReply::failure("capture worker shutting down");
            }
            result = tokio::time::timeout(self.handle_timeout, self.capture.capture_and_save(url)) => result,
        };

        match result {
            Ok(Ok(record)) => CaptureReply::success(record),
            Ok(Err(e)) => {
                warn!(url, "Capture failed: {}", e);
                CaptureReply::failure(e.to_string())
            }
            Err(_) => {
                warn!(url, "Capture exceeded {:?}", self.handle_timeout);
                CaptureReply::failure(format!("capture timed out after {:?}", self.handle_timeout))
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("handle_timeout", &self.handle_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}
