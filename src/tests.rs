//! End-to-end scenarios over the in-process bus and stores.

use crate::capture::tests::tiny_png;
use crate::metadata::{MetadataStore, VersionRequest};
use crate::{
    CaptureError, CaptureService, Dispatcher, FailureKind, ImageFormat, MemoryBlobStore,
    MemoryBus, MemoryMetadataStore, Renderer, ScreenshotQuery, WorkerPool,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Renders a tiny PNG, stalls on URLs containing "slow" and fails on URLs
/// containing "broken".
#[derive(Default)]
struct ScriptedRenderer {
    calls: AtomicUsize,
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render(&self, url: &str, _: ImageFormat, _: u8) -> Result<Vec<u8>, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("slow") {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        if url.contains("broken") {
            return Err(CaptureError::PageError("net::ERR_CONNECTION_REFUSED".into()));
        }
        Ok(tiny_png())
    }
}

struct Harness {
    dispatcher: Dispatcher,
    query: ScreenshotQuery,
    metadata: Arc<MemoryMetadataStore>,
    renderer: Arc<ScriptedRenderer>,
    pools: Vec<WorkerPool>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Harness {
    async fn start(pools: usize, wait_reply_timeout: Duration) -> Self {
        let bus = Arc::new(MemoryBus::new(64));
        let metadata = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let renderer = Arc::new(ScriptedRenderer::default());
        let cancel = CancellationToken::new();

        let capture = CaptureService::new(
            renderer.clone(),
            blobs.clone(),
            metadata.clone(),
            ImageFormat::Png,
            90,
        );

        let mut workers = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..pools {
            let pool = WorkerPool::new(bus.clone(), capture.clone(), Duration::from_secs(10));
            tasks.push(pool.start(cancel.clone()).await.unwrap());
            workers.push(pool);
        }

        Self {
            dispatcher: Dispatcher::new(bus, wait_reply_timeout),
            query: ScreenshotQuery::new(metadata.clone(), blobs),
            metadata,
            renderer,
            pools: workers,
            tasks,
            cancel,
        }
    }

    async fn submit(&self, urls: &[&str]) -> Vec<crate::JobOutcome> {
        let urls = urls.iter().map(|u| u.to_string()).collect();
        self.dispatcher.submit(urls, &self.cancel).await
    }

    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_repeat_capture_creates_new_version() {
    let harness = Harness::start(1, Duration::from_secs(5)).await;

    let first = harness.submit(&["https://a.example"]).await;
    assert!(first[0].success, "{:?}", first[0]);
    assert_eq!(first[0].version, Some(1));

    let second = harness.submit(&["https://a.example", "https://b.example"]).await;
    assert_eq!(second[0].url, "https://a.example");
    assert_eq!(second[0].version, Some(2));
    assert_eq!(second[1].url, "https://b.example");
    assert_eq!(second[1].version, Some(1));

    let versions: Vec<u32> = harness
        .query
        .get_versions("https://a.example")
        .await
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(versions, vec![2, 1]);

    harness.stop().await;
}

#[tokio::test]
async fn test_latest_serves_newest_bytes() {
    let harness = Harness::start(1, Duration::from_secs(5)).await;
    harness.submit(&["https://a.example"]).await;
    harness.submit(&["https://a.example"]).await;

    let (record, mut reader) = harness
        .query
        .get_screenshot("https://a.example", VersionRequest::Latest)
        .await
        .unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.content_type(), "image/png");

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, tiny_png());

    let (first, _) = harness
        .query
        .get_screenshot("https://a.example", VersionRequest::Specific(1))
        .await
        .unwrap();
    assert_ne!(first.blob_id, record.blob_id);

    harness.stop().await;
}

#[tokio::test]
async fn test_slow_url_times_out_alone() {
    let harness = Harness::start(1, Duration::from_millis(500)).await;

    let outcomes = harness
        .submit(&["https://a.example", "https://slow.example", "https://c.example"])
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].success);
    assert_eq!(outcomes[1].failure, Some(FailureKind::Timeout));
    assert!(outcomes[2].success);

    harness.stop().await;
}

#[tokio::test]
async fn test_worker_failure_is_reported_per_url() {
    let harness = Harness::start(1, Duration::from_secs(5)).await;

    let outcomes = harness
        .submit(&["https://broken.example", "not a url", "https://a.example"])
        .await;

    assert_eq!(outcomes[0].failure, Some(FailureKind::Rejected));
    assert!(outcomes[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("ERR_CONNECTION_REFUSED"));
    assert_eq!(outcomes[1].failure, Some(FailureKind::InvalidUrl));
    assert!(outcomes[2].success);
    assert!(harness
        .metadata
        .get_all_versions("https://broken.example")
        .await
        .unwrap()
        .is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_competing_pools_handle_each_job_once() {
    let harness = Harness::start(2, Duration::from_secs(5)).await;

    let urls: Vec<String> = (0..10).map(|n| format!("https://site{n}.example")).collect();
    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let outcomes = harness.submit(&refs).await;

    assert!(outcomes.iter().all(|o| o.success && o.version == Some(1)));
    assert_eq!(harness.renderer.calls.load(Ordering::SeqCst), 10);

    let received: u64 = harness.pools.iter().map(|p| p.stats().received).sum();
    assert_eq!(received, 10);
    assert!(harness.pools.iter().all(|p| p.stats().received > 0));

    harness.stop().await;
}

#[tokio::test]
async fn test_concurrent_captures_get_distinct_versions() {
    let harness = Harness::start(2, Duration::from_secs(5)).await;

    let urls = vec!["https://a.example"; 20];
    let outcomes = harness.submit(&urls).await;

    let mut versions: Vec<u32> = outcomes.iter().filter_map(|o| o.version).collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=20).collect::<Vec<_>>());

    harness.stop().await;
}

#[tokio::test]
async fn test_cancelled_batch_resolves_every_url() {
    let harness = Harness::start(1, Duration::from_secs(10)).await;

    let cancel = harness.cancel.child_token();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let outcomes = harness
        .dispatcher
        .submit(
            vec!["https://slow.example".to_string(), "https://slow2.example".to_string()],
            &cancel,
        )
        .await;
    assert!(outcomes
        .iter()
        .all(|o| o.failure == Some(FailureKind::Cancelled)));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_larger_than_bus_buffer_is_fully_handled() {
    let harness = Harness::start(1, Duration::from_secs(10)).await;

    let urls: Vec<String> = (0..200).map(|n| format!("https://many{n}.example")).collect();
    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let outcomes = harness.submit(&refs).await;

    let failed: Vec<_> = outcomes.iter().filter(|o| !o.success).collect();
    assert!(failed.is_empty(), "{} failed, first: {:?}", failed.len(), failed.first());
    assert_eq!(harness.renderer.calls.load(Ordering::SeqCst), 200);
    assert_eq!(harness.pools[0].stats().received, 200);

    harness.stop().await;
}
