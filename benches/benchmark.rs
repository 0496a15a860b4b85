use criterion::{black_box, criterion_group, criterion_main, Criterion};
use screenshot_archive::{
    CaptureReply, Delivery, ImageFormat, Job, MemoryBus, MemoryMetadataStore, MessageBus,
    Metadata, MetadataStore, CAPTURE_GROUP, JOB_TOPIC,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "integration_benchmarks")]
use screenshot_archive::{BrowserPool, BrowserSettings, ChromeRenderer, Renderer};

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

// === UNIT BENCHMARKS ===

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/path?q=1",
        "invalid-url",
        "ftp://example.com",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = screenshot_archive::validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    group.bench_function("parse_list", |b| {
        let input = "https://a.example; https://b.example\nhttps://c.example;;";
        b.iter(|| black_box(screenshot_archive::parse_url_list(input)));
    });

    group.finish();
}

fn benchmark_payload_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_codec");
    configure_fast_group(&mut group);

    let job = Job::new("https://example.com");
    let mut record = Metadata::new("https://example.com", ImageFormat::Png, 90, "blob");
    record.version = 7;
    let reply = CaptureReply::success(record);
    let encoded = reply.encode().unwrap();

    group.bench_function("job_encode", |b| {
        b.iter(|| black_box(job.encode().unwrap()));
    });

    group.bench_function("reply_decode", |b| {
        b.iter(|| black_box(CaptureReply::decode(&encoded).unwrap()));
    });

    group.finish();
}

fn benchmark_version_assignment(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("version_assignment");
    configure_fast_group(&mut group);

    let store = Arc::new(MemoryMetadataStore::new());

    group.bench_function("memory_save", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                let mut record = Metadata::new("https://example.com", ImageFormat::Png, 90, "blob");
                store.save(&mut record).await.unwrap();
                black_box(record.version);
            }
        });
    });

    group.bench_function("memory_save_contended_8", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                let saves = (0..8).map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        let mut record =
                            Metadata::new("https://contended.example", ImageFormat::Png, 90, "blob");
                        store.save(&mut record).await.unwrap();
                        record.version
                    })
                });
                black_box(futures::future::join_all(saves).await);
            }
        });
    });

    group.finish();
}

fn benchmark_bus_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bus_round_trip");
    configure_fast_group(&mut group);

    let bus = Arc::new(MemoryBus::new(256));
    let cancel = CancellationToken::new();

    // Echo worker answering every job with a failure reply
    rt.block_on(async {
        let mut jobs = bus
            .group_subscribe(JOB_TOPIC, CAPTURE_GROUP, cancel.clone())
            .await
            .unwrap();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Delivery::Message(message) = jobs.next().await {
                if let Some(reply_to) = message.reply_to {
                    let reply = CaptureReply::failure("echo").encode().unwrap();
                    let _ = bus.reply(&reply_to, reply).await;
                }
            }
        });
    });

    group.bench_function("memory_request_reply", |b| {
        b.to_async(&rt).iter(|| {
            let bus = bus.clone();
            let cancel = cancel.clone();
            async move {
                let reply_to = uuid::Uuid::new_v4().to_string();
                let mut replies = bus.subscribe(&reply_to, cancel).await.unwrap();
                let payload = Job::new("https://example.com").encode().unwrap();
                bus.publish(JOB_TOPIC, &reply_to, payload).await.unwrap();
                black_box(replies.next().await);
            }
        });
    });

    group.finish();
    cancel.cancel();
}

// === INTEGRATION BENCHMARKS (require Chrome) ===

#[cfg(feature = "integration_benchmarks")]
fn benchmark_chrome_render(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("chrome_render");
    configure_fast_group(&mut group);

    let settings = BrowserSettings {
        pool_size: 1,
        ..Default::default()
    };
    let pool = BrowserPool::new(settings.clone());
    let renderer = ChromeRenderer::new(pool.clone(), settings.viewport, settings.navigation_timeout);

    group.bench_function("example_com_png", |b| {
        b.to_async(&rt).iter(|| async {
            let result = renderer
                .render("https://example.com", ImageFormat::Png, 90)
                .await;
            black_box(result.is_ok());
        });
    });

    group.finish();
    rt.block_on(pool.shutdown());
}

// === BENCHMARK GROUPS ===

criterion_group!(
    unit_benches,
    benchmark_url_validation,
    benchmark_payload_codec,
    benchmark_version_assignment,
    benchmark_bus_round_trip,
);

#[cfg(feature = "integration_benchmarks")]
criterion_group!(integration_benches, benchmark_chrome_render);

#[cfg(feature = "integration_benchmarks")]
criterion_main!(unit_benches, integration_benches);

#[cfg(not(feature = "integration_benchmarks"))]
criterion_main!(unit_benches);
