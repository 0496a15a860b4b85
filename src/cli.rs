use crate::metadata::{MetadataStore, VersionRequest};
use crate::utils::{format_duration, parse_url_list};
use crate::{
    api, metrics, ApiClient, AppState, BrowserPool, CaptureService, ChromeRenderer, Config,
    Dispatcher, FsBlobStore, MemoryBus, MemoryMetadataStore, MessageBus, RedisBus,
    RedisMetadataStore, ScreenshotQuery, WorkerPool,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "screenshot-archive")]
#[command(about = "Website screenshots on demand, with full version history")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Redis url of the message bus")]
    pub queue_url: Option<String>,

    #[arg(long, global = true, help = "Redis url of the metadata store")]
    pub database_url: Option<String>,

    #[arg(long, global = true, help = "Directory holding screenshot bytes")]
    pub blob_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Seconds to wait for a worker reply per URL")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServeMode {
    /// HTTP API and capture workers in one process
    Standalone,
    /// HTTP API only, jobs go to capture processes over the shared bus
    Api,
    /// Capture workers only
    Capture,
}

impl ServeMode {
    fn runs_api(self) -> bool {
        matches!(self, ServeMode::Standalone | ServeMode::Api)
    }

    fn runs_workers(self) -> bool {
        matches!(self, ServeMode::Standalone | ServeMode::Capture)
    }
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServeMode::Standalone => "standalone",
            ServeMode::Api => "api",
            ServeMode::Capture => "capture",
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the service
    Serve {
        #[arg(short, long, value_enum, default_value = "standalone")]
        mode: ServeMode,

        #[arg(long, help = "HTTP listen address")]
        address: Option<String>,

        #[arg(long, help = "Serve Prometheus metrics on this port")]
        metrics_port: Option<u16>,
    },

    /// Request screenshots through a running API
    Request {
        #[arg(short, long, env = "SCREENSHOT_BACKEND", default_value = "localhost:9000")]
        backend: String,

        #[arg(short, long, help = "URLs separated by ;")]
        urls: Option<String>,

        #[arg(short, long, help = "File with URLs, separated by ; or newlines")]
        file: Option<PathBuf>,
    },

    /// List stored versions of a URL
    Versions {
        #[arg(short, long, env = "SCREENSHOT_BACKEND", default_value = "localhost:9000")]
        backend: String,

        #[arg(short, long)]
        url: String,
    },

    /// Download a stored screenshot
    Fetch {
        #[arg(short, long, env = "SCREENSHOT_BACKEND", default_value = "localhost:9000")]
        backend: String,

        #[arg(short, long)]
        url: String,

        #[arg(long, help = "Version to fetch, latest when omitted")]
        version: Option<u32>,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        #[arg(value_name = "FILE", help = "Configuration file to validate")]
        file: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands, cancel: CancellationToken) -> Result<()> {
        match command {
            Commands::Serve {
                mode,
                address,
                metrics_port,
            } => {
                let mut config = self.config.clone();
                if let Some(address) = address {
                    config.api.address = address;
                }
                if metrics_port.is_some() {
                    config.api.metrics_port = metrics_port;
                }
                serve(config, mode, cancel).await
            }
            Commands::Request {
                backend,
                urls,
                file,
            } => {
                let urls = collect_urls(urls, file).await?;
                self.request(&backend, urls).await
            }
            Commands::Versions { backend, url } => self.versions(&backend, &url).await,
            Commands::Fetch {
                backend,
                url,
                version,
                output,
            } => {
                let version = match version {
                    Some(0) => bail!("version must be >= 1"),
                    Some(v) => VersionRequest::Specific(v),
                    None => VersionRequest::Latest,
                };
                self.fetch(&backend, &url, version, output).await
            }
            Commands::Validate { file } => validate(file).await,
        }
    }

    fn client(&self, backend: &str) -> Result<ApiClient> {
        // A batch can take up to the reply deadline.
        let timeout = self.config.queue.wait_reply_timeout + Duration::from_secs(30);
        ApiClient::new(backend, timeout)
    }

    async fn request(&self, backend: &str, urls: Vec<String>) -> Result<()> {
        let client = self.client(backend)?;
        let started = Instant::now();
        let outcomes = client.create_screenshots(urls).await?;

        for outcome in &outcomes {
            if outcome.success {
                let version = outcome
                    .version
                    .map(|v| format!(" (version {v})"))
                    .unwrap_or_default();
                println!(
                    "screenshot done for {}{}, fetch it at {}",
                    outcome.url,
                    version,
                    client.screenshot_link(&outcome.url)
                );
            } else {
                println!(
                    "screenshot failed for {}: {}",
                    outcome.url,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(
            "{} URLs processed in {}, {} failed",
            outcomes.len(),
            format_duration(started.elapsed()),
            failed
        );
        Ok(())
    }

    async fn versions(&self, backend: &str, url: &str) -> Result<()> {
        let versions = self.client(backend)?.versions(url).await?;
        if versions.is_empty() {
            println!("no screenshots stored for {url}");
            return Ok(());
        }

        for record in versions {
            println!(
                "v{}\t{}\t{}\tq{}\t{}",
                record.version,
                record.created_at.to_rfc3339(),
                record.format,
                record.quality,
                record.blob_id
            );
        }
        Ok(())
    }

    async fn fetch(
        &self,
        backend: &str,
        url: &str,
        version: VersionRequest,
        output: PathBuf,
    ) -> Result<()> {
        let screenshot = self.client(backend)?.fetch(url, version).await?;
        tokio::fs::write(&output, &screenshot.bytes)
            .await
            .with_context(|| format!("failed to write {}", output.display()))?;

        println!(
            "saved {} version {} ({}, {} bytes) to {}",
            url,
            screenshot
                .version
                .map(|v| v.to_string())
                .unwrap_or_else(|| version.to_string()),
            screenshot.content_type.as_deref().unwrap_or("unknown type"),
            screenshot.bytes.len(),
            output.display()
        );
        Ok(())
    }
}

async fn collect_urls(urls: Option<String>, file: Option<PathBuf>) -> Result<Vec<String>> {
    let raw = match (urls, file) {
        (_, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read urls file {}", path.display()))?,
        (Some(urls), None) => urls,
        (None, None) => bail!("please specify urls via --urls or a file with urls via --file"),
    };

    let urls = parse_url_list(&raw);
    if urls.is_empty() {
        bail!("no urls specified");
    }
    Ok(urls)
}

async fn validate(path: PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;

    println!("Configuration {} is valid", path.display());
    println!("  queue: {}", config.queue.url.as_deref().unwrap_or("in-process"));
    println!("  database: {}", config.database.url.as_deref().unwrap_or("in-memory"));
    println!("  blobs: {}", config.storage.blob_dir.display());
    println!(
        "  capture: {} q{}, browser pool {}",
        config.screenshot.format, config.screenshot.quality, config.browser.pool_size
    );
    Ok(())
}

/// Wire the components for `mode` and run until `cancel` fires.
pub async fn serve(config: Config, mode: ServeMode, cancel: CancellationToken) -> Result<()> {
    info!("Starting in {} mode", mode);

    if let Some(port) = config.api.metrics_port {
        metrics::install_prometheus(port)?;
    }

    let bus: Arc<dyn MessageBus> = match &config.queue.url {
        Some(url) => Arc::new(
            RedisBus::connect(url, config.queue.buffer_size, config.queue.connect_timeout).await?,
        ),
        None if mode == ServeMode::Standalone => {
            Arc::new(MemoryBus::new(config.queue.buffer_size))
        }
        None => bail!("{mode} mode needs a shared bus, set queue.url"),
    };

    let metadata: Arc<dyn MetadataStore> = match &config.database.url {
        Some(url) => Arc::new(
            RedisMetadataStore::connect(
                url,
                config.database.key_prefix.clone(),
                config.queue.connect_timeout,
            )
            .await?,
        ),
        None if mode == ServeMode::Standalone => {
            warn!("No database url configured, screenshot history is kept in memory only");
            Arc::new(MemoryMetadataStore::new())
        }
        None => bail!("{mode} mode needs a shared metadata store, set database.url"),
    };

    let blobs = Arc::new(FsBlobStore::open(&config.storage.blob_dir).await?);

    let mut browsers = None;
    let mut workers = None;
    if mode.runs_workers() {
        let pool = BrowserPool::new(config.browser.clone());
        pool.warm_up().await?;

        let renderer = Arc::new(ChromeRenderer::new(
            pool.clone(),
            config.browser.viewport.clone(),
            config.browser.navigation_timeout,
        ));
        let capture = CaptureService::new(
            renderer,
            blobs.clone(),
            metadata.clone(),
            config.screenshot.format,
            config.screenshot.quality,
        );
        let worker_pool = WorkerPool::new(bus.clone(), capture, config.queue.handle_message_timeout);
        workers = Some(worker_pool.start(cancel.clone()).await?);
        browsers = Some(pool);
    }

    if mode.runs_api() {
        let state = AppState {
            dispatcher: Dispatcher::new(bus.clone(), config.queue.wait_reply_timeout),
            query: ScreenshotQuery::new(metadata, blobs),
            cancel: cancel.clone(),
        };
        let served = api::serve(&config.api.address, state, cancel.clone()).await;
        cancel.cancel();
        served?;
    } else {
        cancel.cancelled().await;
    }

    if let Some(handle) = workers {
        handle.await.context("worker pool task failed")?;
    }
    if let Some(pool) = browsers {
        pool.shutdown().await;
    }

    info!("Stopped {} mode", mode);
    Ok(())
}

pub fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))?;

    Ok(())
}
