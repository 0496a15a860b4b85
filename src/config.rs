//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the screenshot archive,
//! covering the message bus, metadata and blob storage, capture settings and the
//! headless browser pool.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the screenshot archive
///
/// Loaded from a JSON file (see `--config`) and then overridden by CLI flags.
///
/// # Examples
///
/// ```rust
/// use screenshot_archive::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Point the bus at Redis
/// let mut config = Config::default();
/// config.queue.url = Some("redis://localhost:6379".to_string());
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Message bus connection and timeouts
    pub queue: QueueSettings,

    /// Versioned metadata store backend
    pub database: DatabaseSettings,

    /// Blob storage for screenshot bytes
    pub storage: StorageSettings,

    /// Image format and quality used for every capture
    pub screenshot: ScreenshotSettings,

    /// Headless Chrome pool used by capture workers
    pub browser: BrowserSettings,

    /// HTTP API settings
    pub api: ApiSettings,
}

impl Config {
    /// Check the configuration for values that would make the service unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.buffer_size == 0 {
            return Err(ConfigError("Queue buffer size must be greater than 0".into()));
        }

        if self.queue.wait_reply_timeout.is_zero() {
            return Err(ConfigError("Wait reply timeout must be greater than 0".into()));
        }

        if self.queue.handle_message_timeout.is_zero() {
            return Err(ConfigError("Handle message timeout must be greater than 0".into()));
        }

        if self.screenshot.quality > 100 {
            return Err(ConfigError(format!(
                "Screenshot quality must be within 0..=100, got {}",
                self.screenshot.quality
            )));
        }

        if self.browser.pool_size == 0 {
            return Err(ConfigError("Browser pool size must be greater than 0".into()));
        }

        if self.browser.viewport.width == 0 || self.browser.viewport.height == 0 {
            return Err(ConfigError("Viewport dimensions must be greater than 0".into()));
        }

        for url in [&self.queue.url, &self.database.url].into_iter().flatten() {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(ConfigError(format!("Unsupported backend url: {url}")));
            }
        }

        Ok(())
    }
}

/// Message bus settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Redis url of the shared bus (default: none, in-process bus)
    ///
    /// Without a url the bus only connects components running in the same
    /// process, which is enough for the standalone mode.
    pub url: Option<String>,

    /// Per-subscription delivery buffer (default: 64)
    pub buffer_size: usize,

    /// Timeout for establishing the bus connection (default: 5 seconds)
    pub connect_timeout: Duration,

    /// How long a worker may spend on one job before replying with a failure (default: 25 seconds)
    pub handle_message_timeout: Duration,

    /// How long the dispatcher waits for a worker reply per URL (default: 30 seconds)
    ///
    /// Should be larger than `handle_message_timeout` so that a worker's timeout
    /// reply still reaches the dispatcher.
    pub wait_reply_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: None,
            buffer_size: 64,
            connect_timeout: Duration::from_secs(5),
            handle_message_timeout: Duration::from_secs(25),
            wait_reply_timeout: Duration::from_secs(30),
        }
    }
}

/// Metadata store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Redis url of the metadata store (default: none, in-memory store)
    pub url: Option<String>,

    /// Prefix of every key written by the store (default: "screenshot")
    pub key_prefix: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "screenshot".to_string(),
        }
    }
}

/// Blob storage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding screenshot bytes (default: ./screenshots)
    pub blob_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("screenshots"),
        }
    }
}

/// Capture settings applied to every job
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScreenshotSettings {
    /// Output image format (default: PNG)
    pub format: ImageFormat,

    /// Compression quality 0-100, ignored by PNG (default: 90)
    pub quality: u8,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            format: ImageFormat::Png,
            quality: 90,
        }
    }
}

/// Headless Chrome pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Number of Chrome instances kept alive by a capture process (default: CPU count, at most 8)
    pub pool_size: usize,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for page loads (default: Chrome default)
    pub user_agent: Option<String>,

    /// Browser viewport used for every capture
    pub viewport: Viewport,

    /// Upper bound on page navigation (default: 20 seconds)
    pub navigation_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().clamp(1, 8),
            chrome_path: None,
            user_agent: None,
            viewport: Viewport::default(),
            navigation_timeout: Duration::from_secs(20),
        }
    }
}

/// Browser viewport configuration for screenshots
///
/// # Examples
///
/// ```rust
/// use screenshot_archive::Viewport;
///
/// let mobile = Viewport {
///     width: 375,
///     height: 667,
///     device_scale_factor: 2.0,
///     mobile: true,
/// };
/// assert!(mobile.mobile);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio for high-DPI displays (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Listen address of the HTTP API (default: 0.0.0.0:9000)
    pub address: String,

    /// Port of the Prometheus exporter, disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:9000".to_string(),
            metrics_port: None,
        }
    }
}

/// Supported screenshot image formats
///
/// The lowercase name is part of the stored metadata and of the
/// `Content-Type` served back (`image/<format>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format - lossless compression, best quality
    Png,
    /// JPEG format - lossy compression, smaller files
    Jpeg,
    /// WebP format - modern compression, good balance of size and quality
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(ConfigError(format!("Unsupported image format: {other}"))),
        }
    }
}

/// Generate Chrome command-line arguments for a pooled headless instance
///
/// Every instance gets its own user data and temp directory so that several
/// browsers can run side by side without singleton conflicts.
///
/// # Examples
///
/// ```rust
/// use screenshot_archive::{BrowserSettings, get_chrome_args};
///
/// let args = get_chrome_args(&BrowserSettings::default(), 0);
/// assert!(args.contains(&"--headless".to_string()));
/// ```
pub fn get_chrome_args(settings: &BrowserSettings, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--window-size={},{}",
            settings.viewport.width, settings.viewport.height
        ),
        format!("--user-data-dir=/tmp/screenshot-archive-{unique_id}"),
        format!("--temp-dir=/tmp/screenshot-archive-temp-{unique_id}"),
    ];

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    settings: &BrowserSettings,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, ConfigError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(settings.viewport.width, settings.viewport.height)
        .args(get_chrome_args(settings, instance_id));

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(ConfigError)
}
