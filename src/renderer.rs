//! Page rendering
//!
//! [`Renderer`] is the seam between capture workers and the browser. The
//! Chrome adapter leases a pooled browser, opens a page with the configured
//! viewport, waits for navigation and captures the viewport in the requested
//! format.

use crate::{BrowserPool, CaptureError, ImageFormat, Viewport};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `url` and return encoded image bytes.
    async fn render(&self, url: &str, format: ImageFormat, quality: u8)
        -> Result<Vec<u8>, CaptureError>;
}

pub struct ChromeRenderer {
    pool: Arc<BrowserPool>,
    viewport: Viewport,
    navigation_timeout: Duration,
}

impl ChromeRenderer {
    pub fn new(pool: Arc<BrowserPool>, viewport: Viewport, navigation_timeout: Duration) -> Self {
        Self {
            pool,
            viewport,
            navigation_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    async fn capture(
        &self,
        page: &Page,
        url: &str,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, CaptureError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.width)
            .height(self.viewport.height)
            .device_scale_factor(self.viewport.device_scale_factor)
            .mobile(self.viewport.mobile)
            .build()
            .map_err(CaptureError::PageError)?;
        page.execute(metrics)
            .await
            .map_err(|e| CaptureError::PageError(e.to_string()))?;

        match timeout(self.navigation_timeout, async {
            page.goto(url).await?;
            page.wait_for_navigation().await
        })
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(CaptureError::PageError(e.to_string())),
            Err(_) => return Err(CaptureError::Timeout(self.navigation_timeout)),
        }

        let mut params = ScreenshotParams::builder().format(capture_format(format));
        if format != ImageFormat::Png {
            params = params.quality(i64::from(quality));
        }

        page.screenshot(params.build())
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }
}

fn capture_format(format: ImageFormat) -> CaptureScreenshotFormat {
    match format {
        ImageFormat::Png => CaptureScreenshotFormat::Png,
        ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        ImageFormat::Webp => CaptureScreenshotFormat::Webp,
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(
        &self,
        url: &str,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, CaptureError> {
        let mut lease = self.pool.acquire().await?;
        let browser = lease.browser().ok_or(CaptureError::BrowserUnavailable)?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::PageError(e.to_string()))?;

        let result = self.capture(&page, url, format, quality).await;
        if let Err(e) = page.close().await {
            debug!(url, "Failed to close page: {}", e);
        }

        match &result {
            Ok(bytes) => debug!(url, size = bytes.len(), instance = ?lease.instance_id(), "Rendered page"),
            Err(_) => lease.mark_failed(),
        }
        result
    }
}
