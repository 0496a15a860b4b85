//! Browser pool management for concurrent Chrome instances
//!
//! Capture workers share a bounded set of headless Chrome processes. A
//! semaphore caps concurrent captures at the pool size; instances are launched
//! lazily, handed out as [`BrowserLease`]s and returned on drop. Instances
//! whose CDP handler died, that failed too often or that grew too old are
//! replaced instead of being handed out again.

use crate::{create_browser_config, BrowserSettings, CaptureError};
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_INSTANCE_AGE: Duration = Duration::from_secs(3600);
const MAX_INSTANCE_FAILURES: usize = 10;

/// A single Chrome process and its CDP event loop.
#[derive(Debug)]
pub struct BrowserInstance {
    /// Unique identifier, used for the per-instance profile directory
    pub id: usize,
    browser: Browser,
    handler: JoinHandle<()>,
    created_at: Instant,
    /// Captures served by this instance
    pub capture_count: usize,
    /// Failed captures on this instance
    pub failure_count: usize,
}

impl BrowserInstance {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn is_usable(&self) -> bool {
        !self.handler.is_finished()
            && self.failure_count <= MAX_INSTANCE_FAILURES
            && self.age() <= MAX_INSTANCE_AGE
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("Browser instance {} close failed: {}", self.id, e);
        }
        self.handler.abort();
    }
}

/// Exclusive use of one pooled browser until dropped.
pub struct BrowserLease {
    instance: Option<BrowserInstance>,
    pool: Arc<BrowserPool>,
    _permit: OwnedSemaphorePermit,
}

impl BrowserLease {
    pub fn browser(&self) -> Option<&Browser> {
        self.instance.as_ref().map(|i| &i.browser)
    }

    pub fn instance_id(&self) -> Option<usize> {
        self.instance.as_ref().map(|i| i.id)
    }

    /// Count a failed capture against this instance.
    pub fn mark_failed(&mut self) {
        if let Some(instance) = self.instance.as_mut() {
            instance.failure_count += 1;
        }
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            instance.capture_count += 1;
            self.pool.give_back(instance);
        }
    }
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Default)]
pub struct BrowserPoolStats {
    pub capacity: usize,
    pub idle_instances: usize,
    pub launched_instances: usize,
    pub retired_instances: usize,
}

pub struct BrowserPool {
    settings: BrowserSettings,
    idle: Mutex<Vec<BrowserInstance>>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicUsize,
    retired: AtomicUsize,
    is_shutting_down: AtomicBool,
}

impl BrowserPool {
    pub fn new(settings: BrowserSettings) -> Arc<Self> {
        let capacity = settings.pool_size.max(1);
        Arc::new(Self {
            settings,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            semaphore: Arc::new(Semaphore::new(capacity)),
            next_id: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
            is_shutting_down: AtomicBool::new(false),
        })
    }

    /// Launch one instance up front so that a missing Chrome is reported at
    /// startup rather than on the first job.
    pub async fn warm_up(self: &Arc<Self>) -> Result<(), CaptureError> {
        let lease = self.acquire().await?;
        info!(
            "Browser pool ready (capacity {}, first instance {:?})",
            self.settings.pool_size,
            lease.instance_id()
        );
        Ok(())
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<BrowserLease, CaptureError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(CaptureError::BrowserUnavailable);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CaptureError::BrowserUnavailable)?;

        let instance = match self.take_idle() {
            Some(instance) => instance,
            None => self.launch().await?,
        };

        Ok(BrowserLease {
            instance: Some(instance),
            pool: self.clone(),
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<BrowserInstance> {
        let mut idle = self.idle.lock().ok()?;
        while let Some(instance) = idle.pop() {
            if instance.is_usable() {
                return Some(instance);
            }
            self.retire(instance);
        }
        None
    }

    fn give_back(&self, instance: BrowserInstance) {
        if self.is_shutting_down.load(Ordering::Relaxed) || !instance.is_usable() {
            self.retire(instance);
            return;
        }
        match self.idle.lock() {
            Ok(mut idle) => idle.push(instance),
            Err(_) => self.retire(instance),
        }
    }

    fn retire(&self, instance: BrowserInstance) {
        info!(
            "Retiring browser instance {}: age={:?}, captures={}, failures={}, handler_alive={}",
            instance.id,
            instance.age(),
            instance.capture_count,
            instance.failure_count,
            !instance.handler.is_finished()
        );
        self.retired.fetch_add(1, Ordering::Relaxed);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(instance.shutdown());
        }
    }

    async fn launch(&self) -> Result<BrowserInstance, CaptureError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let config = create_browser_config(&self.settings, id)
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            error!("Failed to launch browser instance {}: {}", id, e);
            CaptureError::BrowserLaunchFailed(e.to_string())
        })?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser instance {} handler error: {}", id, e);
                    break;
                }
            }
            debug!("Browser instance {} handler stream ended", id);
        });

        info!("Browser instance {} launched", id);
        Ok(BrowserInstance {
            id,
            browser,
            handler,
            created_at: Instant::now(),
            capture_count: 0,
            failure_count: 0,
        })
    }

    pub fn stats(&self) -> BrowserPoolStats {
        BrowserPoolStats {
            capacity: self.settings.pool_size,
            idle_instances: self.idle.lock().map(|i| i.len()).unwrap_or(0),
            launched_instances: self.next_id.load(Ordering::Relaxed),
            retired_instances: self.retired.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);
        self.semaphore.close();

        let instances: Vec<BrowserInstance> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for instance in instances {
            instance.shutdown().await;
        }

        info!("Browser pool shutdown complete: {:?}", self.stats());
    }
}

impl std::fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserPool").field("stats", &self.stats()).finish()
    }
}
