//! Chart screenshots and thumbnails.
//!
//! Rendering happens out of band: callers get a cache key back immediately
//! and the PNG shows up in the thumbnail cache once the render finishes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use chartdata_error::Result;

use crate::cache::ResultCache;
use crate::cache_key::digest;

const SCREENSHOT_DOMAIN: &str = "chartdata:screenshot:v1";

pub const DEFAULT_WINDOW_SIZE: WindowSize = WindowSize {
    width: 800,
    height: 600,
};
pub const DEFAULT_THUMB_SIZE: WindowSize = WindowSize {
    width: 400,
    height: 300,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for WindowSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Renders a chart page into PNG bytes.
#[async_trait]
pub trait ScreenshotEngine: Send + Sync {
    async fn render(&self, url: &str, window: WindowSize, thumb: WindowSize) -> Result<Vec<u8>>;
}

/// A chart URL at a given digest.
#[derive(Debug, Clone)]
pub struct ChartScreenshot {
    pub url: String,
    pub digest: String,
}

impl ChartScreenshot {
    pub fn new(url: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            digest: digest.into(),
        }
    }

    pub fn cache_key(&self, window: WindowSize, thumb: WindowSize) -> String {
        digest(
            SCREENSHOT_DOMAIN,
            &json!({
                "url": self.url,
                "digest": self.digest,
                "window_size": [window.width, window.height],
                "thumb_size": [thumb.width, thumb.height],
            }),
        )
    }

    /// Key of the default-sized thumbnail.
    pub fn thumbnail_key(&self) -> String {
        self.cache_key(DEFAULT_WINDOW_SIZE, DEFAULT_THUMB_SIZE)
    }
}

pub struct ScreenshotService {
    engine: Arc<dyn ScreenshotEngine>,
    cache: Arc<dyn ResultCache>,
    ttl: Duration,
}

impl ScreenshotService {
    pub fn new(engine: Arc<dyn ScreenshotEngine>, cache: Arc<dyn ResultCache>, ttl: Duration) -> Self {
        Self { engine, cache, ttl }
    }

    /// Start rendering in the background and return the key the image will be
    /// stored under.
    pub fn spawn_render(
        &self,
        screenshot: &ChartScreenshot,
        window: WindowSize,
        thumb: WindowSize,
    ) -> String {
        let key = screenshot.cache_key(window, thumb);
        let engine = self.engine.clone();
        let cache = self.cache.clone();
        let ttl = self.ttl;
        let url = screenshot.url.clone();
        let task_key = key.clone();

        tokio::spawn(async move {
            match engine.render(&url, window, thumb).await {
                Ok(png) => {
                    info!(target: "jobs", url = %url, cache_key = %task_key, "Screenshot cached");
                    cache.set(&task_key, png, ttl).await;
                }
                Err(e) => error!(target: "jobs", url = %url, "Screenshot failed: {}", e),
            }
        });
        key
    }

    pub async fn get(&self, cache_key: &str) -> Option<Vec<u8>> {
        self.cache
            .get(cache_key)
            .await
            .map(|entry| entry.payload.as_ref().clone())
    }

    pub async fn get_thumbnail(&self, screenshot: &ChartScreenshot) -> Option<Vec<u8>> {
        self.get(&screenshot.thumbnail_key()).await
    }
}
