use std::sync::Arc;
use std::time::Duration;

use chartdata_common::auth::AuthenticatedUser;
use chartdata_common::config::{AppConfig, FeatureFlags, FeatureSettings, DEFAULT_API_PREFIX};
use chartdata_runtime::async_queries::AsyncQueryManager;
use chartdata_runtime::charts::{ChartStore, CommandContext};
use chartdata_runtime::screenshots::{ScreenshotEngine, ScreenshotService};
use chartdata_runtime::{
    ChartDataCommand, ChartDataGateway, CommandSettings, DataFusionEngine, MokaResultCache,
    QueryEngine,
};

use crate::metered_cache::MeteredCache;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChartDataGateway>,
    pub charts: Arc<dyn ChartStore>,
    pub features: FeatureSettings,
    pub screenshots: Option<Arc<ScreenshotService>>,
    /// Prefix the API is mounted under, used to build URLs in responses
    pub api_prefix: String,
}

impl AppState {
    pub fn new(gateway: ChartDataGateway, charts: Arc<dyn ChartStore>, features: FeatureSettings) -> Self {
        Self {
            gateway: Arc::new(gateway),
            charts,
            features,
            screenshots: None,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
        }
    }

    pub fn with_screenshots(mut self, service: ScreenshotService) -> Self {
        self.screenshots = Some(Arc::new(service));
        self
    }

    /// Wire the runtime from configuration. The async job queue is only
    /// started when async queries are enabled; screenshots need both the
    /// `thumbnails` feature and a rendering engine.
    pub async fn from_config(
        config: &AppConfig,
        charts: Arc<dyn ChartStore>,
        screenshot_engine: Option<Arc<dyn ScreenshotEngine>>,
    ) -> Self {
        let cache = Arc::new(MeteredCache::new(Arc::new(MokaResultCache::new(
            config.cache.max_size_mb,
        ))));
        let engine = DataFusionEngine::from_config(&config.datasources).await;
        let command = Arc::new(ChartDataCommand::new(
            cache,
            Arc::new(engine),
            CommandSettings::from_config(config),
        ));

        let mut gateway = ChartDataGateway::new(command.clone());
        if config.features.global_async_queries {
            let manager = AsyncQueryManager::start_local(
                &config.async_queries,
                command,
                &config.server.api_prefix,
            );
            gateway = gateway.with_async_queries(Arc::new(manager));
        }

        let state = Self::new(gateway, charts, config.features.clone());
        match screenshot_engine {
            Some(engine) if config.features.thumbnails => {
                let thumbnails = Arc::new(MeteredCache::new(Arc::new(MokaResultCache::new(
                    config.cache.max_size_mb,
                ))));
                state.with_screenshots(ScreenshotService::new(
                    engine,
                    thumbnails,
                    Duration::from_secs(config.cache.thumbnail_ttl_secs),
                ))
            }
            _ => state,
        }
    }

    /// Feature flags for one request.
    pub fn flags(&self) -> FeatureFlags {
        self.features.resolve()
    }

    pub fn engine(&self) -> Arc<dyn QueryEngine> {
        self.gateway.command().engine().clone()
    }

    pub fn command_context(&self, user: AuthenticatedUser) -> CommandContext {
        CommandContext {
            store: self.charts.clone(),
            engine: self.engine(),
            user,
        }
    }
}
