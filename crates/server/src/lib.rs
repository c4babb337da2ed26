//! Chart Data Server: the REST layer over the chart data runtime.
//!
//! Exposes:
//! - **Chart API** (`{prefix}/chart/...`): query results, chart CRUD,
//!   export/import, favorites and screenshots.
//! - **Async events** (`{prefix}/async_event/`): job status for the caller's channel.
//! - **Observability**: `/health`, `/ready` and Prometheus `/metrics`.
use anyhow::Context;
use axum::http::{header, StatusCode};
use axum::{response::IntoResponse, routing::get, Json, Router};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use chartdata_common::config::AppConfig;
use chartdata_common::telemetry::init_logging;
use chartdata_runtime::charts::{ChartStore, InMemoryChartStore};
use chartdata_runtime::screenshots::ScreenshotEngine;

// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "chartdata_http_requests_total",
        "HTTP requests by matched route and status",
    );
    let counter = IntCounterVec::new(opts, &["route", "status"]).expect("valid metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static ACTIVE_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    let opts = Opts::new("chartdata_active_requests", "Requests currently in flight");
    let gauge = IntGauge::with_opts(opts).expect("valid metric");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
});

pub static ASYNC_JOBS_ENQUEUED: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new(
        "chartdata_async_jobs_enqueued_total",
        "Chart data jobs handed to the async queue",
    );
    let counter = IntCounter::with_opts(opts).expect("valid metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("chartdata_cache_hits_total", "Result cache hits");
    let counter = IntCounter::with_opts(opts).expect("valid metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("chartdata_cache_misses_total", "Result cache misses");
    let counter = IntCounter::with_opts(opts).expect("valid metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub mod api;
pub mod auth;
pub mod bundle;
pub mod error;
pub mod metered_cache;
pub mod middleware;
pub mod query_args;
pub mod state;

pub use auth::{ApiKeyAuthenticator, Authenticator};
pub use chartdata_common::auth::AuthenticatedUser;
pub use error::ApiError;
pub use state::AppState;

pub struct ChartDataServer {
    config_path: String,
    authenticator: Option<Arc<dyn Authenticator>>,
    chart_store: Option<Arc<dyn ChartStore>>,
    screenshot_engine: Option<Arc<dyn ScreenshotEngine>>,
    api_router: Router,
}

impl Default for ChartDataServer {
    fn default() -> Self {
        Self {
            config_path: "config/chartdata.yaml".to_string(),
            authenticator: None,
            chart_store: None,
            screenshot_engine: None,
            api_router: Router::new(),
        }
    }
}

impl ChartDataServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config_path: &str) -> Self {
        self.config_path = config_path.to_string();
        self
    }

    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(auth);
        self
    }

    pub fn with_chart_store(mut self, store: Arc<dyn ChartStore>) -> Self {
        self.chart_store = Some(store);
        self
    }

    pub fn with_screenshot_engine(mut self, engine: Arc<dyn ScreenshotEngine>) -> Self {
        self.screenshot_engine = Some(engine);
        self
    }

    /// Extra routes served behind the same middleware as the chart API.
    pub fn with_api_router(mut self, router: Router) -> Self {
        self.api_router = router;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = AppConfig::from_file(&self.config_path)?;
        init_logging(&config.logging)?;

        let charts = self
            .chart_store
            .unwrap_or_else(|| Arc::new(InMemoryChartStore::new()));
        let state = AppState::from_config(&config, charts, self.screenshot_engine).await;

        let authenticator: Option<Arc<dyn Authenticator>> = match self.authenticator {
            Some(auth) => Some(auth),
            None if config.auth.enabled => {
                Some(Arc::new(ApiKeyAuthenticator::from_settings(&config.auth)))
            }
            None => None,
        };

        info!(
            "Features: global_async_queries={}, thumbnails={}, auth={}",
            config.features.global_async_queries,
            config.features.thumbnails,
            authenticator.is_some()
        );

        let app = create_app(
            state,
            authenticator,
            &config.server.api_prefix,
            self.api_router,
        );

        let addr: SocketAddr = config
            .server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address {}", config.server.listen_addr))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("{} listening on {}", config.server.name, addr);

        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// The whole HTTP surface: API routes behind auth, plus unauthenticated
/// health and metrics routes. Every request is counted.
pub fn create_app(
    state: AppState,
    authenticator: Option<Arc<dyn Authenticator>>,
    prefix: &str,
    extra: Router,
) -> Router {
    let api = api::create_api_router(state.clone(), prefix)
        .merge(extra)
        .layer(axum::middleware::from_fn_with_state(
            state,
            middleware::async_token_cookie,
        ))
        .layer(axum::middleware::from_fn(move |req, next| {
            auth::axum_auth_middleware(req, next, authenticator.clone())
        }));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api)
        .layer(axum::middleware::from_fn(middleware::track_requests))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ready" }))
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(target: "errors", "Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
