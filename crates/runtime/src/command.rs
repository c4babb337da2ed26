//! Execution of a validated query context against the result cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use chartdata_common::config::AppConfig;
use chartdata_error::{ChartDataError, ErrorCode, ErrorContext, Result};

use crate::cache::ResultCache;
use crate::cache_key::{context_key, query_key};
use crate::engine::QueryEngine;
use crate::query_context::{QueryContext, QueryObject, ResultType};
use crate::result::QueryResult;

/// Cache timeouts and datasource defaults.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub default_cache_timeout: u64,
    /// TTL of stored raw query contexts
    pub context_cache_timeout: u64,
    pub datasource_cache_timeouts: HashMap<i64, u64>,
    pub default_datasource: Option<i64>,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            default_cache_timeout: chartdata_common::config::DEFAULT_CACHE_TIMEOUT_SECS,
            context_cache_timeout: chartdata_common::config::DEFAULT_CACHE_TIMEOUT_SECS,
            datasource_cache_timeouts: HashMap::new(),
            default_datasource: None,
        }
    }
}

impl CommandSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_cache_timeout: config.cache.default_timeout_secs,
            context_cache_timeout: config.cache.context_timeout_secs,
            datasource_cache_timeouts: config
                .datasources
                .iter()
                .filter_map(|ds| ds.cache_timeout.map(|t| (ds.id, t)))
                .collect(),
            default_datasource: config.default_datasource,
        }
    }
}

/// Runs query contexts, reading and writing per-query results in the cache.
///
/// Shared by the request path and the async job workers.
pub struct ChartDataCommand {
    cache: Arc<dyn ResultCache>,
    engine: Arc<dyn QueryEngine>,
    settings: CommandSettings,
}

impl ChartDataCommand {
    pub fn new(
        cache: Arc<dyn ResultCache>,
        engine: Arc<dyn QueryEngine>,
        settings: CommandSettings,
    ) -> Self {
        Self {
            cache,
            engine,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<dyn QueryEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<dyn ResultCache> {
        &self.cache
    }

    pub fn resolve_datasource(&self, context: &QueryContext) -> Result<i64> {
        let id = context
            .datasource
            .as_ref()
            .map(|ds| ds.id)
            .or(self.settings.default_datasource)
            .ok_or_else(|| {
                ChartDataError::new(
                    ErrorCode::DatasourceNotFound,
                    "No datasource given and no default datasource configured",
                )
            })?;

        if !self.engine.has_datasource(id) {
            return Err(ChartDataError::new(
                ErrorCode::DatasourceNotFound,
                format!("Datasource {} does not exist", id),
            ));
        }
        Ok(id)
    }

    /// Request override, then the datasource's timeout, then the system default.
    pub fn cache_timeout(&self, context: &QueryContext, datasource_id: i64) -> Duration {
        let secs = context
            .custom_cache_timeout
            .or_else(|| {
                self.settings
                    .datasource_cache_timeouts
                    .get(&datasource_id)
                    .copied()
            })
            .unwrap_or(self.settings.default_cache_timeout);
        Duration::from_secs(secs)
    }

    /// Store the raw payload under the context key and return the key.
    pub async fn cache_context(&self, raw: &Value, context: &QueryContext) -> Result<String> {
        let key = context_key(context)?;
        self.resolve_datasource(context)?;
        let ttl = Duration::from_secs(self.settings.context_cache_timeout);
        self.cache.set(&key, serde_json::to_vec(raw)?, ttl).await;
        Ok(key)
    }

    /// Load a raw payload previously stored with [`Self::cache_context`].
    pub async fn load_context(&self, cache_key: &str) -> Result<Value> {
        let entry = self.cache.get(cache_key).await.ok_or_else(|| {
            ChartDataError::new(ErrorCode::CacheKeyNotFound, "Cached data not found").with_context(
                ErrorContext::Cache {
                    cache_key: cache_key.to_string(),
                },
            )
        })?;
        Ok(serde_json::from_slice(&entry.payload)?)
    }

    /// Run every query object in order.
    ///
    /// With `force_cached` a per-query cache miss fails the whole run instead
    /// of executing the query.
    pub async fn run(&self, context: &QueryContext, force_cached: bool) -> Result<Vec<QueryResult>> {
        let datasource_id = self.resolve_datasource(context)?;
        let ttl = self.cache_timeout(context, datasource_id);

        let mut results = Vec::with_capacity(context.queries.len());
        for query in &context.queries {
            let result = if context.result_type == ResultType::Query {
                let text = self.engine.query_text(datasource_id, query).await?;
                QueryResult::query_only(text)
            } else {
                let force = context.force && !force_cached;
                self.run_query(datasource_id, query, ttl, force, force_cached)
                    .await?
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn run_query(
        &self,
        datasource_id: i64,
        query: &QueryObject,
        ttl: Duration,
        force: bool,
        force_cached: bool,
    ) -> Result<QueryResult> {
        let key = query_key(datasource_id, query, ResultType::Full)?;

        if !force {
            if let Some(entry) = self.cache.get(&key).await {
                match serde_json::from_slice::<QueryResult>(&entry.payload) {
                    Ok(mut result) => {
                        debug!(target: "cache", key = %key, "Serving query result from cache");
                        result.is_cached = true;
                        result.cache_key = Some(key);
                        result.cached_dttm = Some(entry.created_at.to_rfc3339());
                        result.cache_timeout = entry.ttl.as_secs();
                        return Ok(result);
                    }
                    Err(e) => {
                        warn!(target: "cache", key = %key, "Discarding unreadable cache entry: {}", e);
                    }
                }
            }
        }

        if force_cached {
            return Err(
                ChartDataError::new(ErrorCode::CacheLoadFailed, "Error loading data from cache")
                    .with_context(ErrorContext::Cache { cache_key: key }),
            );
        }

        let start = Instant::now();
        let output = self.engine.execute(datasource_id, query).await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut result = QueryResult::from_output(output, query.row_limit, duration_ms);
        result.cache_key = Some(key.clone());
        result.cache_timeout = ttl.as_secs();

        info!(
            target: "queries",
            datasource_id,
            cache_key = %key,
            rows_returned = result.rowcount,
            duration_ms,
            cache_hit = false,
            "Query executed"
        );

        self.cache.set(&key, serde_json::to_vec(&result)?, ttl).await;
        Ok(result)
    }
}
