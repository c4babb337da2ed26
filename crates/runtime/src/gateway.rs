//! Query result gateway.
//!
//! # Request lifecycle
//!
//! 1. The raw payload is validated into a [`QueryContext`].
//! 2. JSON/FULL requests go to the async path when the request's feature
//!    flags enable it; everything else runs synchronously.
//! 3. Async: the caller's token is checked and a job is queued. The response
//!    carries the job metadata and the context's cache key.
//! 4. Sync: the raw payload is cached under the context key, each query
//!    object is served from the cache or executed, and the results are
//!    encoded in the requested format.
//!
//! [`ChartDataGateway::data_from_cache`] replays step 4 for a stored context
//! but never executes: a per-query cache miss is an error.

use std::sync::Arc;

use serde_json::Value;

use chartdata_common::config::FeatureFlags;
use chartdata_error::{ChartDataError, ErrorCode, Result};

use crate::async_queries::{AsyncJobMetadata, AsyncQueryManager};
use crate::cache_key::context_key;
use crate::command::ChartDataCommand;
use crate::formatter::{format_results, FormattedResponse};
use crate::query_context::{validate_query_context, QueryContext};

#[derive(Debug)]
pub enum ChartDataOutcome {
    /// Terminal result, encoded in the requested format
    Ready(FormattedResponse),
    /// Queued on the async path
    Pending(AsyncJobMetadata),
}

pub struct ChartDataGateway {
    command: Arc<ChartDataCommand>,
    async_queries: Option<Arc<AsyncQueryManager>>,
}

impl ChartDataGateway {
    pub fn new(command: Arc<ChartDataCommand>) -> Self {
        Self {
            command,
            async_queries: None,
        }
    }

    pub fn with_async_queries(mut self, manager: Arc<AsyncQueryManager>) -> Self {
        self.async_queries = Some(manager);
        self
    }

    pub fn command(&self) -> &Arc<ChartDataCommand> {
        &self.command
    }

    pub fn async_queries(&self) -> Option<&Arc<AsyncQueryManager>> {
        self.async_queries.as_ref()
    }

    pub async fn data(
        &self,
        form_data: &Value,
        flags: FeatureFlags,
        async_token: Option<&str>,
    ) -> Result<ChartDataOutcome> {
        let context = validate_query_context(form_data)?;

        if flags.global_async_queries && context.is_async_eligible() {
            let manager = self.async_queries.as_ref().ok_or_else(|| {
                ChartDataError::new(
                    ErrorCode::JobQueueUnavailable,
                    "Async queries are enabled but no job queue is running",
                )
            })?;
            let claims = manager.parse_token(async_token)?;
            let cache_key = context_key(&context)?;
            let job = manager.submit_chart_data_job(&claims, form_data.clone(), cache_key)?;
            return Ok(ChartDataOutcome::Pending(job));
        }

        self.command.cache_context(form_data, &context).await?;
        self.respond(&context, false).await.map(ChartDataOutcome::Ready)
    }

    pub async fn data_from_cache(&self, cache_key: &str) -> Result<FormattedResponse> {
        let form_data = self.command.load_context(cache_key).await?;
        let context = validate_query_context(&form_data)?;
        self.respond(&context, true).await
    }

    async fn respond(&self, context: &QueryContext, force_cached: bool) -> Result<FormattedResponse> {
        let results = self.command.run(context, force_cached).await?;
        format_results(context.result_format, &results)
    }
}
