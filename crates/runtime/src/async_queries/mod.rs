//! Async query dispatch.
//!
//! A request on the async path is validated, checked against the caller's
//! async token and handed to the job queue. Workers publish `running`, then
//! `done` or `error` events on the token's channel.

pub mod events;
pub mod jobs;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use chartdata_common::config::AsyncQuerySettings;
use chartdata_error::Result;

pub use events::{AsyncEvent, EventStore};
pub use jobs::{
    result_url_prefix, AsyncJobMetadata, ChartDataJob, JobQueue, JobStatus, LocalJobQueue,
};
pub use token::{AsyncClaims, AsyncTokenCodec};

use crate::command::ChartDataCommand;

pub struct AsyncQueryManager {
    tokens: AsyncTokenCodec,
    queue: Arc<dyn JobQueue>,
    events: Arc<EventStore>,
}

impl AsyncQueryManager {
    pub fn new(tokens: AsyncTokenCodec, queue: Arc<dyn JobQueue>, events: Arc<EventStore>) -> Self {
        Self {
            tokens,
            queue,
            events,
        }
    }

    /// Manager backed by a [`LocalJobQueue`] on the current runtime.
    ///
    /// Result URLs are built under `api_prefix`. A channel's events live as
    /// long as the token that names it.
    pub fn start_local(
        settings: &AsyncQuerySettings,
        command: Arc<ChartDataCommand>,
        api_prefix: &str,
    ) -> Self {
        let token_ttl = Duration::from_secs(settings.token_ttl_secs);
        let events = Arc::new(EventStore::new(settings.events_per_channel, token_ttl));
        let queue = LocalJobQueue::start(
            command,
            events.clone(),
            settings.max_concurrent_jobs,
            result_url_prefix(api_prefix),
        );
        let tokens = AsyncTokenCodec::new(
            settings.jwt_secret.clone(),
            token_ttl,
            settings.cookie_name.clone(),
        );
        Self::new(tokens, Arc::new(queue), events)
    }

    pub fn tokens(&self) -> &AsyncTokenCodec {
        &self.tokens
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn parse_token(&self, token: Option<&str>) -> Result<AsyncClaims> {
        self.tokens.parse(token)
    }

    /// Queue a chart data job for the token's channel and return its metadata.
    pub fn submit_chart_data_job(
        &self,
        claims: &AsyncClaims,
        form_data: Value,
        cache_key: String,
    ) -> Result<AsyncJobMetadata> {
        let mut metadata = AsyncJobMetadata::pending(&claims.channel, &claims.sub);
        metadata.cache_key = Some(cache_key);

        self.events.publish(&metadata);
        if let Err(e) = self.queue.enqueue(ChartDataJob {
            metadata: metadata.clone(),
            form_data,
        }) {
            // Resolve the pending event so pollers do not wait forever.
            let mut failed = metadata;
            failed.status = JobStatus::Error;
            failed.errors = vec![serde_json::json!({ "message": e.message, "code": e.code })];
            self.events.publish(&failed);
            return Err(e);
        }

        info!(
            target: "jobs",
            job_id = %metadata.job_id,
            channel_id = %metadata.channel_id,
            "Chart data job queued"
        );
        Ok(metadata)
    }

    pub fn read_events(&self, channel: &str, last_id: Option<&str>) -> Vec<AsyncEvent> {
        self.events.read(channel, last_id)
    }
}
