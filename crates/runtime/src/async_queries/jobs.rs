use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info};

use chartdata_error::{ChartDataError, ErrorCode, Result};

use super::events::EventStore;
use crate::command::ChartDataCommand;
use crate::query_context::validate_query_context;

/// Path under `api_prefix` that clients fetch a finished job's result from.
pub fn result_url_prefix(api_prefix: &str) -> String {
    format!("{}/chart/data/", api_prefix.trim_end_matches('/'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJobMetadata {
    pub channel_id: String,
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub errors: Vec<Value>,
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

impl AsyncJobMetadata {
    pub fn pending(channel_id: &str, user_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            job_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            status: JobStatus::Pending,
            errors: vec![],
            result_url: None,
            cache_key: None,
        }
    }
}

/// A chart data job. Owned by the queue once submitted and consumed by the
/// worker that runs it.
#[derive(Debug)]
pub struct ChartDataJob {
    pub metadata: AsyncJobMetadata,
    pub form_data: Value,
}

pub trait JobQueue: Send + Sync {
    /// Hand a job to the workers without waiting for it to run.
    fn enqueue(&self, job: ChartDataJob) -> Result<()>;
}

/// Job queue served by tasks on the current tokio runtime.
pub struct LocalJobQueue {
    sender: mpsc::UnboundedSender<ChartDataJob>,
}

impl LocalJobQueue {
    /// Start the dispatcher. At most `max_concurrent` jobs run at once, and
    /// finished jobs point at `{result_url_prefix}{cache_key}`.
    pub fn start(
        command: Arc<ChartDataCommand>,
        events: Arc<EventStore>,
        max_concurrent: usize,
        result_url_prefix: String,
    ) -> Self {
        let result_url_prefix = Arc::new(result_url_prefix);
        let (sender, mut receiver) = mpsc::unbounded_channel::<ChartDataJob>();
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let command = command.clone();
                let events = events.clone();
                let result_url_prefix = result_url_prefix.clone();
                tokio::spawn(async move {
                    run_job(job, &command, &events, &result_url_prefix).await;
                    drop(permit);
                });
            }
        });

        Self { sender }
    }
}

impl JobQueue for LocalJobQueue {
    fn enqueue(&self, job: ChartDataJob) -> Result<()> {
        self.sender.send(job).map_err(|_| {
            ChartDataError::new(ErrorCode::JobQueueUnavailable, "Async job queue is not running")
        })
    }
}

/// Run one job to completion, publishing its status changes.
pub async fn run_job(
    job: ChartDataJob,
    command: &ChartDataCommand,
    events: &EventStore,
    result_url_prefix: &str,
) {
    let ChartDataJob {
        mut metadata,
        form_data,
    } = job;

    metadata.status = JobStatus::Running;
    events.publish(&metadata);

    match load_chart_data(&form_data, command).await {
        Ok(cache_key) => {
            info!(target: "jobs", job_id = %metadata.job_id, cache_key = %cache_key, "Job finished");
            metadata.status = JobStatus::Done;
            metadata.result_url = Some(format!("{}{}", result_url_prefix, cache_key));
            metadata.cache_key = Some(cache_key);
        }
        Err(e) => {
            error!(target: "jobs", job_id = %metadata.job_id, "Job failed: {}", e);
            metadata.status = JobStatus::Error;
            metadata.errors = vec![serde_json::json!({
                "message": e.message,
                "code": e.code,
            })];
        }
    }
    events.publish(&metadata);
}

async fn load_chart_data(form_data: &Value, command: &ChartDataCommand) -> Result<String> {
    let context = validate_query_context(form_data)?;
    let cache_key = command.cache_context(form_data, &context).await?;
    command.run(&context, false).await?;
    Ok(cache_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MokaResultCache;
    use crate::command::CommandSettings;
    use crate::engine::DataFusionEngine;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use serde_json::json;
    use std::time::Duration;

    fn command() -> Arc<ChartDataCommand> {
        let schema = Arc::new(Schema::new(vec![Field::new("year", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![2000, 2001]))])
                .unwrap();
        let engine = DataFusionEngine::new();
        engine.register_batch(1, batch).unwrap();

        Arc::new(ChartDataCommand::new(
            Arc::new(MokaResultCache::new(8)),
            Arc::new(engine),
            CommandSettings {
                default_datasource: Some(1),
                ..Default::default()
            },
        ))
    }

    async fn wait_for(events: &EventStore, channel: &str, job_id: &str) -> JobStatus {
        for _ in 0..100 {
            match events.job_status(channel, job_id) {
                Some(status @ (JobStatus::Done | JobStatus::Error)) => return status,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("job {} did not finish", job_id);
    }

    #[test]
    fn test_result_url_prefix_follows_api_prefix() {
        assert_eq!(result_url_prefix("/api/v1"), "/api/v1/chart/data/");
        assert_eq!(result_url_prefix("/charts/api/"), "/charts/api/chart/data/");
    }

    #[tokio::test]
    async fn test_job_done_publishes_result_url() {
        let events = Arc::new(EventStore::new(10, Duration::from_secs(60)));
        let queue =
            LocalJobQueue::start(command(), events.clone(), 2, result_url_prefix("/charts/api"));

        let metadata = AsyncJobMetadata::pending("chan", "u1");
        let job_id = metadata.job_id.clone();
        queue
            .enqueue(ChartDataJob {
                metadata,
                form_data: json!({"queries": [{"metrics": ["count"], "groupby": ["year"]}]}),
            })
            .unwrap();

        assert_eq!(wait_for(&events, "chan", &job_id).await, JobStatus::Done);
        let last = events.read("chan", None).pop().unwrap();
        assert!(last
            .result_url
            .unwrap()
            .starts_with("/charts/api/chart/data/"));
    }

    #[tokio::test]
    async fn test_job_error_is_recorded() {
        let events = Arc::new(EventStore::new(10, Duration::from_secs(60)));
        let queue =
            LocalJobQueue::start(command(), events.clone(), 1, result_url_prefix("/api/v1"));

        let metadata = AsyncJobMetadata::pending("chan", "u1");
        let job_id = metadata.job_id.clone();
        queue
            .enqueue(ChartDataJob {
                metadata,
                form_data: json!({"queries": [{"columns": ["nope"]}]}),
            })
            .unwrap();

        assert_eq!(wait_for(&events, "chan", &job_id).await, JobStatus::Error);
        let last = events.read("chan", None).pop().unwrap();
        assert_eq!(last.errors.len(), 1);
        assert!(last.result_url.is_none());
    }
}
