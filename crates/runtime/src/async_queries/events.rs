use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use super::jobs::{AsyncJobMetadata, JobStatus};

/// A job status change as seen by the client polling its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncEvent {
    pub id: String,
    pub channel_id: String,
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub errors: Vec<serde_json::Value>,
    pub result_url: Option<String>,
}

type ChannelLog = Arc<Mutex<VecDeque<AsyncEvent>>>;

/// Bounded per-channel event log; ids increase across all channels.
///
/// A channel nobody published to or read from for `idle_ttl` is dropped.
pub struct EventStore {
    channels: Cache<String, ChannelLog>,
    next_id: AtomicU64,
    max_per_channel: usize,
}

impl EventStore {
    pub fn new(max_per_channel: usize, idle_ttl: Duration) -> Self {
        Self {
            channels: Cache::builder().time_to_idle(idle_ttl).build(),
            next_id: AtomicU64::new(1),
            max_per_channel: max_per_channel.max(1),
        }
    }

    pub fn publish(&self, job: &AsyncJobMetadata) -> AsyncEvent {
        let event = AsyncEvent {
            id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
            channel_id: job.channel_id.clone(),
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            status: job.status,
            errors: job.errors.clone(),
            result_url: job.result_url.clone(),
        };

        let log = self
            .channels
            .get_with(job.channel_id.clone(), || Arc::new(Mutex::new(VecDeque::new())));
        if let Ok(mut log) = log.lock() {
            log.push_back(event.clone());
            while log.len() > self.max_per_channel {
                log.pop_front();
            }
        }
        event
    }

    /// Events on `channel` newer than `last_id`, oldest first.
    ///
    /// A missing or unparsable `last_id` returns the whole retained log.
    pub fn read(&self, channel: &str, last_id: Option<&str>) -> Vec<AsyncEvent> {
        let after = last_id.and_then(|id| id.parse::<u64>().ok()).unwrap_or(0);
        let Some(log) = self.channels.get(channel) else {
            return vec![];
        };
        let Ok(log) = log.lock() else {
            return vec![];
        };
        log.iter()
            .filter(|e| e.id.parse::<u64>().unwrap_or(0) > after)
            .cloned()
            .collect()
    }

    /// Latest known status of a job, if any event was recorded for it.
    pub fn job_status(&self, channel: &str, job_id: &str) -> Option<JobStatus> {
        let log = self.channels.get(channel)?;
        let log = log.lock().ok()?;
        log.iter().rev().find(|e| e.job_id == job_id).map(|e| e.status)
    }

    /// Number of channels currently retained.
    pub fn channel_count(&self) -> u64 {
        self.channels.run_pending_tasks();
        self.channels.entry_count()
    }
}
