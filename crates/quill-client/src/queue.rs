//! Operations scoped to one named queue.

use crate::client::Client;
use crate::error::QuillResult;
use crate::job::{Job, JobPayload};
use crate::throttle::Throttle;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use uuid::Uuid;

/// Options for `put` and `requeue`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Lower runs sooner.
    pub priority: Option<i64>,
    pub tags: Vec<String>,
    /// Seconds before the job becomes actionable.
    pub delay: i64,
    pub retries: Option<i64>,
    /// Explicit jid; a fresh 128-bit identifier is generated when omitted.
    pub jid: Option<String>,
    pub depends: Vec<String>,
    pub throttles: Vec<String>,
}

/// Options for `recur`.
#[derive(Debug, Clone, Default)]
pub struct RecurOptions {
    /// Seconds after now for the first spawn.
    pub offset: i64,
    pub priority: Option<i64>,
    pub tags: Vec<String>,
    pub retries: Option<i64>,
    pub jid: Option<String>,
    pub throttles: Vec<String>,
}

/// One bucket of wait/run statistics.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsBucket {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub mean: f64,
    #[serde(default)]
    pub std: f64,
    #[serde(default, deserialize_with = "histogram_or_table")]
    pub histogram: Vec<i64>,
}

/// Per-queue statistics for one day.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueStats {
    #[serde(default)]
    pub failed: i64,
    #[serde(default)]
    pub failures: i64,
    #[serde(default)]
    pub retries: i64,
    #[serde(default)]
    pub wait: StatsBucket,
    #[serde(default)]
    pub run: StatsBucket,
}

fn histogram_or_table<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Histogram {
        List(Vec<i64>),
        Table(std::collections::HashMap<String, serde_json::Value>),
    }

    match Histogram::deserialize(deserializer)? {
        Histogram::List(items) => Ok(items),
        Histogram::Table(map) if map.is_empty() => Ok(Vec::new()),
        Histogram::Table(_) => Err(serde::de::Error::custom("expected a histogram list")),
    }
}

// Empty pop/peek results arrive as `{}`.
fn payload_list(raw: &str) -> QuillResult<Vec<JobPayload>> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| Ok(serde_json::from_value(item)?))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

fn fresh_jid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A named queue. Cheap handle: a name and a client.
#[derive(Clone)]
pub struct Queue {
    name: String,
    client: Client,
}

impl Queue {
    pub fn new(name: String, client: Client) -> Self {
        Self { name, client }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn put_args(&self, klass: &str, data: &str, options: &PutOptions) -> Vec<String> {
        vec![
            self.client.worker_name().to_string(),
            self.name.clone(),
            options.jid.clone().unwrap_or_else(fresh_jid),
            klass.to_string(),
            data.to_string(),
            options.delay.to_string(),
            "priority".to_string(),
            options.priority.unwrap_or(0).to_string(),
            "tags".to_string(),
            json!(options.tags).to_string(),
            "retries".to_string(),
            options.retries.unwrap_or(5).to_string(),
            "depends".to_string(),
            json!(options.depends).to_string(),
            "throttles".to_string(),
            json!(options.throttles).to_string(),
        ]
    }

    /// Create a job in this queue, or move an existing jid into it. Returns
    /// the jid.
    pub async fn put(
        &self,
        klass: &str,
        data: &str,
        options: PutOptions,
    ) -> QuillResult<String> {
        let args = self.put_args(klass, data, &options);
        self.client.call("put", args).await
    }

    /// Like `put`, for jobs already known to the server (typically failed
    /// ones being re-enqueued).
    pub async fn requeue(
        &self,
        klass: &str,
        data: &str,
        options: PutOptions,
    ) -> QuillResult<String> {
        let args = self.put_args(klass, data, &options);
        self.client.call("requeue", args).await
    }

    /// Install a recurring schedule spawning a job every `interval` seconds,
    /// the first one `offset` seconds from now.
    pub async fn recur(
        &self,
        klass: &str,
        data: &str,
        interval: i64,
        options: RecurOptions,
    ) -> QuillResult<String> {
        let args = vec![
            self.name.clone(),
            options.jid.clone().unwrap_or_else(fresh_jid),
            klass.to_string(),
            data.to_string(),
            "interval".to_string(),
            interval.to_string(),
            options.offset.to_string(),
            "priority".to_string(),
            options.priority.unwrap_or(0).to_string(),
            "tags".to_string(),
            json!(options.tags).to_string(),
            "retries".to_string(),
            options.retries.unwrap_or(5).to_string(),
            "throttles".to_string(),
            json!(options.throttles).to_string(),
        ];
        self.client.call("recur", args).await
    }

    /// Pop one job, reserving it for this worker.
    pub async fn pop(&self) -> QuillResult<Option<Job>> {
        let mut jobs = self.pop_many(1).await?;
        Ok(if jobs.is_empty() {
            None
        } else {
            Some(jobs.remove(0))
        })
    }

    /// Pop up to `count` jobs, each already reserved for this worker.
    pub async fn pop_many(&self, count: usize) -> QuillResult<Vec<Job>> {
        let raw: String = self
            .client
            .call(
                "pop",
                vec![
                    self.name.clone(),
                    self.client.worker_name().to_string(),
                    count.to_string(),
                ],
            )
            .await?;
        Ok(payload_list(&raw)?
            .into_iter()
            .map(|payload| Job::from_payload(self.client.clone(), payload))
            .collect())
    }

    /// Look at the next job without reserving it.
    pub async fn peek(&self) -> QuillResult<Option<Job>> {
        let mut jobs = self.peek_many(1).await?;
        Ok(if jobs.is_empty() {
            None
        } else {
            Some(jobs.remove(0))
        })
    }

    pub async fn peek_many(&self, count: usize) -> QuillResult<Vec<Job>> {
        let raw: String = self
            .client
            .call("peek", vec![self.name.clone(), count.to_string()])
            .await?;
        Ok(payload_list(&raw)?
            .into_iter()
            .map(|payload| Job::from_payload(self.client.clone(), payload))
            .collect())
    }

    /// Wait/run statistics for a day; defaults to today.
    pub async fn stats(&self, date: Option<f64>) -> QuillResult<QueueStats> {
        let date = date.unwrap_or_else(|| self.client.clock().now());
        let raw: String = self
            .client
            .call(
                "stats",
                vec![self.name.clone(), crate::clock::format_seconds(date)],
            )
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Stop dispatching jobs from this queue.
    pub async fn pause(&self) -> QuillResult<()> {
        self.client.call_value("pause", vec![self.name.clone()]).await?;
        Ok(())
    }

    pub async fn unpause(&self) -> QuillResult<()> {
        self.client
            .call_value("unpause", vec![self.name.clone()])
            .await?;
        Ok(())
    }

    /// Jobs in the queue across every state the server counts.
    pub async fn length(&self) -> QuillResult<i64> {
        self.client.call("length", vec![self.name.clone()]).await
    }

    /// Per-state counts for this queue.
    pub async fn counts(&self) -> QuillResult<crate::queues::QueueCounts> {
        let raw: String = self.client.call("queues", vec![self.name.clone()]).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The implicit per-queue concurrency throttle.
    pub fn throttle(&self) -> Throttle {
        self.client.throttle(format!("ql:q:{}", self.name))
    }

    /// The lock duration for jobs popped from this queue: the
    /// `<queue>-heartbeat` option when set, else the global `heartbeat`,
    /// else 60.
    pub async fn heartbeat(&self) -> QuillResult<i64> {
        let config = self.client.config().all().await?;
        let read = |key: &str| {
            config.get(key).and_then(|value| match value {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.parse().ok(),
                _ => None,
            })
        };
        Ok(read(&format!("{}-heartbeat", self.name))
            .or_else(|| read("heartbeat"))
            .unwrap_or(60))
    }

    pub async fn set_heartbeat(&self, seconds: i64) -> QuillResult<()> {
        self.client
            .config()
            .set(&format!("{}-heartbeat", self.name), seconds)
            .await
    }

    /// Jid listings per state.
    pub fn jobs(&self) -> QueueJobs {
        QueueJobs {
            name: self.name.clone(),
            client: self.client.clone(),
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

/// Paginated jid listings for one queue.
pub struct QueueJobs {
    name: String,
    client: Client,
}

impl QueueJobs {
    async fn list(&self, kind: &str, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        self.client
            .call(
                "jobs",
                vec![
                    kind.to_string(),
                    self.name.clone(),
                    offset.to_string(),
                    count.to_string(),
                ],
            )
            .await
    }

    pub async fn depends(&self, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        self.list("depends", offset, count).await
    }

    pub async fn recurring(&self, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        self.list("recurring", offset, count).await
    }

    pub async fn running(&self, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        self.list("running", offset, count).await
    }

    pub async fn scheduled(&self, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        self.list("scheduled", offset, count).await
    }

    pub async fn stalled(&self, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        self.list("stalled", offset, count).await
    }
}
