//! Job and recurring-job entities.
//!
//! Both are transient client-side snapshots of server state: every mutation
//! is exactly one script invocation, and the local fields are only updated
//! where the reply carries the new value.

use crate::client::{truthy, Client};
use crate::error::{QuillError, QuillResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Server-side job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Running,
    Scheduled,
    Depends,
    Stalled,
    Complete,
    Failed,
    Throttled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Scheduled => "scheduled",
            JobState::Depends => "depends",
            JobState::Stalled => "stalled",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Throttled => "throttled",
        };
        f.write_str(name)
    }
}

/// The failure record attached to a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub group: String,
    pub message: String,
    #[serde(default)]
    pub when: f64,
    #[serde(default)]
    pub worker: String,
}

// The script's JSON encoder renders empty Lua tables as `{}`, so any field
// that is conceptually a list may arrive as a list, an empty map, or null.
pub(crate) fn list_or_table<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrTable {
        List(Vec<String>),
        Table(HashMap<String, serde_json::Value>),
        Nothing(Option<bool>),
    }

    match ListOrTable::deserialize(deserializer)? {
        ListOrTable::List(items) => Ok(items),
        ListOrTable::Table(map) if map.is_empty() => Ok(Vec::new()),
        ListOrTable::Table(_) => Err(serde::de::Error::custom("expected a list of strings")),
        ListOrTable::Nothing(_) => Ok(Vec::new()),
    }
}

fn records_or_table<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RecordsOrTable {
        List(Vec<serde_json::Value>),
        Table(HashMap<String, serde_json::Value>),
        Nothing(Option<bool>),
    }

    match RecordsOrTable::deserialize(deserializer)? {
        RecordsOrTable::List(items) => Ok(items),
        RecordsOrTable::Table(map) if map.is_empty() => Ok(Vec::new()),
        RecordsOrTable::Table(_) => Err(serde::de::Error::custom("expected a list of records")),
        RecordsOrTable::Nothing(_) => Ok(Vec::new()),
    }
}

pub(crate) fn payloads_or_table<'de, D>(
    deserializer: D,
) -> Result<Vec<JobPayload>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PayloadsOrTable {
        List(Vec<JobPayload>),
        Table(HashMap<String, serde_json::Value>),
        Nothing(Option<bool>),
    }

    match PayloadsOrTable::deserialize(deserializer)? {
        PayloadsOrTable::List(items) => Ok(items),
        PayloadsOrTable::Table(map) if map.is_empty() => Ok(Vec::new()),
        PayloadsOrTable::Table(_) => Err(serde::de::Error::custom("expected a list of jobs")),
        PayloadsOrTable::Nothing(_) => Ok(Vec::new()),
    }
}

// An absent failure arrives as `{}` rather than null.
fn failure_or_table<'de, D>(deserializer: D) -> Result<Option<Failure>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        Some(serde_json::Value::Object(map)) if !map.is_empty() => {
            serde_json::from_value(serde_json::Value::Object(map))
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
        _ => Ok(None),
    }
}

fn bool_from_any<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AnyBool {
        Bool(bool),
        Int(i64),
    }

    Ok(match AnyBool::deserialize(deserializer)? {
        AnyBool::Bool(value) => value,
        AnyBool::Int(value) => value != 0,
    })
}

/// Wire shape of a regular job as emitted by `pop`, `peek`, `get` and
/// `multiget`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobPayload {
    pub jid: String,
    pub klass: String,
    pub queue: String,
    pub data: String,
    pub state: JobState,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, deserialize_with = "list_or_table")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "list_or_table")]
    pub throttles: Vec<String>,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub expires: f64,
    #[serde(default)]
    pub retries: i64,
    #[serde(default)]
    pub remaining: i64,
    #[serde(default, deserialize_with = "list_or_table")]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "list_or_table")]
    pub dependents: Vec<String>,
    #[serde(default, deserialize_with = "bool_from_any")]
    pub tracked: bool,
    #[serde(default, deserialize_with = "failure_or_table")]
    pub failure: Option<Failure>,
    #[serde(default, deserialize_with = "records_or_table")]
    pub history: Vec<serde_json::Value>,
}

/// Wire shape of a recurring job as emitted by `recur.get`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecurringJobPayload {
    pub jid: String,
    pub klass: String,
    pub queue: String,
    pub data: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, deserialize_with = "list_or_table")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "list_or_table")]
    pub throttles: Vec<String>,
    #[serde(default)]
    pub retries: i64,
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub count: i64,
}

/// Either kind of job, as returned by jid lookups.
pub enum WorkUnit {
    Job(Box<Job>),
    Recurring(Box<RecurringJob>),
}

/// A snapshot of one job, bound to the client that produced it.
#[derive(Clone)]
pub struct Job {
    client: Client,
    jid: String,
    klass_name: String,
    queue_name: String,
    data: String,
    state: JobState,
    priority: i64,
    tags: Vec<String>,
    throttles: Vec<String>,
    worker_name: String,
    expires_at: f64,
    original_retries: i64,
    retries_left: i64,
    dependencies: Vec<String>,
    dependents: Vec<String>,
    tracked: bool,
    failure: Option<Failure>,
    history: Vec<serde_json::Value>,
    sandbox: Option<PathBuf>,
}

impl Job {
    pub fn from_payload(client: Client, payload: JobPayload) -> Self {
        Self {
            client,
            jid: payload.jid,
            klass_name: payload.klass,
            queue_name: payload.queue,
            data: payload.data,
            state: payload.state,
            priority: payload.priority,
            tags: payload.tags,
            throttles: payload.throttles,
            worker_name: payload.worker,
            expires_at: payload.expires,
            original_retries: payload.retries,
            retries_left: payload.remaining,
            dependencies: payload.dependencies,
            dependents: payload.dependents,
            tracked: payload.tracked,
            failure: payload.failure,
            history: payload.history,
            sandbox: None,
        }
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn klass_name(&self) -> &str {
        &self.klass_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The payload, opaque to the client.
    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn set_data(&mut self, data: impl Into<String>) {
        self.data = data.into();
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn throttles(&self) -> &[String] {
        &self.throttles
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn expires_at(&self) -> f64 {
        self.expires_at
    }

    pub fn original_retries(&self) -> i64 {
        self.original_retries
    }

    pub fn retries_left(&self) -> i64 {
        self.retries_left
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }

    pub fn tracked(&self) -> bool {
        self.tracked
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn history(&self) -> &[serde_json::Value] {
        &self.history
    }

    /// The working directory assigned by the worker for this run.
    pub fn sandbox(&self) -> Option<&Path> {
        self.sandbox.as_deref()
    }

    pub fn set_sandbox(&mut self, path: impl Into<PathBuf>) {
        self.sandbox = Some(path.into());
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Seconds until the lock expires.
    pub fn ttl(&self) -> f64 {
        self.expires_at - self.client.clock().now()
    }

    /// Renew the lock. A rejection from the script means the job is no
    /// longer ours and surfaces as [`QuillError::LostLock`].
    pub async fn heartbeat(&mut self) -> QuillResult<f64> {
        debug!(jid = %self.jid, ttl = self.ttl(), "Heartbeating");
        let args = vec![
            self.jid.clone(),
            self.client.worker_name().to_string(),
            self.data.clone(),
        ];
        let expires: f64 = match self.client.call("heartbeat", args).await {
            Ok(expires) => expires,
            Err(QuillError::Domain(_)) => {
                return Err(QuillError::LostLock {
                    jid: self.jid.clone(),
                })
            }
            Err(err) => return Err(err),
        };
        self.expires_at = expires;
        Ok(expires)
    }

    /// Turn the job in as complete. Returns false when the script refused
    /// without raising (already turned in).
    pub async fn complete(&self) -> QuillResult<bool> {
        info!(jid = %self.jid, "Completing");
        let value = self
            .client
            .call_value(
                "complete",
                vec![
                    self.jid.clone(),
                    self.client.worker_name().to_string(),
                    self.queue_name.clone(),
                    self.data.clone(),
                ],
            )
            .await?;
        Ok(truthy(&value))
    }

    /// Complete and advance into another queue after `delay` seconds, with
    /// fresh dependencies.
    pub async fn complete_and_advance(
        &self,
        next_queue: &str,
        delay: i64,
        depends: &[String],
    ) -> QuillResult<bool> {
        info!(
            jid = %self.jid,
            next = %next_queue,
            from = %self.queue_name,
            "Advancing"
        );
        let value = self
            .client
            .call_value(
                "complete",
                vec![
                    self.jid.clone(),
                    self.client.worker_name().to_string(),
                    self.queue_name.clone(),
                    self.data.clone(),
                    "next".to_string(),
                    next_queue.to_string(),
                    "delay".to_string(),
                    delay.to_string(),
                    "depends".to_string(),
                    json!(depends).to_string(),
                ],
            )
            .await?;
        Ok(truthy(&value))
    }

    /// Mark the job as failed with a categorical group and a message.
    /// Returns the jid on success, None when the script refused.
    pub async fn fail(&self, group: &str, message: &str) -> QuillResult<Option<String>> {
        warn!(jid = %self.jid, group = %group, "Failing");
        let value = self
            .client
            .call_value(
                "fail",
                vec![
                    self.jid.clone(),
                    self.client.worker_name().to_string(),
                    group.to_string(),
                    message.to_string(),
                    self.data.clone(),
                ],
            )
            .await?;
        if truthy(&value) {
            Ok(Some(redis::from_redis_value(&value)?))
        } else {
            Ok(None)
        }
    }

    /// Remove the job entirely. Returns every cancelled jid: this job plus
    /// any dependents the script cancelled with it.
    pub async fn cancel(&self) -> QuillResult<Vec<String>> {
        self.client.call("cancel", vec![self.jid.clone()]).await
    }

    /// Re-enqueue in the same queue after `delay` seconds, spending one
    /// retry. With a group and message, exhausted retries fail the job
    /// under that group. Returns the retries remaining.
    pub async fn retry(
        &self,
        delay: i64,
        group: Option<&str>,
        message: Option<&str>,
    ) -> QuillResult<i64> {
        let mut args = vec![
            self.jid.clone(),
            self.queue_name.clone(),
            self.worker_name.clone(),
            delay.to_string(),
        ];
        if let (Some(group), Some(message)) = (group, message) {
            args.push(group.to_string());
            args.push(message.to_string());
        }
        self.client.call("retry", args).await
    }

    /// Move the job to another queue. Any current worker's subsequent
    /// heartbeat or complete will fail.
    pub async fn move_to(
        &self,
        queue: &str,
        delay: i64,
        depends: &[String],
    ) -> QuillResult<String> {
        info!(jid = %self.jid, to = %queue, from = %self.queue_name, "Moving");
        self.client
            .call(
                "put",
                vec![
                    self.worker_name.clone(),
                    queue.to_string(),
                    self.jid.clone(),
                    self.klass_name.clone(),
                    self.data.clone(),
                    delay.to_string(),
                    "depends".to_string(),
                    json!(depends).to_string(),
                    "throttles".to_string(),
                    json!(self.throttles).to_string(),
                ],
            )
            .await
    }

    /// Begin broadcasting pub/sub events for this jid.
    pub async fn track(&self) -> QuillResult<bool> {
        self.client.track(&self.jid).await
    }

    pub async fn untrack(&self) -> QuillResult<bool> {
        self.client.untrack(&self.jid).await
    }

    /// Add tags. The server owns dedup and ordering.
    pub async fn tag(&self, tags: &[&str]) -> QuillResult<Vec<String>> {
        let mut args = vec!["add".to_string(), self.jid.clone()];
        args.extend(tags.iter().map(|t| t.to_string()));
        let raw: String = self.client.call("tag", args).await?;
        crate::client::string_list_from_json(&raw)
    }

    pub async fn untag(&self, tags: &[&str]) -> QuillResult<Vec<String>> {
        let mut args = vec!["remove".to_string(), self.jid.clone()];
        args.extend(tags.iter().map(|t| t.to_string()));
        let raw: String = self.client.call("tag", args).await?;
        crate::client::string_list_from_json(&raw)
    }

    /// Add dependencies. Only allowed while the job already has at least
    /// one; otherwise the script declines and this returns false.
    pub async fn depend(&self, jids: &[&str]) -> QuillResult<bool> {
        let mut args = vec![self.jid.clone(), "on".to_string()];
        args.extend(jids.iter().map(|j| j.to_string()));
        let value = self.client.call_value("depends", args).await?;
        Ok(truthy(&value))
    }

    /// Remove specific dependencies.
    pub async fn undepend(&self, jids: &[&str]) -> QuillResult<bool> {
        let mut args = vec![self.jid.clone(), "off".to_string()];
        args.extend(jids.iter().map(|j| j.to_string()));
        let value = self.client.call_value("depends", args).await?;
        Ok(truthy(&value))
    }

    /// Remove every dependency.
    pub async fn undepend_all(&self) -> QuillResult<bool> {
        let value = self
            .client
            .call_value(
                "depends",
                vec![self.jid.clone(), "off".to_string(), "all".to_string()],
            )
            .await?;
        Ok(truthy(&value))
    }

    /// Administrative: force the job to stalled immediately.
    pub async fn timeout(&self) -> QuillResult<()> {
        self.client
            .call_value("timeout", vec![self.jid.clone()])
            .await?;
        Ok(())
    }

    /// Change the job's priority (lower runs sooner).
    pub async fn set_priority(&mut self, priority: i64) -> QuillResult<()> {
        self.client
            .call_value("priority", vec![self.jid.clone(), priority.to_string()])
            .await?;
        self.priority = priority;
        Ok(())
    }

    /// Resolve the processor for this job's klass and run the handler for
    /// the queue it was popped from. Handler errors become `fail` with
    /// group `<queue>-<kind>`; nothing a processor does propagates.
    pub async fn process(&mut self) -> QuillResult<()> {
        let registry = self.client.registry().clone();
        let Some(processor) = registry.lookup(&self.klass_name) else {
            warn!(jid = %self.jid, klass = %self.klass_name, "Processor not registered");
            self.fail(
                &format!("{}-klass-not-found", self.queue_name),
                &format!("Processor {} is not registered", self.klass_name),
            )
            .await?;
            return Ok(());
        };

        let Some(handler) = processor.handler_for(&self.queue_name) else {
            warn!(
                jid = %self.jid,
                klass = %self.klass_name,
                queue = %self.queue_name,
                "No handler for queue"
            );
            self.fail(
                &format!("{}-method-missing", self.queue_name),
                &format!(
                    "{} has no handler for queue \"{}\" and no fallback",
                    self.klass_name, self.queue_name
                ),
            )
            .await?;
            return Ok(());
        };

        info!(jid = %self.jid, queue = %self.queue_name, "Processing");
        match handler(self.clone()).await {
            Ok(()) => {
                info!(jid = %self.jid, queue = %self.queue_name, "Processed");
                Ok(())
            }
            Err(err) => {
                warn!(jid = %self.jid, queue = %self.queue_name, error = %err, "Handler failed");
                self.fail(&format!("{}-{}", self.queue_name, err.kind), &err.message)
                    .await?;
                Ok(())
            }
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.klass_name, self.jid)
    }
}

// Job carries a live client handle, so derive(Debug) is unavailable; the
// repr mirrors Display.
impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.klass_name, self.jid)
    }
}

/// A recurring schedule that spawns a regular job every `interval` seconds.
#[derive(Clone)]
pub struct RecurringJob {
    client: Client,
    jid: String,
    klass_name: String,
    queue_name: String,
    data: String,
    priority: i64,
    tags: Vec<String>,
    throttles: Vec<String>,
    retries: i64,
    interval: i64,
    count: i64,
}

impl RecurringJob {
    pub fn from_payload(client: Client, payload: RecurringJobPayload) -> Self {
        Self {
            client,
            jid: payload.jid,
            klass_name: payload.klass,
            queue_name: payload.queue,
            data: payload.data,
            priority: payload.priority,
            tags: payload.tags,
            throttles: payload.throttles,
            retries: payload.retries,
            interval: payload.interval,
            count: payload.count,
        }
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn klass_name(&self) -> &str {
        &self.klass_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn throttles(&self) -> &[String] {
        &self.throttles
    }

    /// Retries granted to each spawned job.
    pub fn retries(&self) -> i64 {
        self.retries
    }

    /// Seconds between spawns.
    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// Jobs spawned so far.
    pub fn count(&self) -> i64 {
        self.count
    }

    async fn update(&self, field: &str, value: String) -> QuillResult<()> {
        self.client
            .call_value(
                "recur.update",
                vec![self.jid.clone(), field.to_string(), value],
            )
            .await?;
        Ok(())
    }

    pub async fn set_interval(&mut self, interval: i64) -> QuillResult<()> {
        self.update("interval", interval.to_string()).await?;
        self.interval = interval;
        Ok(())
    }

    pub async fn set_priority(&mut self, priority: i64) -> QuillResult<()> {
        self.update("priority", priority.to_string()).await?;
        self.priority = priority;
        Ok(())
    }

    pub async fn set_retries(&mut self, retries: i64) -> QuillResult<()> {
        self.update("retries", retries.to_string()).await?;
        self.retries = retries;
        Ok(())
    }

    pub async fn set_count(&mut self, count: i64) -> QuillResult<()> {
        self.update("count", count.to_string()).await?;
        self.count = count;
        Ok(())
    }

    pub async fn set_data(&mut self, data: impl Into<String>) -> QuillResult<()> {
        self.data = data.into();
        self.update("data", self.data.clone()).await
    }

    pub async fn set_klass_name(&mut self, klass: impl Into<String>) -> QuillResult<()> {
        let klass = klass.into();
        self.update("klass", klass.clone()).await?;
        self.klass_name = klass;
        Ok(())
    }

    /// Attach the schedule to another queue.
    pub async fn move_to(&mut self, queue: &str) -> QuillResult<bool> {
        let value = self
            .client
            .call_value(
                "recur.update",
                vec![
                    self.jid.clone(),
                    "queue".to_string(),
                    queue.to_string(),
                ],
            )
            .await?;
        self.queue_name = queue.to_string();
        Ok(truthy(&value))
    }

    /// Cancel all future spawns.
    pub async fn cancel(&self) -> QuillResult<Vec<String>> {
        self.client
            .call_value("unrecur", vec![self.jid.clone()])
            .await?;
        Ok(vec![self.jid.clone()])
    }

    pub async fn tag(&self, tags: &[&str]) -> QuillResult<Vec<String>> {
        let mut args = vec![self.jid.clone()];
        args.extend(tags.iter().map(|t| t.to_string()));
        let raw: String = self.client.call("recur.tag", args).await?;
        crate::client::string_list_from_json(&raw)
    }

    pub async fn untag(&self, tags: &[&str]) -> QuillResult<Vec<String>> {
        let mut args = vec![self.jid.clone()];
        args.extend(tags.iter().map(|t| t.to_string()));
        let raw: String = self.client.call("recur.untag", args).await?;
        crate::client::string_list_from_json(&raw)
    }

    /// The next spawn time, read from the recurrence index directly.
    pub async fn next(&self) -> QuillResult<Option<f64>> {
        let mut cmd = redis::cmd("ZSCORE");
        cmd.arg(format!("ql:q:{}-recur", self.queue_name))
            .arg(&self.jid);
        let value = self.client.invoker().command(cmd).await?;
        Ok(redis::from_redis_value(&value)?)
    }
}

impl fmt::Display for RecurringJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.klass_name, self.jid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessingError;
    use crate::registry::Processor;
    use crate::test_support::{test_client, test_client_with_registry, RecordingInvoker};
    use redis::Value;
    use std::sync::Arc;

    fn payload_json(state: &str) -> String {
        format!(
            r#"{{
                "jid": "jid",
                "klass": "Foo",
                "queue": "foo",
                "data": "{{\"whiz\":\"bang\"}}",
                "state": "{state}",
                "priority": 0,
                "tags": ["foo"],
                "throttles": ["throttle", "ql:q:foo"],
                "worker": "",
                "expires": 0,
                "retries": 3,
                "remaining": 3,
                "dependencies": {{}},
                "dependents": {{}},
                "tracked": false,
                "failure": {{}},
                "history": [{{"q": "foo", "what": "put", "when": 1625072912}}]
            }}"#
        )
    }

    fn make_job(invoker: &Arc<RecordingInvoker>) -> Job {
        let payload: JobPayload = serde_json::from_str(&payload_json("waiting")).unwrap();
        Job::from_payload(test_client(invoker.clone()), payload)
    }

    #[test]
    fn test_payload_attributes_round_trip() {
        let invoker = RecordingInvoker::new();
        let job = make_job(&invoker);

        assert_eq!(job.jid(), "jid");
        assert_eq!(job.klass_name(), "Foo");
        assert_eq!(job.queue_name(), "foo");
        assert_eq!(job.data(), r#"{"whiz":"bang"}"#);
        assert_eq!(job.tags(), ["foo"]);
        assert_eq!(job.original_retries(), 3);
        assert_eq!(job.retries_left(), 3);
        assert_eq!(job.priority(), 0);
        assert_eq!(job.worker_name(), "");
        assert_eq!(job.expires_at(), 0.0);
        assert_eq!(job.throttles(), ["throttle", "ql:q:foo"]);
        assert!(job.dependencies().is_empty());
        assert!(job.dependents().is_empty());
        assert!(job.failure().is_none());
        assert_eq!(job.history().len(), 1);
        assert_eq!(job.to_string(), "<Foo jid>");
    }

    #[test]
    fn test_payload_accepts_lists_and_null() {
        let raw = r#"{
            "jid": "a", "klass": "K", "queue": "q", "data": "{}",
            "state": "failed",
            "tags": null,
            "dependencies": ["b"],
            "tracked": 1,
            "failure": {"group": "q-Error", "message": "boom", "when": 1.5, "worker": "w"}
        }"#;
        let payload: JobPayload = serde_json::from_str(raw).unwrap();
        assert!(payload.tags.is_empty());
        assert_eq!(payload.dependencies, ["b"]);
        assert!(payload.tracked);
        assert_eq!(payload.failure.unwrap().group, "q-Error");
    }

    #[tokio::test]
    async fn test_heartbeat_updates_expiry() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"1625072972.0".to_vec())));
        let mut job = make_job(&invoker);

        let expires = job.heartbeat().await.unwrap();
        assert_eq!(expires, 1625072972.0);
        assert_eq!(job.expires_at(), 1625072972.0);

        let calls = invoker.calls();
        assert_eq!(calls[0].0, "heartbeat");
        assert_eq!(
            calls[0].1,
            ["jid", "test-worker", r#"{"whiz":"bang"}"#]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_without_lock_is_lost_lock() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Err(QuillError::Domain(
            "Job jid not currently running".to_string(),
        )));
        let mut job = make_job(&invoker);

        match job.heartbeat().await {
            Err(QuillError::LostLock { jid }) => assert_eq!(jid, "jid"),
            other => panic!("expected LostLock, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_complete_envelope() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"complete".to_vec())));
        let job = make_job(&invoker);

        assert!(job.complete().await.unwrap());
        let calls = invoker.calls();
        assert_eq!(calls[0].0, "complete");
        assert_eq!(
            calls[0].1,
            ["jid", "test-worker", "foo", r#"{"whiz":"bang"}"#]
        );
    }

    #[tokio::test]
    async fn test_complete_and_advance_envelope() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"waiting".to_vec())));
        let job = make_job(&invoker);

        assert!(job
            .complete_and_advance("bar", 10, &["other".to_string()])
            .await
            .unwrap());
        let calls = invoker.calls();
        assert_eq!(
            calls[0].1,
            [
                "jid",
                "test-worker",
                "foo",
                r#"{"whiz":"bang"}"#,
                "next",
                "bar",
                "delay",
                "10",
                "depends",
                r#"["other"]"#
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_with_group_and_message() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::Int(2)));
        let job = make_job(&invoker);

        let remaining = job.retry(5, Some("foo-Transient"), Some("flaky")).await.unwrap();
        assert_eq!(remaining, 2);
        let calls = invoker.calls();
        assert_eq!(
            calls[0].1,
            ["jid", "foo", "", "5", "foo-Transient", "flaky"]
        );
    }

    #[tokio::test]
    async fn test_move_envelope_carries_throttles() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"jid".to_vec())));
        let job = make_job(&invoker);

        job.move_to("bar", 0, &[]).await.unwrap();
        let calls = invoker.calls();
        assert_eq!(calls[0].0, "put");
        assert_eq!(
            calls[0].1,
            [
                "",
                "bar",
                "jid",
                "Foo",
                r#"{"whiz":"bang"}"#,
                "0",
                "depends",
                "[]",
                "throttles",
                r#"["throttle","ql:q:foo"]"#
            ]
        );
    }

    #[tokio::test]
    async fn test_process_unregistered_klass_fails_job() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"jid".to_vec())));
        let mut job = make_job(&invoker);

        job.process().await.unwrap();
        let calls = invoker.calls();
        assert_eq!(calls[0].0, "fail");
        assert_eq!(calls[0].1[2], "foo-klass-not-found");
    }

    #[tokio::test]
    async fn test_process_missing_handler_fails_job() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"jid".to_vec())));

        let registry = crate::registry::ProcessorRegistry::new();
        registry.register(
            "Foo",
            Processor::builder().on_queue("bar", |_job| async { Ok(()) }).build(),
        );
        let client = test_client_with_registry(invoker.clone(), registry);
        let payload: JobPayload = serde_json::from_str(&payload_json("running")).unwrap();
        let mut job = Job::from_payload(client, payload);

        job.process().await.unwrap();
        let calls = invoker.calls();
        assert_eq!(calls[0].0, "fail");
        assert_eq!(calls[0].1[2], "foo-method-missing");
    }

    #[tokio::test]
    async fn test_process_handler_error_fails_with_kind_group() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"jid".to_vec())));

        let registry = crate::registry::ProcessorRegistry::new();
        registry.register(
            "Foo",
            Processor::builder()
                .process(|_job| async { Err(ProcessingError::new("ValueError", "bad data")) })
                .build(),
        );
        let client = test_client_with_registry(invoker.clone(), registry);
        let payload: JobPayload = serde_json::from_str(&payload_json("running")).unwrap();
        let mut job = Job::from_payload(client, payload);

        job.process().await.unwrap();
        let calls = invoker.calls();
        assert_eq!(calls[0].0, "fail");
        assert_eq!(calls[0].1[2], "foo-ValueError");
        assert_eq!(calls[0].1[3], "bad data");
    }

    #[tokio::test]
    async fn test_process_success_does_not_fail() {
        let invoker = RecordingInvoker::new();

        let registry = crate::registry::ProcessorRegistry::new();
        registry.register(
            "Foo",
            Processor::builder().process(|_job| async { Ok(()) }).build(),
        );
        let client = test_client_with_registry(invoker.clone(), registry);
        let payload: JobPayload = serde_json::from_str(&payload_json("running")).unwrap();
        let mut job = Job::from_payload(client, payload);

        job.process().await.unwrap();
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_setters_issue_updates() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::Int(1)));
        invoker.push_reply(Ok(Value::Int(1)));

        let payload: RecurringJobPayload = serde_json::from_str(
            r#"{"jid": "rjid", "klass": "Foo", "queue": "foo", "data": "{}",
                "priority": 0, "tags": {}, "retries": 5, "interval": 60, "count": 2}"#,
        )
        .unwrap();
        let mut recurring = RecurringJob::from_payload(test_client(invoker.clone()), payload);
        assert_eq!(recurring.interval(), 60);
        assert_eq!(recurring.count(), 2);

        recurring.set_interval(120).await.unwrap();
        recurring.set_retries(3).await.unwrap();
        assert_eq!(recurring.interval(), 120);

        let calls = invoker.calls();
        assert_eq!(calls[0].0, "recur.update");
        assert_eq!(calls[0].1, ["rjid", "interval", "120"]);
        assert_eq!(calls[1].1, ["rjid", "retries", "3"]);
    }

    #[tokio::test]
    async fn test_recurring_cancel_unrecurs() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::Int(1)));

        let payload: RecurringJobPayload = serde_json::from_str(
            r#"{"jid": "rjid", "klass": "Foo", "queue": "foo", "data": "{}",
                "retries": 5, "interval": 60, "count": 0}"#,
        )
        .unwrap();
        let recurring = RecurringJob::from_payload(test_client(invoker.clone()), payload);

        assert_eq!(recurring.cancel().await.unwrap(), ["rjid"]);
        assert_eq!(invoker.calls()[0].0, "unrecur");
    }
}
