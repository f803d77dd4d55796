//! The client handle.
//!
//! `Client` is a cheap-clone bundle of the script invoker, the raw redis
//! client (pub/sub), the clock, and the processor registry. Entity objects
//! hold a `Client` and construct the accessors they need on demand, so no
//! back-references are stored anywhere.

use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::Config;
use crate::error::{QuillError, QuillResult};
use crate::events::Events;
use crate::jobs::Jobs;
use crate::patterns::{PatternSource, QueuePatterns};
use crate::queue::Queue;
use crate::queues::Queues;
use crate::registry::ProcessorRegistry;
use crate::script::{create_pool, ScriptClient, ScriptInvoker};
use crate::throttle::Throttle;
use crate::workers::Workers;
use redis::{FromRedisValue, Value};
use std::sync::Arc;

/// Nil, integer zero and false are the script's ways of declining without
/// raising.
pub(crate) fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Int(0) | Value::Boolean(false))
}

/// Parse a JSON-encoded list of strings, tolerating the script's empty-table
/// encoding (`{}`).
pub(crate) fn string_list_from_json(raw: &str) -> QuillResult<Vec<String>> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            })
            .collect(),
        serde_json::Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        serde_json::Value::Null => Ok(Vec::new()),
        other => Err(QuillError::Configuration(format!(
            "expected a JSON list, got {}",
            other
        ))),
    }
}

struct ClientInner {
    invoker: Arc<dyn ScriptInvoker>,
    redis: redis::Client,
    clock: SharedClock,
    registry: Arc<ProcessorRegistry>,
    worker_name: String,
}

/// Handle to one queue server.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Assemble a client from parts. Tests use this to substitute a scripted
    /// invoker or a frozen clock.
    pub fn from_parts(
        invoker: Arc<dyn ScriptInvoker>,
        redis: redis::Client,
        clock: SharedClock,
        registry: Arc<ProcessorRegistry>,
        worker_name: String,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                invoker,
                redis,
                clock,
                registry,
                worker_name,
            }),
        }
    }

    /// This client's identity as a worker.
    pub fn worker_name(&self) -> &str {
        &self.inner.worker_name
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.inner.registry
    }

    /// The raw redis client, used for pub/sub subscriptions.
    pub fn redis_client(&self) -> &redis::Client {
        &self.inner.redis
    }

    pub(crate) fn invoker(&self) -> &Arc<dyn ScriptInvoker> {
        &self.inner.invoker
    }

    /// Invoke the script, returning the raw reply.
    pub async fn call_value(&self, command: &str, args: Vec<String>) -> QuillResult<Value> {
        self.inner.invoker.invoke(command, args).await
    }

    /// Invoke the script and decode the reply.
    pub async fn call<T: FromRedisValue>(
        &self,
        command: &str,
        args: Vec<String>,
    ) -> QuillResult<T> {
        let value = self.call_value(command, args).await?;
        Ok(redis::from_redis_value(&value)?)
    }

    /// A queue by name. Queues are cheap, stateless handles.
    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue::new(name.into(), self.clone())
    }

    pub fn jobs(&self) -> Jobs {
        Jobs::new(self.clone())
    }

    pub fn queues(&self) -> Queues {
        Queues::new(self.clone())
    }

    pub fn workers(&self) -> Workers {
        Workers::new(self.clone())
    }

    pub fn throttle(&self, name: impl Into<String>) -> Throttle {
        Throttle::new(name.into(), self.clone())
    }

    pub fn config(&self) -> Config {
        Config::new(self.clone())
    }

    /// Pattern storage using the script-side encoding.
    pub fn queue_patterns(&self) -> QueuePatterns {
        QueuePatterns::new(self.clone(), PatternSource::Script)
    }

    /// Pattern storage with an explicit encoding.
    pub fn queue_patterns_with(&self, source: PatternSource) -> QueuePatterns {
        QueuePatterns::new(self.clone(), source)
    }

    /// Server-wide event stream.
    pub fn events(&self) -> Events {
        Events::new(self.inner.redis.clone())
    }

    /// Begin tracking a jid.
    pub async fn track(&self, jid: &str) -> QuillResult<bool> {
        let flagged: i64 = self
            .call("track", vec!["track".to_string(), jid.to_string()])
            .await?;
        Ok(flagged == 1)
    }

    /// Stop tracking a jid.
    pub async fn untrack(&self, jid: &str) -> QuillResult<bool> {
        let flagged: i64 = self
            .call("track", vec!["untrack".to_string(), jid.to_string()])
            .await?;
        Ok(flagged == 1)
    }

    /// The most common tags among jobs.
    pub async fn tags(&self, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        let raw: String = self
            .call(
                "tag",
                vec!["top".to_string(), offset.to_string(), count.to_string()],
            )
            .await?;
        string_list_from_json(&raw)
    }

    /// Move up to `count` jobs out of a failure group back into `queue`.
    pub async fn unfail(&self, group: &str, queue: &str, count: usize) -> QuillResult<i64> {
        self.call(
            "unfail",
            vec![queue.to_string(), group.to_string(), count.to_string()],
        )
        .await
    }
}

fn default_worker_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    url: String,
    pool_size: usize,
    script_source: Option<String>,
    worker_name: Option<String>,
    clock: SharedClock,
    registry: Arc<ProcessorRegistry>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            script_source: None,
            worker_name: None,
            clock: Arc::new(SystemClock),
            registry: Arc::new(ProcessorRegistry::new()),
        }
    }
}

impl ClientBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// The server-side script source. The script is external to this crate;
    /// callers load it from wherever they ship it.
    pub fn script_source(mut self, source: impl Into<String>) -> Self {
        self.script_source = Some(source.into());
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(mut self, registry: Arc<ProcessorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub async fn build(self) -> QuillResult<Client> {
        let source = self.script_source.ok_or_else(|| {
            QuillError::Configuration("script source is required".to_string())
        })?;
        let pool = create_pool(&self.url, self.pool_size).await?;
        let redis = redis::Client::open(self.url.as_str())?;
        let invoker = Arc::new(ScriptClient::new(pool, &source, self.clock.clone()));
        Ok(Client::from_parts(
            invoker,
            redis,
            self.clock,
            self.registry,
            self.worker_name.unwrap_or_else(default_worker_name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_client, RecordingInvoker};

    #[test]
    fn test_truthy() {
        assert!(!truthy(&Value::Nil));
        assert!(!truthy(&Value::Int(0)));
        assert!(!truthy(&Value::Boolean(false)));
        assert!(truthy(&Value::Int(1)));
        assert!(truthy(&Value::BulkString(b"waiting".to_vec())));
    }

    #[test]
    fn test_string_list_from_json() {
        assert_eq!(
            string_list_from_json(r#"["a", "b"]"#).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(string_list_from_json("{}").unwrap().is_empty());
        assert!(string_list_from_json("null").unwrap().is_empty());
        assert!(string_list_from_json("7").is_err());
    }

    #[tokio::test]
    async fn test_track_envelope() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::Int(1)));
        let client = test_client(invoker.clone());

        assert!(client.track("jid").await.unwrap());
        let calls = invoker.calls();
        assert_eq!(calls[0].0, "track");
        assert_eq!(calls[0].1, ["track", "jid"]);
    }

    #[tokio::test]
    async fn test_unfail_envelope() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::Int(3)));
        let client = test_client(invoker.clone());

        assert_eq!(client.unfail("foo-Error", "foo", 500).await.unwrap(), 3);
        // The envelope stays queue-first regardless of the call order.
        let calls = invoker.calls();
        assert_eq!(calls[0].1, ["foo", "foo-Error", "500"]);
    }
}
