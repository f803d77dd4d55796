//! Lazy access to queues and queue information.

use crate::client::Client;
use crate::error::QuillResult;
use crate::queue::Queue;
use serde::Deserialize;

/// Per-state job counts for one queue, as reported by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueCounts {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub waiting: i64,
    #[serde(default)]
    pub running: i64,
    #[serde(default)]
    pub scheduled: i64,
    #[serde(default)]
    pub stalled: i64,
    #[serde(default)]
    pub depends: i64,
    #[serde(default)]
    pub recurring: i64,
    #[serde(default)]
    pub throttled: i64,
}

/// Accessor for the set of known queues.
pub struct Queues {
    client: Client,
}

impl Queues {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Counts for every queue the server knows. Queue names surfaced here
    /// are the resolver pipeline's notion of "known queues".
    pub async fn counts(&self) -> QuillResult<Vec<QueueCounts>> {
        let raw: String = self.client.call("queues", vec![]).await?;
        // An empty server encodes the empty list as `{}`.
        match serde_json::from_str::<serde_json::Value>(&raw)? {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| Ok(serde_json::from_value(item)?))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// Names of every known queue, in server order.
    pub async fn names(&self) -> QuillResult<Vec<String>> {
        Ok(self
            .counts()
            .await?
            .into_iter()
            .map(|counts| counts.name)
            .collect())
    }

    pub fn get(&self, name: impl Into<String>) -> Queue {
        self.client.queue(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_client, RecordingInvoker};
    use redis::Value;

    #[tokio::test]
    async fn test_counts_parses_list() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(
            br#"[{"name": "foo", "waiting": 2, "paused": false}]"#.to_vec(),
        )));
        let queues = test_client(invoker).queues();

        let counts = queues.counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].name, "foo");
        assert_eq!(counts[0].waiting, 2);
    }

    #[tokio::test]
    async fn test_counts_accepts_empty_table() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"{}".to_vec())));
        let queues = test_client(invoker).queues();

        assert!(queues.counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_names_projection() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(
            br#"[{"name": "a"}, {"name": "b"}]"#.to_vec(),
        )));
        let queues = test_client(invoker).queues();

        assert_eq!(queues.names().await.unwrap(), ["a", "b"]);
    }
}
