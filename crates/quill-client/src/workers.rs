//! Lazy access to worker information.

use crate::client::Client;
use crate::error::QuillResult;
use serde::Deserialize;

/// Job counts for one registered worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerCounts {
    pub name: String,
    #[serde(default)]
    pub jobs: i64,
    #[serde(default)]
    pub stalled: i64,
}

/// The jids currently registered to one worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerInfo {
    #[serde(default, deserialize_with = "crate::job::list_or_table")]
    pub jobs: Vec<String>,
    #[serde(default, deserialize_with = "crate::job::list_or_table")]
    pub stalled: Vec<String>,
}

/// Accessor for worker records.
pub struct Workers {
    client: Client,
}

impl Workers {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Counts for every worker the server has seen recently.
    pub async fn counts(&self) -> QuillResult<Vec<WorkerCounts>> {
        let raw: String = self.client.call("workers", vec![]).await?;
        match serde_json::from_str::<serde_json::Value>(&raw)? {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| Ok(serde_json::from_value(item)?))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// The jobs a particular worker has running or has stalled.
    pub async fn info(&self, worker_name: &str) -> QuillResult<WorkerInfo> {
        let raw: String = self
            .client
            .call("workers", vec![worker_name.to_string()])
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }
}
