//! Server-side configuration options.
//!
//! A thin wrapper over `config.get` / `config.set` / `config.unset`. Option
//! values are stored as strings server-side; `all` returns whatever JSON the
//! script serves.

use crate::client::Client;
use crate::error::QuillResult;
use std::collections::HashMap;

/// The options the server recognizes.
pub mod options {
    /// Namespace tag used in stats and process titles.
    pub const APPLICATION: &str = "application";
    /// Default job lock duration in seconds. Queue-specific override:
    /// `<queue>-heartbeat`.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Extra lock seconds after expiration before reassignment.
    pub const GRACE_PERIOD: &str = "grace-period";
    /// Completed-job retention in seconds.
    pub const JOBS_HISTORY: &str = "jobs-history";
    /// Completed-job retention by count.
    pub const JOBS_HISTORY_COUNT: &str = "jobs-history-count";
    /// Per-job history cap.
    pub const MAX_JOB_HISTORY: &str = "max-job-history";
    /// Server-side pop retry cap.
    pub const MAX_POP_RETRY: &str = "max-pop-retry";
    /// Worker record TTL in seconds.
    pub const MAX_WORKER_AGE: &str = "max-worker-age";
}

/// Configuration accessor.
pub struct Config {
    client: Client,
}

impl Config {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Every option the server currently has set.
    pub async fn all(&self) -> QuillResult<HashMap<String, serde_json::Value>> {
        let raw: String = self.client.call("config.get", vec![]).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// One option, as the raw string the server stores.
    pub async fn get(&self, option: &str) -> QuillResult<Option<String>> {
        self.client
            .call("config.get", vec![option.to_string()])
            .await
    }

    pub async fn set(&self, option: &str, value: impl ToString) -> QuillResult<()> {
        self.client
            .call_value(
                "config.set",
                vec![option.to_string(), value.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn unset(&self, option: &str) -> QuillResult<()> {
        self.client
            .call_value("config.unset", vec![option.to_string()])
            .await?;
        Ok(())
    }

    /// Unset every option.
    pub async fn clear(&self) -> QuillResult<()> {
        for option in self.all().await?.keys() {
            self.unset(option).await?;
        }
        Ok(())
    }

    /// Set several options at once.
    pub async fn update(
        &self,
        options: impl IntoIterator<Item = (String, String)>,
    ) -> QuillResult<()> {
        for (option, value) in options {
            self.set(&option, value).await?;
        }
        Ok(())
    }
}
