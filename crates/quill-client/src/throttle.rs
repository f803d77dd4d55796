//! Named concurrency throttles.
//!
//! Every queue gets an implicit `ql:q:<name>` throttle; jobs can also name
//! explicit throttles at put time.

use crate::client::Client;
use crate::error::QuillResult;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
struct ThrottleState {
    #[serde(default)]
    maximum: i64,
}

/// A throttle handle: a name and a client.
#[derive(Clone)]
pub struct Throttle {
    name: String,
    client: Client,
}

impl Throttle {
    pub fn new(name: String, client: Client) -> Self {
        Self { name, client }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concurrent-holder cap. Zero means unlimited.
    pub async fn maximum(&self) -> QuillResult<i64> {
        let raw: Option<String> = self
            .client
            .call("throttle.get", vec![self.name.clone()])
            .await?;
        let state = match raw {
            Some(raw) => serde_json::from_str::<ThrottleState>(&raw)?,
            None => ThrottleState::default(),
        };
        Ok(state.maximum)
    }

    /// Set the cap and/or the expiration. Passing no maximum preserves the
    /// current one.
    pub async fn set_maximum(
        &self,
        maximum: Option<i64>,
        expiration: Option<i64>,
    ) -> QuillResult<()> {
        let maximum = match maximum {
            Some(maximum) => maximum,
            None => self.maximum().await?,
        };
        self.client
            .call_value(
                "throttle.set",
                vec![
                    self.name.clone(),
                    maximum.to_string(),
                    expiration.unwrap_or(0).to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Jids currently holding the throttle.
    pub async fn locks(&self) -> QuillResult<Vec<String>> {
        self.client
            .call("throttle.locks", vec![self.name.clone()])
            .await
    }

    /// Jids waiting on the throttle.
    pub async fn pending(&self) -> QuillResult<Vec<String>> {
        self.client
            .call("throttle.pending", vec![self.name.clone()])
            .await
    }

    pub async fn ttl(&self) -> QuillResult<i64> {
        self.client
            .call("throttle.ttl", vec![self.name.clone()])
            .await
    }

    pub async fn delete(&self) -> QuillResult<()> {
        self.client
            .call_value("throttle.delete", vec![self.name.clone()])
            .await?;
        Ok(())
    }
}
