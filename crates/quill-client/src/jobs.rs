//! Lazy access to jobs and job information.

use crate::client::Client;
use crate::error::QuillResult;
use crate::job::{Job, JobPayload, RecurringJob, RecurringJobPayload, WorkUnit};
use serde::Deserialize;
use std::collections::HashMap;

/// Jobs currently being tracked.
pub struct TrackedJobs {
    pub jobs: Vec<Job>,
    /// Tracked jids whose jobs no longer exist.
    pub expired: Vec<String>,
}

/// One page of jids carrying a tag.
#[derive(Debug, Clone, Deserialize)]
pub struct TaggedJids {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FailedPage {
    #[serde(default)]
    total: i64,
    #[serde(default, deserialize_with = "crate::job::list_or_table")]
    jobs: Vec<String>,
}

/// One page of jobs in a failure group.
pub struct FailedJobs {
    pub total: i64,
    pub jobs: Vec<Job>,
}

/// Accessor for jobs by jid, tag, or failure group.
pub struct Jobs {
    client: Client,
}

impl Jobs {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Paginated jids of complete jobs.
    pub async fn complete(&self, offset: usize, count: usize) -> QuillResult<Vec<String>> {
        self.client
            .call(
                "jobs",
                vec![
                    "complete".to_string(),
                    offset.to_string(),
                    count.to_string(),
                ],
            )
            .await
    }

    /// Every job currently tracked.
    pub async fn tracked(&self) -> QuillResult<TrackedJobs> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default, deserialize_with = "crate::job::payloads_or_table")]
            jobs: Vec<JobPayload>,
            #[serde(default, deserialize_with = "crate::job::list_or_table")]
            expired: Vec<String>,
        }

        let raw: String = self.client.call("track", vec![]).await?;
        let parsed: Raw = serde_json::from_str(&raw)?;
        Ok(TrackedJobs {
            jobs: parsed
                .jobs
                .into_iter()
                .map(|payload| Job::from_payload(self.client.clone(), payload))
                .collect(),
            expired: parsed.expired,
        })
    }

    /// Paginated jids of jobs carrying a tag.
    pub async fn tagged(
        &self,
        tag: &str,
        offset: usize,
        count: usize,
    ) -> QuillResult<TaggedJids> {
        let raw: String = self
            .client
            .call(
                "tag",
                vec![
                    "get".to_string(),
                    tag.to_string(),
                    offset.to_string(),
                    count.to_string(),
                ],
            )
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Counts of known failure groups.
    pub async fn failed(&self) -> QuillResult<HashMap<String, i64>> {
        let raw: String = self.client.call("failed", vec![]).await?;
        // No failures encodes as `{}` already, so this parses either way.
        Ok(serde_json::from_str(&raw)?)
    }

    /// One page of jobs in a failure group, hydrated.
    pub async fn failed_for(
        &self,
        group: &str,
        start: usize,
        limit: usize,
    ) -> QuillResult<FailedJobs> {
        let raw: String = self
            .client
            .call(
                "failed",
                vec![group.to_string(), start.to_string(), limit.to_string()],
            )
            .await?;
        let page: FailedPage = serde_json::from_str(&raw)?;
        let jobs = self.multiget(&page.jobs).await?;
        Ok(FailedJobs {
            total: page.total,
            jobs,
        })
    }

    /// Job objects for every jid that still exists.
    pub async fn multiget(&self, jids: &[String]) -> QuillResult<Vec<Job>> {
        if jids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: String = self.client.call("multiget", jids.to_vec()).await?;
        let payloads: Vec<JobPayload> = serde_json::from_str(&raw)?;
        Ok(payloads
            .into_iter()
            .map(|payload| Job::from_payload(self.client.clone(), payload))
            .collect())
    }

    /// The job for a jid, regular or recurring, if it exists.
    pub async fn find(&self, jid: &str) -> QuillResult<Option<WorkUnit>> {
        let raw: Option<String> = self.client.call("get", vec![jid.to_string()]).await?;
        if let Some(raw) = raw {
            let payload: JobPayload = serde_json::from_str(&raw)?;
            return Ok(Some(WorkUnit::Job(Box::new(Job::from_payload(
                self.client.clone(),
                payload,
            )))));
        }

        let raw: Option<String> = self
            .client
            .call("recur.get", vec![jid.to_string()])
            .await?;
        match raw {
            Some(raw) => {
                let payload: RecurringJobPayload = serde_json::from_str(&raw)?;
                Ok(Some(WorkUnit::Recurring(Box::new(
                    RecurringJob::from_payload(self.client.clone(), payload),
                ))))
            }
            None => Ok(None),
        }
    }
}
