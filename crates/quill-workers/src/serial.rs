//! A worker that serially pops and completes jobs.

use crate::base::{HaltFn, JobFeed, NextJob, QueueSelection, WorkerCore, WorkerOptions};
use crate::sandbox::Sandbox;
use parking_lot::Mutex;
use quill_client::{Client, QuillResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One job at a time, in one sandbox directory.
pub struct SerialWorker {
    core: WorkerCore,
    sandbox: PathBuf,
    current_jid: Arc<Mutex<Option<String>>>,
}

impl SerialWorker {
    pub async fn new(
        client: Client,
        queues: QueueSelection,
        options: WorkerOptions,
    ) -> QuillResult<Self> {
        let sandbox = options.sandbox_root.clone();
        Ok(Self {
            core: WorkerCore::new(client, queues, &options).await?,
            sandbox,
            current_jid: Arc::new(Mutex::new(None)),
        })
    }

    pub fn core(&self) -> &WorkerCore {
        &self.core
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    /// The jid being worked on right now, if any.
    pub fn current_jid(&self) -> Option<String> {
        self.current_jid.lock().clone()
    }

    /// The serial worker's halt hook does nothing: the listener runs in a
    /// different task from the processing loop, and yanking work out from
    /// under it is not safe. The job's own heartbeat failing is how the
    /// loss is observed.
    fn halt(&self) -> HaltFn {
        Arc::new(|_jid| {})
    }

    pub async fn run(&mut self) -> QuillResult<()> {
        let listener = self.core.start_ownership_listener(self.halt()).await?;
        let feed = self.core.take_feed();
        let result = self.dispatch(feed).await;
        listener.stop().await;
        result
    }

    async fn dispatch(&mut self, mut feed: JobFeed) -> QuillResult<()> {
        loop {
            match feed.next().await? {
                NextJob::Idle => {
                    *self.current_jid.lock() = None;
                    debug!(interval = ?self.core.interval(), "Sleeping");
                    tokio::time::sleep(self.core.interval()).await;
                }
                NextJob::Job(mut job) => {
                    *self.current_jid.lock() = Some(job.jid().to_string());
                    info!(jid = %job.jid(), klass = %job.klass_name(), "Working on job");
                    let guard = Sandbox::enter(&self.sandbox)?;
                    job.set_sandbox(&self.sandbox);
                    if let Err(err) = job.process().await {
                        if err.is_transport() {
                            return Err(err);
                        }
                        warn!(jid = %job.jid(), error = %err, "Job processing errored");
                    }
                    drop(guard);
                }
            }
            if self.core.is_shutdown() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::ResumeMode;
    use quill_client::registry::Processor;
    use quill_client::test_support::{test_client_with_registry, RecordingInvoker};
    use quill_client::{Job, ProcessorRegistry};
    use redis::Value;

    fn job_json(jid: &str) -> String {
        format!(
            r#"{{"jid": "{jid}", "klass": "K", "queue": "foo", "data": "{{}}",
                 "state": "running", "worker": "test-worker",
                 "expires": 1625072972.0, "retries": 5, "remaining": 5}}"#
        )
    }

    #[tokio::test]
    async fn test_dispatch_processes_resumed_job_and_stops() {
        let invoker = RecordingInvoker::new();
        // Heartbeat for the resumed job, then nothing else matters: the
        // processor stops the worker from inside the handler.
        invoker.push_reply(Ok(Value::BulkString(b"1625073032.0".to_vec())));

        let registry = ProcessorRegistry::new();
        let client = test_client_with_registry(invoker.clone(), registry);

        let payload = serde_json::from_str(&job_json("a")).unwrap();
        let job = Job::from_payload(client.clone(), payload);

        let sandbox = std::env::temp_dir().join(format!(
            "quill-serial-test-{}",
            std::process::id()
        ));
        let mut worker = SerialWorker::new(
            client.clone(),
            QueueSelection::Names(vec!["foo".to_string()]),
            WorkerOptions {
                resume: ResumeMode::Jobs(vec![job]),
                sandbox_root: sandbox.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let processed = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = processed.clone();
        let flag = worker.core().shutdown_flag();
        client.registry().register(
            "K",
            Processor::builder()
                .process(move |job| {
                    let seen = seen.clone();
                    let flag = flag.clone();
                    async move {
                        assert!(job.sandbox().is_some());
                        seen.lock().push(job.jid().to_string());
                        flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build(),
        );

        let feed = worker.core.take_feed();
        worker.dispatch(feed).await.unwrap();
        assert_eq!(processed.lock().clone(), ["a"]);

        let _ = std::fs::remove_dir_all(sandbox);
    }

    #[tokio::test]
    async fn test_dispatch_survives_processing_failure() {
        let invoker = RecordingInvoker::new();
        // Pop returns one job; its processor is unregistered, so process()
        // fails the job (reply below) and the loop carries on to shutdown.
        invoker.push_reply(Ok(Value::BulkString(
            format!("[{}]", job_json("a")).into_bytes(),
        )));
        invoker.push_reply(Ok(Value::BulkString(b"a".to_vec())));

        let client = test_client_with_registry(invoker.clone(), ProcessorRegistry::new());
        let sandbox = std::env::temp_dir().join(format!(
            "quill-serial-fail-test-{}",
            std::process::id()
        ));
        let mut worker = SerialWorker::new(
            client,
            QueueSelection::Names(vec!["foo".to_string()]),
            WorkerOptions {
                sandbox_root: sandbox.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        worker.core.stop();
        let feed = worker.core.take_feed();
        worker.dispatch(feed).await.unwrap();

        let fails: Vec<_> = invoker
            .calls()
            .into_iter()
            .filter(|(command, _)| command == "fail")
            .collect();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].1[2], "foo-klass-not-found");

        let _ = std::fs::remove_dir_all(sandbox);
    }
}
