//! A worker that processes jobs concurrently in one process.
//!
//! Up to `pool_size` jobs run at once as tasks; each rents one sandbox from
//! a fixed ring for the duration of its run. The ownership listener aborts
//! the task for a revoked jid; aborts, errors, and normal completion all
//! release the sandbox and the pool slot through drop guards.

use crate::base::{
    slot_sandbox, HaltFn, JobFeed, NextJob, QueueSelection, WorkerCore, WorkerOptions,
};
use crate::sandbox::Sandbox;
use crate::signals::spawn_worker_signals;
use parking_lot::Mutex;
use quill_client::{Client, QuillError, QuillResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

/// Options specific to the pooled worker.
pub struct PooledOptions {
    /// Maximum jobs in flight at once.
    pub pool_size: usize,
}

impl Default for PooledOptions {
    fn default() -> Self {
        Self { pool_size: 10 }
    }
}

type TaskMap = Arc<Mutex<HashMap<String, AbortHandle>>>;
type SandboxRing = Arc<Mutex<Vec<PathBuf>>>;

/// Returns the rented sandbox to the ring, whatever way the task ended.
struct SandboxLease {
    path: PathBuf,
    ring: SandboxRing,
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        self.ring.lock().push(std::mem::take(&mut self.path));
    }
}

/// Removes the jid from the in-flight map, whatever way the task ended.
struct InFlight {
    jid: String,
    tasks: TaskMap,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.tasks.lock().remove(&self.jid);
    }
}

pub struct PooledWorker {
    core: WorkerCore,
    pool_size: usize,
    tasks: TaskMap,
    sandboxes: SandboxRing,
}

impl PooledWorker {
    pub async fn new(
        client: Client,
        queues: QueueSelection,
        options: WorkerOptions,
        pooled: PooledOptions,
    ) -> QuillResult<Self> {
        let sandboxes = (0..pooled.pool_size)
            .map(|index| slot_sandbox(&options.sandbox_root, "pool", index))
            .collect();
        Ok(Self {
            core: WorkerCore::new(client, queues, &options).await?,
            pool_size: pooled.pool_size,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            sandboxes: Arc::new(Mutex::new(sandboxes)),
        })
    }

    pub fn core(&self) -> &WorkerCore {
        &self.core
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    /// Jids currently in flight.
    pub fn in_flight(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Abort the task processing `jid`; unknown jids (already finished) are
    /// ignored.
    fn halt(&self) -> HaltFn {
        let tasks = self.tasks.clone();
        Arc::new(move |jid| {
            if let Some(handle) = tasks.lock().get(jid) {
                warn!(jid = %jid, "Lost ownership; aborting job task");
                handle.abort();
            }
        })
    }

    pub async fn run(&mut self) -> QuillResult<()> {
        let quit_flag = self.core.shutdown_flag();
        let tasks_for_dump = self.tasks.clone();
        let signals = spawn_worker_signals(
            Arc::new(move || quit_flag.store(true, std::sync::atomic::Ordering::SeqCst)),
            Arc::new(move || {
                let jids: Vec<String> = tasks_for_dump.lock().keys().cloned().collect();
                format!("in flight: {}", jids.join(", "))
            }),
        )?;

        let listener = self.core.start_ownership_listener(self.halt()).await?;
        let feed = self.core.take_feed();
        let mut join_set = JoinSet::new();
        let result = self.dispatch(feed, &mut join_set).await;

        info!(outstanding = join_set.len(), "Waiting for in-flight jobs");
        while let Some(outcome) = join_set.join_next().await {
            if let Err(join_err) = outcome {
                if join_err.is_cancelled() {
                    info!("Job task halted during shutdown");
                } else {
                    warn!(error = %join_err, "Job task panicked");
                }
            }
        }

        listener.stop().await;
        signals.abort();
        result
    }

    async fn dispatch(
        &mut self,
        mut feed: JobFeed,
        join_set: &mut JoinSet<()>,
    ) -> QuillResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        loop {
            if self.core.is_shutdown() {
                return Ok(());
            }

            // A free permit implies a free sandbox in the ring.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| QuillError::Worker("worker pool closed".to_string()))?;
            while join_set.try_join_next().is_some() {}

            match feed.next().await? {
                NextJob::Idle => {
                    drop(permit);
                    debug!(interval = ?self.core.interval(), "Sleeping");
                    tokio::time::sleep(self.core.interval()).await;
                }
                NextJob::Job(job) => {
                    let mut job = *job;
                    let jid = job.jid().to_string();
                    // Warm the registry before the task runs, so factory
                    // rebuilds happen here rather than racing in-pool.
                    let _ = self.core.client().registry().lookup(job.klass_name());

                    let path = self.sandboxes.lock().pop().ok_or_else(|| {
                        QuillError::Worker("sandbox ring exhausted".to_string())
                    })?;
                    let lease = SandboxLease {
                        path,
                        ring: self.sandboxes.clone(),
                    };
                    let in_flight = InFlight {
                        jid: jid.clone(),
                        tasks: self.tasks.clone(),
                    };

                    info!(jid = %jid, klass = %job.klass_name(), "Working on job");
                    let handle = join_set.spawn(async move {
                        let _permit = permit;
                        let _in_flight = in_flight;
                        match Sandbox::enter(&lease.path) {
                            Ok(guard) => {
                                job.set_sandbox(&lease.path);
                                if let Err(err) = job.process().await {
                                    warn!(jid = %job.jid(), error = %err, "Job processing errored");
                                }
                                drop(guard);
                            }
                            Err(err) => {
                                warn!(jid = %job.jid(), error = %err, "Failed to enter sandbox");
                            }
                        }
                        drop(lease);
                    });
                    self.tasks.lock().insert(jid, handle);
                }
            }
        }
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
    async fn test_pool_processes_resumed_jobs_concurrently() {
        let invoker = RecordingInvoker::new();
        // Two resume heartbeats, then one barren pass over "foo" before the
        // shutdown flag is observed.
        invoker.push_reply(Ok(Value::BulkString(b"1625073032.0".to_vec())));
        invoker.push_reply(Ok(Value::BulkString(b"1625073032.0".to_vec())));
        invoker.push_reply(Ok(Value::BulkString(b"{}".to_vec())));

        let registry = ProcessorRegistry::new();
        let client = test_client_with_registry(invoker.clone(), registry);

        let jobs: Vec<Job> = ["a", "b"]
            .iter()
            .map(|jid| {
                let payload = serde_json::from_str(&job_json(jid)).unwrap();
                Job::from_payload(client.clone(), payload)
            })
            .collect();

        let root = std::env::temp_dir().join(format!(
            "quill-pooled-test-{}",
            std::process::id()
        ));
        let mut worker = PooledWorker::new(
            client.clone(),
            QueueSelection::Names(vec!["foo".to_string()]),
            WorkerOptions {
                sandbox_root: root.clone(),
                resume: ResumeMode::Jobs(jobs),
                interval: std::time::Duration::from_millis(10),
            },
            PooledOptions { pool_size: 2 },
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
                        let mut seen = seen.lock();
                        seen.push(job.jid().to_string());
                        if seen.len() == 2 {
                            flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        }
                        Ok(())
                    }
                })
                .build(),
        );

        let feed = worker.core.take_feed();
        let mut join_set = JoinSet::new();
        worker.dispatch(feed, &mut join_set).await.unwrap();
        while join_set.join_next().await.is_some() {}

        let mut jids = processed.lock().clone();
        jids.sort();
        assert_eq!(jids, ["a", "b"]);
        assert!(worker.in_flight().is_empty());
        assert_eq!(worker.sandboxes.lock().len(), 2);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_halt_ignores_unknown_jid() {
        let client =
            test_client_with_registry(RecordingInvoker::new(), ProcessorRegistry::new());
        let worker = PooledWorker::new(
            client,
            QueueSelection::Names(vec!["foo".to_string()]),
            WorkerOptions::default(),
            PooledOptions::default(),
        )
        .await
        .unwrap();

        let halt = worker.halt();
        halt("never-seen");
    }

    #[tokio::test]
    async fn test_halt_aborts_registered_task() {
        let client =
            test_client_with_registry(RecordingInvoker::new(), ProcessorRegistry::new());
        let worker = PooledWorker::new(
            client,
            QueueSelection::Names(vec!["foo".to_string()]),
            WorkerOptions::default(),
            PooledOptions::default(),
        )
        .await
        .unwrap();

        let parked = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        worker
            .tasks
            .lock()
            .insert("a".to_string(), parked.abort_handle());

        let halt = worker.halt();
        halt("a");
        assert!(parked.await.unwrap_err().is_cancelled());
    }
}
