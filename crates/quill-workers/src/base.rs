//! Shared worker machinery.
//!
//! Every worker variant is built around the same core: a resolver deciding
//! which queues to pop from, a resumable-job list handed out before any new
//! work, a shutdown flag honored between jobs, and a pub/sub listener on the
//! worker's own channel that reports ownership loss.

use quill_client::listener::Listener;
use quill_client::resolver::{QueueResolver, TransformingQueueResolver};
use quill_client::{Client, Job, QuillError, QuillResult};
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// How a worker picks up jobs it already owned before starting.
#[derive(Default)]
pub enum ResumeMode {
    /// Start fresh.
    #[default]
    No,
    /// Ask the server which jobs are still registered to this worker name.
    Auto,
    /// Resume exactly these jobs.
    Jobs(Vec<Job>),
}

/// The queues a worker consumes from: a static name list or a resolver.
pub enum QueueSelection {
    Names(Vec<String>),
    Resolver(Arc<dyn QueueResolver>),
}

impl QueueSelection {
    fn into_resolver(self) -> Arc<dyn QueueResolver> {
        match self {
            QueueSelection::Names(names) => Arc::new(TransformingQueueResolver::new(names)),
            QueueSelection::Resolver(resolver) => resolver,
        }
    }
}

/// Options shared by every worker variant.
pub struct WorkerOptions {
    /// How long to sleep after a barren pass over the queues.
    pub interval: Duration,
    pub resume: ResumeMode,
    /// Directory jobs run in. Variants with several slots create
    /// subdirectories beneath it.
    pub sandbox_root: PathBuf,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            resume: ResumeMode::No,
            sandbox_root: PathBuf::from("quill-workers"),
        }
    }
}

/// Hook invoked by the ownership listener with a jid whose lock is gone.
pub type HaltFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Common state for every worker variant.
pub struct WorkerCore {
    client: Client,
    resolver: Arc<dyn QueueResolver>,
    interval: Duration,
    resume: Vec<Job>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerCore {
    pub async fn new(
        client: Client,
        queues: QueueSelection,
        options: &WorkerOptions,
    ) -> QuillResult<Self> {
        let resolver = queues.into_resolver();
        let resume = match &options.resume {
            ResumeMode::No => Vec::new(),
            ResumeMode::Jobs(jobs) => jobs.clone(),
            ResumeMode::Auto => resumable(&client, resolver.as_ref()).await?,
        };
        Ok(Self {
            client,
            resolver,
            interval: options.interval,
            resume,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn resolver(&self) -> &Arc<dyn QueueResolver> {
        &self.resolver
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The jobs this worker will try to resume, in order.
    pub fn resume_jobs(&self) -> &[Job] {
        &self.resume
    }

    /// Mark for shutdown; run loops observe this between jobs, never
    /// mid-job.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Build the job feed, consuming the resume list.
    pub fn take_feed(&mut self) -> JobFeed {
        JobFeed {
            client: self.client.clone(),
            resolver: self.resolver.clone(),
            resume: std::mem::take(&mut self.resume).into(),
            pending: VecDeque::new(),
        }
    }

    /// Subscribe to this worker's channel and route ownership-loss events
    /// to `halt`. Returns only once the subscription is live.
    pub async fn start_ownership_listener(
        &self,
        halt: HaltFn,
    ) -> QuillResult<OwnershipListener> {
        OwnershipListener::start(&self.client, halt).await
    }
}

/// Jobs currently registered to this worker name whose queue is still in
/// the resolver output.
pub async fn resumable(client: &Client, resolver: &dyn QueueResolver) -> QuillResult<Vec<Job>> {
    let info = client.workers().info(client.worker_name()).await?;
    let jobs = client.jobs().multiget(&info.jobs).await?;
    let queue_names: HashSet<String> = resolver.resolve().await?.into_iter().collect();
    Ok(jobs
        .into_iter()
        .filter(|job| queue_names.contains(job.queue_name()))
        .collect())
}

/// What the feed produced.
pub enum NextJob {
    Job(Box<Job>),
    /// A full pass over every resolved queue produced nothing; the caller
    /// should sleep.
    Idle,
}

/// The lazy job sequence: resume jobs that still heartbeat, then endless
/// rounds over the resolved queues popping one job per queue.
pub struct JobFeed {
    client: Client,
    resolver: Arc<dyn QueueResolver>,
    resume: VecDeque<Job>,
    pending: VecDeque<Job>,
}

impl JobFeed {
    pub async fn next(&mut self) -> QuillResult<NextJob> {
        // Hand out resumable work first, if we can still heartbeat it. A
        // lost lock just drops the job.
        while let Some(mut job) = self.resume.pop_front() {
            match job.heartbeat().await {
                Ok(_) => return Ok(NextJob::Job(Box::new(job))),
                Err(QuillError::LostLock { jid }) => {
                    warn!(jid = %jid, "Cannot resume job; lock is gone");
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(job) = self.pending.pop_front() {
            return Ok(NextJob::Job(Box::new(job)));
        }

        for queue_name in self.resolver.resolve().await? {
            if let Some(job) = self.client.queue(queue_name).pop().await? {
                self.pending.push_back(job);
            }
        }
        match self.pending.pop_front() {
            Some(job) => Ok(NextJob::Job(Box::new(job))),
            None => Ok(NextJob::Idle),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkerEvent {
    event: String,
    jid: String,
}

/// Parse a worker-channel message; returns the jid when the event revokes
/// our ownership of it.
pub(crate) fn ownership_lost_jid(data: &str) -> Option<String> {
    match serde_json::from_str::<WorkerEvent>(data) {
        Ok(event) if matches!(event.event.as_str(), "canceled" | "lock_lost" | "put") => {
            Some(event.jid)
        }
        Ok(_) => None,
        Err(err) => {
            error!(error = %err, "Unparseable worker event");
            None
        }
    }
}

/// Background listener on `ql:w:<worker_name>`.
pub struct OwnershipListener {
    listener: Arc<Listener>,
    join: JoinHandle<()>,
}

impl OwnershipListener {
    pub async fn start(client: &Client, halt: HaltFn) -> QuillResult<Self> {
        let channel = format!("ql:w:{}", client.worker_name());
        let listener = Arc::new(Listener::new(
            client.redis_client().clone(),
            vec![channel],
        ));

        let listen_task = listener.clone();
        let join = tokio::spawn(async move {
            let result = listen_task
                .listen(move |message| {
                    if let Some(jid) = ownership_lost_jid(&message.data) {
                        halt(&jid);
                    }
                })
                .await;
            if let Err(err) = result {
                error!(error = %err, "Ownership listener failed");
            }
        });

        if !listener.wait_until_listening().await {
            let _ = join.await;
            return Err(QuillError::Worker(
                "ownership listener failed to subscribe".to_string(),
            ));
        }
        Ok(Self { listener, join })
    }

    /// Unsubscribe and join the listen task.
    pub async fn stop(self) {
        self.listener.unlisten();
        let _ = self.join.await;
    }
}

/// Sandbox path for one slot of a multi-slot worker.
pub(crate) fn slot_sandbox(root: &std::path::Path, prefix: &str, index: usize) -> PathBuf {
    root.join(format!("{}-{}", prefix, index))
}
