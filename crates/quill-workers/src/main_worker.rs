//! A serial worker meant to own the process.
//!
//! Registers process signals before running, and unlike `SerialWorker` its
//! halt hook really does interrupt the job in flight: each job runs in its
//! own task whose abort handle the listener can fire. This asymmetry with
//! the plain serial worker is deliberate.

use crate::base::{HaltFn, JobFeed, NextJob, QueueSelection, WorkerCore, WorkerOptions};
use crate::sandbox::Sandbox;
use crate::signals::spawn_worker_signals;
use parking_lot::Mutex;
use quill_client::{Client, Job, QuillResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// The jid being processed and the handle that can abort it.
type CurrentJob = Arc<Mutex<Option<(String, AbortHandle)>>>;

pub struct MainWorker {
    core: WorkerCore,
    sandbox: PathBuf,
    current: CurrentJob,
}

impl MainWorker {
    pub async fn new(
        client: Client,
        queues: QueueSelection,
        options: WorkerOptions,
    ) -> QuillResult<Self> {
        let sandbox = options.sandbox_root.clone();
        Ok(Self {
            core: WorkerCore::new(client, queues, &options).await?,
            sandbox,
            current: Arc::new(Mutex::new(None)),
        })
    }

    pub fn core(&self) -> &WorkerCore {
        &self.core
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    /// Abort the in-flight job when its lock was revoked.
    fn halt(&self) -> HaltFn {
        let current = self.current.clone();
        Arc::new(move |jid| {
            let guard = current.lock();
            if let Some((current_jid, handle)) = guard.as_ref() {
                if current_jid == jid {
                    warn!(jid = %jid, "Halting in-flight job; lock is gone");
                    handle.abort();
                }
            }
        })
    }

    pub async fn run(&mut self) -> QuillResult<()> {
        let core_for_quit = self.core.shutdown_flag();
        let current_for_dump = self.current.clone();
        let signals = spawn_worker_signals(
            Arc::new(move || {
                core_for_quit.store(true, std::sync::atomic::Ordering::SeqCst)
            }),
            Arc::new(move || {
                match current_for_dump.lock().as_ref() {
                    Some((jid, _)) => format!("working on {}", jid),
                    None => "idle".to_string(),
                }
            }),
        )?;

        let listener = self.core.start_ownership_listener(self.halt()).await?;
        let feed = self.core.take_feed();
        let result = self.dispatch(feed).await;
        listener.stop().await;
        signals.abort();
        result
    }

    async fn dispatch(&mut self, mut feed: JobFeed) -> QuillResult<()> {
        loop {
            match feed.next().await? {
                NextJob::Idle => {
                    debug!(interval = ?self.core.interval(), "Sleeping");
                    tokio::time::sleep(self.core.interval()).await;
                }
                NextJob::Job(job) => {
                    if let Err(err) = self.process_one(*job).await {
                        return Err(err);
                    }
                }
            }
            if self.core.is_shutdown() {
                break;
            }
        }
        Ok(())
    }

    async fn process_one(&mut self, mut job: Job) -> QuillResult<()> {
        let jid = job.jid().to_string();
        info!(jid = %jid, klass = %job.klass_name(), "Working on job");

        let sandbox = self.sandbox.clone();
        let task = tokio::spawn(async move {
            let guard = Sandbox::enter(&sandbox)?;
            job.set_sandbox(&sandbox);
            let result = job.process().await;
            drop(guard);
            result
        });
        *self.current.lock() = Some((jid.clone(), task.abort_handle()));

        let outcome = task.await;
        *self.current.lock() = None;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.is_transport() => Err(err),
            Ok(Err(err)) => {
                warn!(jid = %jid, error = %err, "Job processing errored");
                Ok(())
            }
            Err(join_err) if join_err.is_cancelled() => {
                info!(jid = %jid, "Job halted");
                Ok(())
            }
            Err(join_err) => {
                warn!(jid = %jid, error = %join_err, "Job task panicked");
                Ok(())
            }
        }
    }
}
