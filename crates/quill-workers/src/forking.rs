//! A supervisor that runs worker child processes.
//!
//! Each slot gets its own sandbox directory as working directory and an
//! even share of the resumable jobs. Children that die are respawned in the
//! same sandbox until shutdown.

use crate::base::{slot_sandbox, QueueSelection, WorkerCore, WorkerOptions};
use crate::sandbox::{create_clean, divide};
use quill_client::{Client, QuillResult};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Environment variable carrying a child's share of resumable jids,
/// comma-separated.
pub const RESUME_JIDS_ENV: &str = "QUILL_RESUME_JIDS";

/// How long stopped children get before they are killed outright.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

/// Options for the supervisor.
pub struct ForkingOptions {
    /// How many children to run.
    pub worker_count: usize,
    /// The program to spawn; defaults to the current executable.
    pub program: Option<PathBuf>,
    /// Arguments for each child; the supervisor appends `--sandbox <dir>`
    /// per slot.
    pub child_args: Vec<String>,
}

impl Default for ForkingOptions {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
            program: None,
            child_args: Vec::new(),
        }
    }
}

struct ChildSlot {
    sandbox: PathBuf,
    child: Child,
}

enum Tick {
    Signal(i32),
    Exited(usize, std::io::Result<ExitStatus>),
}

pub struct ForkingWorker {
    core: WorkerCore,
    sandbox_root: PathBuf,
    options: ForkingOptions,
    children: Vec<ChildSlot>,
}

impl ForkingWorker {
    pub async fn new(
        client: Client,
        queues: QueueSelection,
        worker_options: WorkerOptions,
        options: ForkingOptions,
    ) -> QuillResult<Self> {
        let sandbox_root = worker_options.sandbox_root.clone();
        Ok(Self {
            core: WorkerCore::new(client, queues, &worker_options).await?,
            sandbox_root,
            options,
            children: Vec::new(),
        })
    }

    pub fn core(&self) -> &WorkerCore {
        &self.core
    }

    fn program(&self) -> QuillResult<PathBuf> {
        match &self.options.program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    fn spawn_child(&self, sandbox: &Path, resume_jids: &[String]) -> QuillResult<Child> {
        create_clean(sandbox)?;
        let mut command = Command::new(self.program()?);
        command
            .args(&self.options.child_args)
            .arg("--sandbox")
            .arg(sandbox)
            .current_dir(sandbox)
            .env(RESUME_JIDS_ENV, resume_jids.join(","))
            .kill_on_drop(true);
        let child = command.spawn()?;
        info!(pid = child.id(), sandbox = %sandbox.display(), "Spawned worker");
        Ok(child)
    }

    pub async fn run(&mut self) -> QuillResult<()> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;

        // Spread the resumable work across the slots.
        let resume_jids: Vec<String> = self
            .core
            .resume_jobs()
            .iter()
            .map(|job| job.jid().to_string())
            .collect();
        let groups = divide(resume_jids, self.options.worker_count);

        for (index, group) in groups.iter().enumerate() {
            let sandbox = slot_sandbox(&self.sandbox_root, "sandbox", index);
            let child = self.spawn_child(&sandbox, group)?;
            self.children.push(ChildSlot { sandbox, child });
        }

        let result = loop {
            if self.core.is_shutdown() || self.children.is_empty() {
                break Ok(());
            }

            let tick = tokio::select! {
                _ = term.recv() => Tick::Signal(libc::SIGTERM),
                _ = int.recv() => Tick::Signal(libc::SIGINT),
                _ = quit.recv() => Tick::Signal(libc::SIGQUIT),
                exited = wait_any(&mut self.children) => {
                    let (index, status) = exited;
                    Tick::Exited(index, status)
                }
            };

            match tick {
                Tick::Signal(sig) => {
                    self.core.stop();
                    self.stop(sig).await;
                    break Ok(());
                }
                Tick::Exited(index, status) => {
                    match status {
                        Ok(status) => warn!(
                            sandbox = %self.children[index].sandbox.display(),
                            code = status.code(),
                            "Worker died"
                        ),
                        Err(err) => {
                            error!(error = %err, "Failed waiting on worker");
                        }
                    }
                    if self.core.is_shutdown() {
                        self.children.remove(index);
                        continue;
                    }
                    // Respawn in the same sandbox; resumable work was only
                    // for first launch.
                    let sandbox = self.children[index].sandbox.clone();
                    match self.spawn_child(&sandbox, &[]) {
                        Ok(child) => self.children[index].child = child,
                        Err(err) => break Err(err),
                    }
                }
            }
        };

        self.stop(libc::SIGKILL).await;
        result
    }

    /// Signal every child, wait for each, and kill any that linger.
    pub async fn stop(&mut self, sig: i32) {
        for slot in &self.children {
            if let Some(pid) = slot.child.id() {
                warn!(pid, sig, "Stopping worker");
                send_signal(pid, sig);
            }
        }
        for mut slot in self.children.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, slot.child.wait()).await {
                Ok(Ok(status)) => {
                    warn!(code = status.code(), "Worker stopped");
                }
                Ok(Err(err)) => {
                    error!(error = %err, "Error waiting for worker");
                }
                Err(_elapsed) => {
                    warn!(sandbox = %slot.sandbox.display(), "Worker unresponsive; killing");
                    let _ = slot.child.start_kill();
                    let _ = slot.child.wait().await;
                }
            }
        }
    }
}

async fn wait_any(children: &mut [ChildSlot]) -> (usize, std::io::Result<ExitStatus>) {
    let waits = children
        .iter_mut()
        .map(|slot| Box::pin(slot.child.wait()));
    let (status, index, _) = futures::future::select_all(waits).await;
    (index, status)
}

// tokio's Child can only deliver SIGKILL; graceful shutdown needs the real
// signal.
#[allow(unsafe_code)]
fn send_signal(pid: u32, sig: i32) {
    let outcome = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if outcome != 0 {
        warn!(pid, sig, error = %std::io::Error::last_os_error(), "Failed to signal worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::ResumeMode;
    use quill_client::test_support::{test_client, RecordingInvoker};

    #[tokio::test]
    async fn test_children_spawn_in_slot_sandboxes_and_stop() {
        let root = std::env::temp_dir().join(format!(
            "quill-forking-test-{}",
            std::process::id()
        ));
        let mut worker = ForkingWorker::new(
            test_client(RecordingInvoker::new()),
            QueueSelection::Names(vec!["foo".to_string()]),
            WorkerOptions {
                sandbox_root: root.clone(),
                resume: ResumeMode::No,
                ..Default::default()
            },
            ForkingOptions {
                worker_count: 2,
                program: Some(PathBuf::from("/bin/sleep")),
                child_args: vec!["30".to_string()],
            },
        )
        .await
        .unwrap();

        for index in 0..2 {
            let sandbox = slot_sandbox(&root, "sandbox", index);
            let child = worker.spawn_child(&sandbox, &[]).unwrap();
            assert!(sandbox.is_dir());
            worker.children.push(ChildSlot { sandbox, child });
        }

        worker.stop(libc::SIGTERM).await;
        assert!(worker.children.is_empty());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_wait_any_reports_exited_child() {
        let root = std::env::temp_dir().join(format!(
            "quill-forking-wait-test-{}",
            std::process::id()
        ));
        create_clean(&root).unwrap();

        let mut children = vec![
            ChildSlot {
                sandbox: root.join("a"),
                child: Command::new("/bin/sleep").arg("30").spawn().unwrap(),
            },
            ChildSlot {
                sandbox: root.join("b"),
                child: Command::new("/bin/true").spawn().unwrap(),
            },
        ];

        let (index, status) = wait_any(&mut children).await;
        assert_eq!(index, 1);
        assert!(status.unwrap().success());

        let _ = children[0].child.start_kill();
        let _ = children[0].child.wait().await;
        let _ = std::fs::remove_dir_all(root);
    }
}
