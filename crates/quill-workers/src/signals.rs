//! Signal wiring for worker processes.
//!
//! QUIT finishes the current work and stops; USR1 logs a backtrace; USR2
//! logs a state dump provided by the worker.

use quill_client::QuillResult;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::warn;

/// Hook producing a human-readable worker state dump.
pub type DescribeFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Hook invoked on QUIT.
pub type QuitFn = Arc<dyn Fn() + Send + Sync>;

/// Install QUIT/USR1/USR2 handlers in a background task. Abort the returned
/// handle to uninstall.
pub fn spawn_worker_signals(on_quit: QuitFn, describe: DescribeFn) -> QuillResult<JoinHandle<()>> {
    let mut quit = signal(SignalKind::quit())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = quit.recv() => {
                    warn!("SIGQUIT received; stopping after current work");
                    on_quit();
                }
                _ = usr1.recv() => {
                    let backtrace = std::backtrace::Backtrace::force_capture();
                    warn!(
                        pid = std::process::id(),
                        "SIGUSR1 backtrace:\n{}",
                        backtrace
                    );
                }
                _ = usr2.recv() => {
                    warn!(
                        pid = std::process::id(),
                        state = %describe(),
                        "SIGUSR2 state dump"
                    );
                }
            }
        }
    }))
}
