//! Quill Workers - Job Processing Runtime
//!
//! Worker variants over the quill client:
//! - `SerialWorker`: one job at a time; ownership loss is observed through
//!   heartbeats only
//! - `MainWorker`: serial, owns the process signals, and can abort the job
//!   in flight when its lock is revoked
//! - `ForkingWorker`: supervises child worker processes, one sandbox per
//!   slot, respawning on exit
//! - `PooledWorker`: bounded concurrent jobs in one process, one rented
//!   sandbox per in-flight job
//!
//! All variants share the same core: a queue resolver, a resumable-job
//! pass, a shutdown flag honored between jobs, and a pub/sub listener on
//! `ql:w:<worker_name>` that reports revoked job locks.

pub mod base;
pub mod forking;
pub mod main_worker;
pub mod pooled;
pub mod sandbox;
pub mod serial;
pub mod signals;

pub use base::{
    resumable, HaltFn, JobFeed, NextJob, OwnershipListener, QueueSelection, ResumeMode,
    WorkerCore, WorkerOptions,
};
pub use forking::{ForkingOptions, ForkingWorker, RESUME_JIDS_ENV};
pub use main_worker::MainWorker;
pub use pooled::{PooledOptions, PooledWorker};
pub use sandbox::{divide, Sandbox};
pub use serial::SerialWorker;
