//! Quill Client - Redis-Script Job Queue Client
//!
//! Client for a job queue whose authoritative semantics live in a script
//! executed atomically by the Redis server. The client owns:
//! - The command envelope: every operation is one `(command, now, args...)`
//!   script invocation
//! - The entity model: jobs, recurring jobs, throttles, queues
//! - Queue-name resolution: dynamic mapping and priority reordering over
//!   the live queue list
//! - Pub/sub plumbing: the restartable listener and the event stream
//! - The processor registry dispatching popped jobs to user handlers
//!
//! # Example
//!
//! ```rust,ignore
//! use quill_client::{Client, Processor, PutOptions};
//!
//! let client = Client::builder()
//!     .url("redis://localhost:6379")
//!     .script_source(script)
//!     .build()
//!     .await?;
//!
//! client.registry().register(
//!     "app.Reports",
//!     Processor::builder()
//!         .process(|job| async move {
//!             // work with job.data()
//!             job.complete().await.map(|_| ()).map_err(|e| e.to_string().into())
//!         })
//!         .build(),
//! );
//!
//! let jid = client
//!     .queue("reports")
//!     .put("app.Reports", r#"{"week": 12}"#, PutOptions::default())
//!     .await?;
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod future;
pub mod job;
pub mod jobs;
pub mod listener;
pub mod patterns;
pub mod queue;
pub mod queues;
pub mod registry;
pub mod resolver;
pub mod script;
pub mod throttle;
pub mod workers;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use client::{Client, ClientBuilder};
pub use clock::{Clock, FrozenClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{ProcessingError, QuillError, QuillResult};
pub use events::{Events, EventsHandle};
pub use future::Future;
pub use job::{Failure, Job, JobState, RecurringJob, WorkUnit};
pub use jobs::Jobs;
pub use listener::{Listener, Message};
pub use patterns::{PatternSource, QueuePatterns, QueuePriorityPattern};
pub use queue::{PutOptions, Queue, QueueStats, RecurOptions, StatsBucket};
pub use queues::{QueueCounts, Queues};
pub use registry::{Processor, ProcessorBuilder, ProcessorHandler, ProcessorRegistry};
pub use resolver::{
    DynamicMappingTransformer, DynamicPriorityTransformer, QueueIdentifiersTransformer,
    QueueResolver, TransformingQueueResolver,
};
pub use script::{ScriptClient, ScriptInvoker};
pub use throttle::Throttle;
pub use workers::{WorkerCounts, WorkerInfo, Workers};
