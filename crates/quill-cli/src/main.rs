//! # quill-worker
//!
//! Runs a worker against a queue server. The binary owns process concerns:
//! flag parsing, `.env` loading, logging, and picking a worker variant.
//!
//! Job processors are compiled in by the embedding application; deployments
//! build their own binary that populates a `ProcessorRegistry` and hands it
//! to `Client::builder().registry(...)`, reusing the option surface here.
//! Run standalone, this binary drains queues and fails every job with a
//! `<queue>-klass-not-found` group, which is still useful for smoke tests.

use clap::{Parser, ValueEnum};
use quill_client::resolver::{
    DynamicMappingTransformer, DynamicPriorityTransformer, QueueIdentifiersTransformer,
    QueueResolver, TransformingQueueResolver,
};
use quill_client::{Client, PatternSource, QuillResult};
use quill_workers::{
    ForkingOptions, ForkingWorker, MainWorker, PooledOptions, PooledWorker, QueueSelection,
    ResumeMode, SerialWorker, WorkerOptions, RESUME_JIDS_ENV,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    /// One job at a time.
    Serial,
    /// Serial, plus process signals and in-flight halting.
    Main,
    /// Supervise child worker processes.
    Forking,
    /// Concurrent jobs in one process.
    Pooled,
}

#[derive(Debug, Parser)]
#[command(name = "quill-worker", version, about = "Run quill workers against a queue server")]
struct Args {
    /// Redis URL of the queue server.
    #[arg(long, env = "QUILL_REDIS_URL", default_value = "redis://localhost:6379")]
    url: String,

    /// Path to the server-side queue script.
    #[arg(long, env = "QUILL_SCRIPT")]
    script: PathBuf,

    /// Worker name; defaults to the hostname.
    #[arg(long)]
    name: Option<String>,

    /// Queue identifier; repeatable. Literals, wildcards (`reports-*`),
    /// negations (`!reports-low`), and mapping references (`@batch`).
    #[arg(long = "queue", required = true)]
    queues: Vec<String>,

    /// Worker variant.
    #[arg(long, value_enum, default_value_t = Variant::Serial)]
    variant: Variant,

    /// Seconds to sleep when no work is available.
    #[arg(long, default_value_t = 60.0)]
    interval: f64,

    /// Child process count for the forking variant; defaults to the host
    /// CPU count.
    #[arg(long)]
    workers: Option<usize>,

    /// Concurrent job cap for the pooled variant.
    #[arg(long, default_value_t = 10)]
    pool_size: usize,

    /// Root directory for job sandboxes.
    #[arg(long, default_value = "quill-workers")]
    sandbox: PathBuf,

    /// Resume jobs still registered to this worker name.
    #[arg(long)]
    resume: bool,

    /// Expand identifiers through the server-stored dynamic mapping.
    #[arg(long)]
    dynamic_mapping: bool,

    /// Reorder queues through the server-stored priority patterns.
    #[arg(long)]
    dynamic_priority: bool,

    /// Read patterns from the legacy qmore keys instead of the script.
    #[arg(long)]
    legacy_patterns: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!(error = %err, "Worker exited with error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> QuillResult<()> {
    let script = std::fs::read_to_string(&args.script)?;

    let mut builder = Client::builder().url(&args.url).script_source(script);
    if let Some(name) = &args.name {
        builder = builder.worker_name(name);
    }
    let client = builder.build().await?;
    info!(
        worker = %client.worker_name(),
        variant = ?args.variant,
        queues = ?args.queues,
        "Starting worker"
    );

    let resolver = build_resolver(&client, &args);
    let options = WorkerOptions {
        interval: Duration::from_secs_f64(args.interval),
        resume: resume_mode(&client, &args).await?,
        sandbox_root: args.sandbox.clone(),
    };
    let queues = QueueSelection::Resolver(resolver);

    match args.variant {
        Variant::Serial => {
            SerialWorker::new(client, queues, options).await?.run().await
        }
        Variant::Main => MainWorker::new(client, queues, options).await?.run().await,
        Variant::Pooled => {
            PooledWorker::new(
                client,
                queues,
                options,
                PooledOptions {
                    pool_size: args.pool_size,
                },
            )
            .await?
            .run()
            .await
        }
        Variant::Forking => {
            let forking = ForkingOptions {
                child_args: child_args(&args, client.worker_name()),
                ..Default::default()
            };
            let forking = match args.workers {
                Some(worker_count) => ForkingOptions {
                    worker_count,
                    ..forking
                },
                None => forking,
            };
            ForkingWorker::new(client, queues, options, forking)
                .await?
                .run()
                .await
        }
    }
}

/// Resume jobs for this worker: an explicit jid list from the supervisor
/// takes precedence over discovery.
async fn resume_mode(client: &Client, args: &Args) -> QuillResult<ResumeMode> {
    if let Ok(raw) = std::env::var(RESUME_JIDS_ENV) {
        let jids: Vec<String> = raw
            .split(',')
            .filter(|jid| !jid.is_empty())
            .map(str::to_string)
            .collect();
        let jobs = client.jobs().multiget(&jids).await?;
        info!(count = jobs.len(), "Resuming jobs assigned by supervisor");
        return Ok(ResumeMode::Jobs(jobs));
    }
    Ok(if args.resume {
        ResumeMode::Auto
    } else {
        ResumeMode::No
    })
}

fn build_resolver(client: &Client, args: &Args) -> Arc<dyn QueueResolver> {
    let source = if args.legacy_patterns {
        PatternSource::LegacyKeys
    } else {
        PatternSource::Script
    };
    let mut transformers: Vec<Arc<dyn QueueIdentifiersTransformer>> = Vec::new();
    if args.dynamic_mapping {
        transformers.push(Arc::new(
            DynamicMappingTransformer::new(client.clone()).pattern_source(source),
        ));
    }
    if args.dynamic_priority {
        transformers.push(Arc::new(
            DynamicPriorityTransformer::new(client.clone()).pattern_source(source),
        ));
    }
    Arc::new(TransformingQueueResolver::with_transformers(
        args.queues.clone(),
        transformers,
    ))
}

/// Arguments for forking-worker children: this binary again, as a serial
/// worker with the same connection and resolver flags. The supervisor
/// appends `--sandbox <slot>` and assigns resume jids via the environment.
fn child_args(args: &Args, worker_name: &str) -> Vec<String> {
    let mut child = vec![
        "--url".to_string(),
        args.url.clone(),
        "--script".to_string(),
        args.script.display().to_string(),
        "--name".to_string(),
        worker_name.to_string(),
        "--variant".to_string(),
        "serial".to_string(),
        "--interval".to_string(),
        args.interval.to_string(),
    ];
    for queue in &args.queues {
        child.push("--queue".to_string());
        child.push(queue.clone());
    }
    if args.dynamic_mapping {
        child.push("--dynamic-mapping".to_string());
    }
    if args.dynamic_priority {
        child.push("--dynamic-priority".to_string());
    }
    if args.legacy_patterns {
        child.push("--legacy-patterns".to_string());
    }
    child
}
