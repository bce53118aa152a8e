use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use popq_core::app::{ExecutionLoop, LoopSettings, QueueBuilder, WorkerHeartbeat};
use popq_core::config::QueueConfig;
use popq_core::domain::{JobRecord, RecordId};
use popq_core::queue::{
    EnqueueOptions, HandlerResult, QueueSettings, RetryPolicy, RunnerOptions, handler_fn,
};
use popq_core::telemetry::init_tracing;
use popq_core::typed::{Handler, Task};

#[derive(Debug, Parser)]
#[command(name = "popq", version, about = "Persistent priority job queue")]
struct Cli {
    /// TOML configuration file; POPQ_* environment variables override it.
    #[arg(long, short, global = true, env = "POPQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// In-memory end-to-end run showing retries and success.
    Demo {
        #[arg(long, default_value_t = 3)]
        jobs: usize,
        /// Failures each job goes through before succeeding.
        #[arg(long, default_value_t = 2)]
        fail_first: u32,
    },
    /// Run the execution loop and heartbeat until Ctrl-C.
    Worker {
        /// Runner names to serve, each with a logging echo handler.
        #[arg(long = "name", required = true)]
        names: Vec<String>,
    },
    Enqueue {
        #[arg(long)]
        name: String,
        #[arg(long)]
        identifier: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i64,
        /// Milliseconds.
        #[arg(long, default_value_t = 0)]
        delay: i64,
    },
    /// Force a job back to pending by its record id.
    Requeue {
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: String,
    },
    /// Print eligible entries and metrics as JSON.
    Inspect {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
}

impl Task for Hello {
    const NAME: &'static str = "hello";
}

/// Fails each job `fail_first` times, then greets.
struct HelloHandler {
    fail_first: u32,
    failures: AtomicU32,
}

impl HelloHandler {
    fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            failures: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn handle(
        &self,
        task: Hello,
        job: &JobRecord,
        _cancel: CancellationToken,
    ) -> HandlerResult {
        if job.attempts <= self.fail_first {
            let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            return Err(format!("intentional failure (attempt={}, total={total})", job.attempts).into());
        }
        println!("Hello, {}! (attempt {})", task.name, job.attempts);
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = QueueConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging)?;

    match cli.command {
        Command::Demo { jobs, fail_first } => demo(jobs, fail_first).await,
        Command::Worker { names } => worker(&config, names).await,
        Command::Enqueue {
            name,
            identifier,
            data,
            priority,
            delay,
        } => {
            let data: serde_json::Value = serde_json::from_str(&data).context("--data is not valid JSON")?;
            let queue = QueueBuilder::from_config(&config).await?.build()?;
            let record = queue
                .enqueue(&name, identifier, data, EnqueueOptions::new().priority(priority).delay(delay))
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Requeue { name, id } => {
            let Some(id) = RecordId::parse(&id) else {
                bail!("'{id}' is not a record id");
            };
            let queue = QueueBuilder::from_config(&config).await?.build()?;
            let outcome = queue.requeue(&name, id).await?;
            println!("{}", serde_json::to_string_pretty(outcome.record())?);
            Ok(())
        }
        Command::Inspect { name } => {
            let queue = QueueBuilder::from_config(&config).await?.build()?;
            let report = serde_json::json!({
                "name": name,
                "length": queue.length(&name).await?,
                "eligible": queue.get_eligible(&name).await?,
                "metrics": queue.get_metrics(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn demo(jobs: usize, fail_first: u32) -> Result<()> {
    let settings = QueueSettings {
        retries: fail_first + 1,
        retry_policy: RetryPolicy::fixed(Duration::from_millis(100)),
        ..QueueSettings::default()
    };
    let queue = QueueBuilder::new()
        .with_settings(settings)
        .define_typed::<Hello, _>(HelloHandler::new(fail_first), RunnerOptions::new())
        .expect_runners(&[Hello::NAME])
        .build()?;

    for i in 0..jobs {
        let record = queue
            .enqueue_task(
                &Hello { name: format!("popq-{i}") },
                format!("hello-{i}"),
                EnqueueOptions::new().priority(i as i64),
            )
            .await?;
        info!(id = %record.id, identifier = %record.identifier, "enqueued");
    }

    let loop_settings = LoopSettings {
        batch_size: 10,
        parallel: true,
        poll_interval: Duration::from_millis(50),
    };
    let handle = ExecutionLoop::new(queue.clone(), loop_settings).spawn();

    loop {
        let metrics = queue.get_metrics();
        if (metrics.jobs_succeeded + metrics.jobs_failed) as usize >= jobs {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.shutdown_and_join().await;

    println!("{}", serde_json::to_string_pretty(&queue.get_metrics())?);
    Ok(())
}

async fn worker(config: &QueueConfig, names: Vec<String>) -> Result<()> {
    let mut builder = QueueBuilder::from_config(config).await?;
    for name in &names {
        builder = builder.define(
            name.clone(),
            handler_fn(|job: JobRecord, _cancel| async move {
                info!(name = %job.name, identifier = %job.identifier, data = %job.data, "echo");
                Ok(true)
            }),
            RunnerOptions::new(),
        );
    }
    let queue = builder.build()?;

    let worker_id = config
        .worker_id
        .clone()
        .unwrap_or_else(|| queue.ids().generate_worker_id());
    let shutdown = CancellationToken::new();
    let heartbeat = WorkerHeartbeat::new(queue.workers().clone(), worker_id.clone(), config.worker_timeout())
        .start(shutdown.clone())
        .await?;

    let handle = ExecutionLoop::new(queue.clone(), config.loop_settings()).spawn();
    info!(%worker_id, names = ?names, "worker running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");

    handle.shutdown_and_join().await;
    shutdown.cancel();
    if let Err(e) = heartbeat.await {
        tracing::warn!(error = %e, "heartbeat task ended abnormally");
    }
    Ok(())
}
