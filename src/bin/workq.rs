//! workq CLI: exercise a work queue from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use workq::config::Config;
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::{Executor, ManualExecutor, TokioExecutor, WorkItem, WorkQueue};

#[derive(Parser)]
#[command(name = "workq", about = "Bounded-concurrency work dispatch queue")]
struct Cli {
    /// TOML config file (defaults to environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured concurrency limit
    #[arg(long, global = true)]
    limit: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch of sleeping jobs and print the final queue snapshot
    Run {
        /// Number of jobs to submit
        #[arg(long, default_value_t = 32)]
        jobs: usize,
        /// How long each job sleeps
        #[arg(long, default_value_t = 50)]
        sleep_ms: u64,
        /// Promote every n-th job to the front of the queue
        #[arg(long)]
        promote_every: Option<usize>,
    },
    /// Hammer one queue from many threads with random operations
    Stress {
        #[arg(long, default_value_t = 20)]
        threads: usize,
        /// Random actions per thread
        #[arg(long, default_value_t = 50)]
        actions: usize,
        /// Use a manually stepped executor instead of the tokio pool
        #[arg(long)]
        manual: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(limit) = cli.limit {
        config.max_concurrent = limit;
    }

    let _telemetry = init_telemetry(TelemetryConfig::from_config(&config, "workq"))?;

    match cli.command {
        Command::Run {
            jobs,
            sleep_ms,
            promote_every,
        } => cmd_run(&config, jobs, sleep_ms, promote_every).await,
        Command::Stress {
            threads,
            actions,
            manual,
        } => cmd_stress(&config, threads, actions, manual).await,
    }
}

async fn cmd_run(
    config: &Config,
    jobs: usize,
    sleep_ms: u64,
    promote_every: Option<usize>,
) -> anyhow::Result<()> {
    let queue = WorkQueue::from_config(config, Arc::new(TokioExecutor::new()?))?;
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    info!(jobs, limit = queue.limit(), "submitting jobs");
    for n in 0..jobs {
        let done_tx = done_tx.clone();
        let item = queue.add_active_work_item(move || {
            std::thread::sleep(Duration::from_millis(sleep_ms));
            let _ = done_tx.send(n);
        });
        if promote_every.is_some_and(|every| every > 0 && n % every == 0) {
            item.move_to_front();
        }
    }
    drop(done_tx);

    let mut order = Vec::with_capacity(jobs);
    while let Some(n) = done_rx.recv().await {
        order.push(n);
    }

    queue.validate();
    info!(completed = order.len(), "all jobs finished");
    println!("completion order: {order:?}");
    println!("{}", serde_json::to_string_pretty(&queue.snapshot())?);
    Ok(())
}

async fn cmd_stress(
    config: &Config,
    threads: usize,
    actions: usize,
    manual: bool,
) -> anyhow::Result<()> {
    let manual_executor = Arc::new(ManualExecutor::new());
    let executor: Arc<dyn Executor> = if manual {
        manual_executor.clone()
    } else {
        Arc::new(TokioExecutor::new()?)
    };
    let queue = WorkQueue::from_config(config, executor)?;
    let ran = Arc::new(AtomicUsize::new(0));
    let submitted = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let queue = queue.clone();
            let manual_executor = Arc::clone(&manual_executor);
            let ran = Arc::clone(&ran);
            let submitted = Arc::clone(&submitted);
            let cancelled = Arc::clone(&cancelled);
            std::thread::spawn(move || {
                let mut handles: Vec<WorkItem> = Vec::new();
                for _ in 0..actions {
                    match fastrand::u32(0..4) {
                        0 | 1 => {
                            let ran = Arc::clone(&ran);
                            let item = queue.add_active_work_item(move || {
                                std::thread::sleep(Duration::from_micros(fastrand::u64(0..200)));
                                ran.fetch_add(1, Ordering::SeqCst);
                            });
                            submitted.fetch_add(1, Ordering::SeqCst);
                            handles.push(item);
                        }
                        2 => {
                            if !handles.is_empty() {
                                let item = &handles[fastrand::usize(0..handles.len())];
                                if item.cancel() {
                                    cancelled.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                        }
                        _ => {
                            if !handles.is_empty() {
                                handles[fastrand::usize(0..handles.len())].move_to_front();
                            }
                            manual_executor.run_next();
                        }
                    }
                }
                queue.validate();
            })
        })
        .collect();

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("stress thread panicked"))?;
    }

    let expected = submitted.load(Ordering::SeqCst) - cancelled.load(Ordering::SeqCst);
    loop {
        manual_executor.run_all();
        if ran.load(Ordering::SeqCst) >= expected
            && queue.active_count() == 0
            && queue.pending_count() == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    queue.check_invariants()?;
    info!(
        submitted = submitted.load(Ordering::SeqCst),
        cancelled = cancelled.load(Ordering::SeqCst),
        ran = ran.load(Ordering::SeqCst),
        "stress run finished"
    );
    println!("{}", serde_json::to_string_pretty(&queue.snapshot())?);
    Ok(())
}
