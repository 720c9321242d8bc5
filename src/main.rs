use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use jobfeed::config::Config;
use jobfeed::events::EventBroadcaster;
use jobfeed::feed::build_client;
use jobfeed::import::{spawn_schedule, Coordinator, WorkerPool};
use jobfeed::maintenance::{spawn_sweeper, sweep_once};
use jobfeed::storage::{Database, DatabaseError, DEFAULT_RUN_LIMIT};

#[derive(Parser, Debug)]
#[command(name = "jobfeed", version, about = "Import job postings from RSS/Atom feeds")]
struct Args {
    /// Configuration file
    #[arg(long, short, value_name = "FILE", default_value = "jobfeed.toml")]
    config: PathBuf,

    /// Database file (overrides config and JOBFEED_DATABASE)
    #[arg(long, value_name = "PATH")]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one import, wait for the queue to drain, print the run record
    Import {
        /// Feed URL to import instead of the configured list (repeatable)
        #[arg(long = "feed", value_name = "URL")]
        feeds: Vec<String>,
    },
    /// Run workers, the import schedule and maintenance until Ctrl-C
    Daemon {
        /// Print live events to stdout as server-push frames
        #[arg(long)]
        follow: bool,
    },
    /// List import runs, most recent first
    Runs {
        #[arg(long, default_value_t = DEFAULT_RUN_LIMIT)]
        limit: i64,
    },
    /// List stored postings, most recently updated first
    Postings {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
    /// Show one stored posting
    Posting { id: i64 },
    /// Close stale runs and purge expired queue items once
    Sweep,
}

/// Interval at which `import` checks whether the queue has drained
const DRAIN_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jobfeed=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.apply_env().context("Invalid environment override")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    config.validate()?;

    let db = match Database::open(&config.database_path).await {
        Ok(db) => db
            .with_failure_limit(config.ledger.max_failures)
            .with_claim_timeout(config.claim_timeout()),
        Err(DatabaseError::Locked) => {
            eprintln!(
                "Error: database {} is locked by another process. Please close it and try again.",
                config.database_path
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let result = match args.command {
        Command::Import { feeds } => import(&db, &config, feeds).await,
        Command::Daemon { follow } => daemon(&db, &config, follow).await,
        Command::Runs { limit } => {
            let runs = db.recent_runs(limit).await?;
            print_json(&runs)
        }
        Command::Postings { page, page_size } => {
            let page = db.list_postings(page, page_size).await?;
            print_json(&page)
        }
        Command::Posting { id } => match db.get_posting(id).await? {
            Some(posting) => print_json(&posting),
            None => Err(anyhow::anyhow!("No posting with id {id}")),
        },
        Command::Sweep => {
            let report = sweep_once(&db, &config.sweep_settings()).await?;
            print_json(&report)
        }
    };

    db.close().await;
    result
}

fn coordinator(db: &Database, config: &Config, events: EventBroadcaster) -> Result<Coordinator> {
    let client = build_client(&config.fetch.user_agent).context("Failed to build HTTP client")?;
    Ok(Coordinator::new(
        db.clone(),
        client,
        events,
        config.import_settings(),
    ))
}

async fn import(db: &Database, config: &Config, feeds: Vec<String>) -> Result<()> {
    let feeds = if feeds.is_empty() {
        config.feeds.clone()
    } else {
        feeds
    };

    let events = config.event_broadcaster();
    let pool = WorkerPool::spawn(
        db.clone(),
        events.clone(),
        config.queue.concurrency,
        config.poll_interval(),
    )
    .await?;

    let summary = coordinator(db, config, events)?
        .run(feeds)
        .await
        .context("Failed to start import run")?;

    while db.queue_depth().await? > 0 {
        tokio::time::sleep(DRAIN_POLL).await;
    }
    pool.shutdown().await;

    db.finish_run(&summary.run_id).await?;
    match db.get_run(&summary.run_id).await? {
        Some(run) => print_json(&run),
        None => anyhow::bail!("Run {} disappeared", summary.run_id),
    }
}

async fn daemon(db: &Database, config: &Config, follow: bool) -> Result<()> {
    let events = config.event_broadcaster();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = WorkerPool::spawn(
        db.clone(),
        events.clone(),
        config.queue.concurrency,
        config.poll_interval(),
    )
    .await?;

    let mut tasks = vec![spawn_sweeper(
        db.clone(),
        config.sweep_settings(),
        shutdown_rx.clone(),
    )];

    match config.import_interval() {
        Some(interval) => tasks.push(spawn_schedule(
            coordinator(db, config, events.clone())?,
            config.feeds.clone(),
            interval,
            config.schedule.run_on_startup,
            shutdown_rx.clone(),
        )),
        None => tracing::info!("Scheduled imports disabled"),
    }

    if follow {
        let mut subscription = events
            .subscribe()
            .context("Cannot follow events: live events are disabled")?;
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    frame = subscription.recv() => {
                        let Some(frame) = frame else { break };
                        let mut stdout = std::io::stdout().lock();
                        if stdout.write_all(frame.as_bytes()).and_then(|_| stdout.flush()).is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    tracing::info!(feeds = config.feeds.len(), "Daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    pool.shutdown().await;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}
