mod demo;
mod tasks;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use skein_core::{App, AppBuilder, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = include_str!("../skein.yaml");

#[derive(Parser, Debug)]
#[command(name = "skein")]
#[command(about = "Distributed task queue: workers, beat and a demo producer", long_about = None)]
struct Args {
    /// Path to a YAML configuration file (defaults to the bundled skein.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker pool, beat and the maintenance loops until Ctrl-C
    Worker {
        /// Queues to consume, highest priority first
        #[arg(short, long, value_delimiter = ',')]
        queues: Vec<String>,

        /// Number of concurrent task slots
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Do not run the periodic scheduler
        #[arg(long)]
        no_beat: bool,
    },
    /// Submit the demo workflows to an in-process worker pool and print the results
    Demo {
        /// Number of io_bound_task submissions in the bulk scenario
        #[arg(long, default_value = "20")]
        bulk: usize,

        /// Seconds to wait for each scenario
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Worker {
            queues,
            concurrency,
            no_beat,
        } => {
            let mut config = config;
            if !queues.is_empty() {
                config.worker_queues = queues;
            }
            if let Some(concurrency) = concurrency {
                config.worker_concurrency = concurrency;
            }
            run_worker(build_app(config)?, !no_beat).await
        }
        Command::Demo { bulk, timeout_secs } => {
            let app = build_app(config)?;
            demo::run(&app, bulk, std::time::Duration::from_secs(timeout_secs)).await
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_yaml_str(DEFAULT_CONFIG).context("parsing bundled skein.yaml")?,
    };
    Ok(config.with_env_overrides())
}

fn build_app(config: Config) -> anyhow::Result<App> {
    let builder = tasks::register_all(AppBuilder::new(config))?;
    let app = builder
        .expect_tasks(tasks::TASK_TYPES)
        .build()
        .context("building app")?;
    Ok(app)
}

async fn run_worker(app: App, with_beat: bool) -> anyhow::Result<()> {
    let pool = app.spawn_workers();
    let gc = app.gc_loop().spawn();
    let reaper = app.reaper_loop().spawn();
    let beat = with_beat.then(|| app.beat().spawn());

    tracing::info!(
        queues = ?app.config().worker_queues(),
        concurrency = pool.size(),
        beat = with_beat,
        "worker running; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("received shutdown signal");

    if let Some(beat) = beat {
        beat.shutdown_and_join().await;
    }
    pool.shutdown_and_join().await;
    gc.shutdown_and_join().await;
    reaper.shutdown_and_join().await;

    print!("{}", app.status().await?);
    Ok(())
}
