use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use cotask_core::{Scheduler, SchedulerSettings};

#[derive(Parser)]
#[command(name = "cotask")]
#[command(about = "Background job scheduler")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the demo HTTP server, spawning jobs via `/jobs`
    Serve {
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short = 'P', long, default_value = "8080")]
        port: u16,
    },

    /// Spawn a handful of demo jobs against an in-process scheduler, then
    /// drain it gracefully. Exercises admission, timeout and shutdown
    /// without needing a server.
    Demo {
        #[arg(long, help = "Max concurrently active jobs", default_value = "2")]
        limit: usize,

        #[arg(long, help = "How many demo jobs to submit", default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let settings = match &cli.config {
        Some(path) => SchedulerSettings::load(path)?,
        None => SchedulerSettings::load_default()?,
    };

    info!(version = cotask_core::VERSION, "starting cotask");

    match cli.command {
        Commands::Serve { host, port } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            cotask_axum::server::run(addr, settings).await?;
        }
        Commands::Demo { limit, count } => {
            run_demo(settings, limit, count).await?;
        }
    }

    Ok(())
}

async fn run_demo(mut settings: SchedulerSettings, limit: usize, count: usize) -> anyhow::Result<()> {
    settings.limit = Some(limit);
    let scheduler = Scheduler::new(settings);
    scheduler.set_exception_handler(|_sched, ctx| {
        warn!(job_id = %ctx.job_id, error = %ctx.error, "{}", ctx.message);
    });

    info!(limit, count, "submitting demo jobs");

    let mut jobs = Vec::with_capacity(count);
    for i in 0..count {
        let should_fail = i % 4 == 3;
        let job = scheduler
            .spawn(
                async move {
                    tokio::time::sleep(Duration::from_millis(100 + (i as u64 * 25))).await;
                    if should_fail {
                        panic!("demo job {i} intentionally failed");
                    }
                    i
                },
                Some(format!("demo-{i}")),
            )
            .await?;
        jobs.push(job);
    }

    for job in &jobs {
        match job.wait(None).await {
            Ok(value) => info!(result = value, "job finished"),
            Err(e) => error!(error = %e, "job failed"),
        }
    }

    scheduler.wait_and_close(Some(Duration::from_secs(5))).await;
    info!("scheduler drained");
    Ok(())
}
