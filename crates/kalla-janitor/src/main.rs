//! kalla-janitor: reaps stale batch jobs, reports stuck ones and sweeps
//! their auxiliary state.

mod alert;
mod config;
mod health;
mod heartbeat;
mod http_api;
mod job_loop;
mod metrics;
mod queue;
mod runtime;
mod store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kalla_reaper::{AlertSender, CleanupAggregator, StaleJobReaper, StuckJobReporter};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use alert::{LogAlertSender, WebhookAlertSender};
use config::{JanitorConfig, JanitorMode};
use health::HealthState;
use http_api::{CronAuth, CronState};
use job_loop::{JobContext, JobSource};
use metrics::JanitorMetrics;
use queue::{JobMessage, QueueClient};
use runtime::{Dispatcher, PgBatchJobRuntime};
use store::{PgAuxiliaryStore, PgJobRegistry, PgPipelineRegistry};

const LOCAL_QUEUE_CAPACITY: usize = 16;

#[derive(Parser)]
#[command(name = "kalla-janitor", about = "Kalla batch job janitor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the cron endpoints and run enqueued cleanup jobs
    Serve,
    /// Run one reap pass and exit
    Reap,
    /// Send one stuck job report and exit
    ReportStuck,
}

/// Collaborators shared by every subcommand.
struct Janitor {
    config: JanitorConfig,
    pool: PgPool,
    metrics: JanitorMetrics,
    reaper: StaleJobReaper,
    reporter: StuckJobReporter,
    source: JobSource,
}

impl Janitor {
    async fn build(config: JanitorConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;
        info!("Connected to database");

        let (dispatcher, source) = match config.mode() {
            JanitorMode::Scaled => {
                let nats_url = config.nats_url.as_deref().unwrap_or_default();
                let queue = Arc::new(QueueClient::connect(nats_url).await?);
                info!("Connected to NATS at {}", nats_url);
                (Dispatcher::Nats(queue.clone()), JobSource::Nats(queue))
            }
            JanitorMode::Single => {
                let (tx, rx) = mpsc::channel(LOCAL_QUEUE_CAPACITY);
                (Dispatcher::Local(tx), JobSource::Local(rx))
            }
        };

        let jobs = Arc::new(PgJobRegistry::new(pool.clone(), config.job_lease_secs));
        let pipelines = Arc::new(PgPipelineRegistry::new(pool.clone()));
        let runtime = Arc::new(PgBatchJobRuntime::new(pool.clone(), dispatcher));

        let reaper = StaleJobReaper::new(jobs.clone(), pipelines, runtime)
            .with_window(config.retention_window()?)
            .with_fetch_limit(config.fetch_limit);

        let sender: Arc<dyn AlertSender> = match &config.alert_webhook_url {
            Some(url) => Arc::new(WebhookAlertSender::new(url.clone())),
            None => {
                info!("ALERT_WEBHOOK_URL not set, alerts go to the log");
                Arc::new(LogAlertSender)
            }
        };
        let reporter = StuckJobReporter::new(jobs, sender, config.admin_email.clone());

        Ok(Self {
            config,
            pool,
            metrics: JanitorMetrics::new(),
            reaper,
            reporter,
            source,
        })
    }

    fn job_context(&self) -> JobContext {
        let aggregator = CleanupAggregator::new(Arc::new(PgAuxiliaryStore::new(self.pool.clone())))
            .with_concurrency(self.config.aggregator_concurrency)
            .with_page_size(self.config.aggregator_page_size);
        JobContext::new(&self.config, self.pool.clone(), aggregator, self.metrics.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = JanitorConfig::from_env()?;
    info!(
        "Starting kalla-janitor {} in {:?} mode",
        config.worker_id,
        config.mode()
    );

    let janitor = Janitor::build(config).await?;

    match cli.command {
        Commands::Serve => serve(janitor).await,
        Commands::Reap => reap_once(janitor).await,
        Commands::ReportStuck => report_once(janitor).await,
    }
}

async fn serve(janitor: Janitor) -> Result<()> {
    let ctx = Arc::new(janitor.job_context());
    let Janitor {
        config,
        metrics,
        reaper,
        reporter,
        source,
        ..
    } = janitor;

    let ready = Arc::new(AtomicBool::new(true));
    let health_state = Arc::new(HealthState {
        metrics: metrics.clone(),
        ready: ready.clone(),
    });

    let metrics_port = config.metrics_port;
    let health_router = health::health_router(health_state);
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", metrics_port);
        info!("Metrics server listening on {}", addr);
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, health_router).await {
                    error!("Metrics server failed: {}", e);
                }
            }
            Err(e) => error!("Failed to bind metrics server on {}: {}", addr, e),
        }
    });

    tokio::spawn(async move {
        if let Err(e) = job_loop::run_job_loop(ctx, source).await {
            error!("Job loop stopped: {}", e);
        }
    });

    let state = Arc::new(CronState {
        reporter,
        reaper,
        auth: CronAuth::new(config.cron_header.clone(), config.superadmin_token.clone()),
        metrics,
        stuck_threshold_ms: config.stuck_threshold_ms,
        max_jobs_to_report: config.max_jobs_to_report,
    });

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Cron endpoints listening on {}", addr);
    axum::serve(listener, http_api::cron_router(state)).await?;

    Ok(())
}

async fn reap_once(janitor: Janitor) -> Result<()> {
    let ctx = janitor.job_context();
    let now_ms = chrono::Utc::now().timestamp_millis();
    let outcome = janitor.reaper.reap(now_ms).await?;
    janitor.metrics.record_reap(&outcome);
    let summary = http_api::ReapResponse::from(outcome);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    // Single mode has no worker to pick up the enqueued job, so run it here.
    if let JobSource::Local(mut rx) = janitor.source {
        while let Ok(job) = rx.try_recv() {
            run_inline(&ctx, job).await?;
        }
    }

    Ok(())
}

async fn run_inline(ctx: &JobContext, job: JobMessage) -> Result<()> {
    info!("Running job {} inline", job.job_id());
    job_loop::handle_job(ctx, job).await
}

async fn report_once(janitor: Janitor) -> Result<()> {
    let report = janitor
        .reporter
        .report(janitor.config.stuck_threshold_ms, janitor.config.max_jobs_to_report)
        .await?;
    println!("{}: {} stuck jobs ({} listed)", report.subject, report.total, report.listed);
    Ok(())
}
