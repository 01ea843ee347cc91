//! forwarder CLI: runs the pipeline and inspects the backlog.

use std::sync::Arc;

use artifact_forwarder::backlog::{self, Backlog};
use artifact_forwarder::config::Config;
use artifact_forwarder::config::secrets::redact_url;
use artifact_forwarder::engine::Pipeline;
use artifact_forwarder::model::{NewWorkItem, Status, WorkId};
use artifact_forwarder::submit::AnalysisClient;
use artifact_forwarder::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "forwarder",
    about = "Forward captured artifacts to the analysis engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the forwarding pipeline
    Serve {
        /// Number of worker tasks (overrides WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// List backlog items, newest first
    List {
        /// Filter by status (pending, claimed, forwarded, dead)
        #[arg(long)]
        status: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one backlog item
    Show {
        /// Work item ID
        id: i64,
    },
    /// Record an artifact-observed event, as a sensor would
    Enqueue {
        /// Original filename reported by the sensor
        #[arg(long)]
        filename: String,
        /// Name the sensor stored the artifact under
        #[arg(long)]
        stored_name: Option<String>,
        /// SHA-256 logged by the sensor
        #[arg(long)]
        sha256: Option<String>,
        /// Attacker address
        #[arg(long, default_value = "0.0.0.0")]
        source_ip: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { workers } => cmd_serve(config, workers).await,
        Command::List { status, limit } => {
            let backlog = backlog::open(&config.backlog_url, &config.tables).await?;
            cmd_list(backlog.as_ref(), status, limit).await
        }
        Command::Show { id } => {
            let backlog = backlog::open(&config.backlog_url, &config.tables).await?;
            cmd_show(backlog.as_ref(), WorkId(id)).await
        }
        Command::Enqueue {
            filename,
            stored_name,
            sha256,
            source_ip,
        } => {
            let backlog = backlog::open(&config.backlog_url, &config.tables).await?;
            let mut new = NewWorkItem::new(&source_ip).filename(filename);
            if let Some(name) = stored_name {
                new = new.stored_name(name);
            }
            if let Some(hash) = sha256 {
                new = new.logged_hash(hash);
            }
            let item = backlog.enqueue(new).await?;
            println!("Enqueued: {} (status: {})", item.id, item.status);
            Ok(())
        }
    }
}

async fn cmd_serve(config: Config, workers: Option<usize>) -> anyhow::Result<()> {
    let _guard = init_telemetry(
        TelemetryConfig::new(config.otel_endpoint.clone(), config.log_level.clone())
            .instance_id(config.worker_id.clone()),
    )?;

    let workers = workers.unwrap_or(config.workers).max(1);
    info!(
        backlog = %redact_url(&config.backlog_url),
        engine = %config.engine.url,
        workers,
        worker_id = %config.worker_id,
        "starting forwarder"
    );

    let backlog = backlog::open(&config.backlog_url, &config.tables).await?;
    backlog.health_check().await?;
    let submitter = Arc::new(AnalysisClient::new(&config.engine)?);

    let pipelines: Vec<Arc<Pipeline>> = (0..workers)
        .map(|n| {
            let worker_id = if workers == 1 {
                config.worker_id.clone()
            } else {
                format!("{}/{n}", config.worker_id)
            };
            Arc::new(Pipeline::new(
                Arc::clone(&backlog),
                submitter.clone(),
                config.uploads_dir.clone(),
                config.pipeline.clone(),
                worker_id,
            ))
        })
        .collect();

    let stoppers = pipelines.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested, finishing items in hand");
        for p in &stoppers {
            p.shutdown();
        }
    });

    let handles: Vec<_> = pipelines
        .into_iter()
        .map(|p| tokio::spawn(async move { p.run().await }))
        .collect();

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "worker exited with error"),
            Err(e) => error!(error = %e, "worker task panicked"),
        }
    }

    Ok(())
}

async fn cmd_list(
    backlog: &dyn Backlog,
    status: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status_filter: Option<Status> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let items = backlog.list(status_filter, limit).await?;

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<4}  {:<30}  {:<16}  UPDATED",
        "ID", "STATUS", "TRY", "FILENAME", "HASH"
    );
    println!("{}", "-".repeat(100));

    for item in &items {
        let name: String = item.display_name().chars().take(30).collect();
        let hash: String = item
            .content_hash
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(16)
            .collect();
        println!(
            "{:<8}  {:<10}  {:<4}  {:<30}  {:<16}  {}",
            item.id.to_string(),
            item.status.as_str(),
            item.attempts,
            name,
            hash,
            item.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_show(backlog: &dyn Backlog, id: WorkId) -> anyhow::Result<()> {
    let item = backlog.get(id).await?;
    let dash = |v: Option<&str>| v.unwrap_or("-").to_string();

    println!("ID:           {}", item.id);
    println!("Status:       {}", item.status);
    println!("Source IP:    {}", item.source_ip);
    println!("Filename:     {}", dash(item.filename_hint.as_deref()));
    println!("Stored Name:  {}", dash(item.stored_name_hint.as_deref()));
    println!("Logged Hash:  {}", dash(item.logged_hash.as_deref()));
    println!("Content Hash: {}", dash(item.content_hash.as_deref()));
    println!("Attempts:     {}", item.attempts);
    println!("Created:      {}", item.created_at);
    println!("Updated:      {}", item.updated_at);
    if let Some(lease) = item.lease_until {
        println!("Lease Until:  {lease}");
    }
    if let Some(ref worker) = item.claimed_by {
        println!("Claimed By:   {worker}");
    }
    if let Some(retry) = item.retry_after {
        println!("Retry After:  {retry}");
    }
    if let Some(task) = item.task_ref {
        println!("Task:         {task}");
    }
    if let Some(ref dup) = item.duplicate_of {
        println!("Duplicate Of: {dup}");
    }
    if let Some(ref err) = item.last_error {
        println!("Last Error:   {err}");
    }
    if let Some(ref response) = item.engine_response {
        println!("---");
        match serde_json::from_str::<serde_json::Value>(response) {
            Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
            Err(_) => println!("{response}"),
        }
    }

    Ok(())
}
