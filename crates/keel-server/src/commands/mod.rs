//! Command implementations.

use anyhow::{Context, Result};
use keel_config::CoordinatorConfig;
use keel_core::message::topics;
use keel_core::{CancelToken, JobId};
use keel_coord::Coordinator;
use tracing::info;

const WELL_KNOWN_TOPICS: [&str; 5] = [
    topics::APPROVAL_REQUESTED,
    topics::APPROVAL_DECIDED,
    topics::APPROVAL_EXPIRED,
    topics::JOB_COMPLETED,
    topics::JOB_FAILED,
];

async fn connect(config: CoordinatorConfig) -> Result<Coordinator> {
    Coordinator::connect(config)
        .await
        .context("failed to connect to the database")
}

pub async fn migrate(config: &CoordinatorConfig) -> Result<()> {
    let url = config.database.require_url()?;
    info!("Connecting to database...");
    let pool = keel_db::create_pool(url, config.database.max_connections).await?;
    keel_db::run_migrations(&pool).await?;
    info!("Migrations applied");
    println!("Migrations applied");
    Ok(())
}

pub async fn sweep(config: CoordinatorConfig, once: bool) -> Result<()> {
    let coordinator = connect(config).await?;
    let sweeper = coordinator.sweeper();

    if once {
        let report = sweeper.sweep_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            on_signal.cancel();
        }
    });
    sweeper.run(cancel).await;
    Ok(())
}

pub async fn status(config: CoordinatorConfig, json: bool) -> Result<()> {
    let coordinator = connect(config).await?;
    let depth = coordinator.jobs.stats().await?;
    let approvals = coordinator.approvals.list_pending(20).await?;

    let mut pending_messages = Vec::with_capacity(WELL_KNOWN_TOPICS.len());
    for topic in WELL_KNOWN_TOPICS {
        pending_messages.push((topic, coordinator.messages.pending_count(topic).await?));
    }

    if json {
        let messages: serde_json::Map<String, serde_json::Value> = pending_messages
            .iter()
            .map(|(topic, count)| (topic.to_string(), (*count).into()))
            .collect();
        let status = serde_json::json!({
            "jobs": depth,
            "pending_approvals": approvals,
            "pending_messages": messages,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Jobs");
    println!("  pending:   {}", depth.pending);
    println!("  running:   {}", depth.running);
    println!("  succeeded: {}", depth.succeeded);
    println!("  failed:    {}", depth.failed);
    println!("  cancelled: {}", depth.cancelled);

    println!("Pending approvals ({})", approvals.len());
    for request in &approvals {
        println!(
            "  {}  {}  requested by {}  expires {}",
            request.id, request.operation_id, request.requester, request.timeout_at
        );
    }

    println!("Pending messages");
    for (topic, count) in &pending_messages {
        println!("  {:<20} {}", topic, count);
    }
    Ok(())
}

pub async fn requeue(config: CoordinatorConfig, job_id: JobId) -> Result<()> {
    let coordinator = connect(config).await?;
    let job = coordinator
        .jobs
        .requeue(job_id)
        .await
        .with_context(|| format!("failed to requeue job {}", job_id))?;
    println!("Requeued {} ({})", job.id, job.dedup_key);
    Ok(())
}

pub async fn dead_letters(config: CoordinatorConfig, limit: i64) -> Result<()> {
    let coordinator = connect(config).await?;
    let jobs = coordinator.jobs.dead_letters(limit).await?;

    if jobs.is_empty() {
        println!("No dead-lettered jobs");
        return Ok(());
    }
    for job in jobs {
        if let Some(failure) = job.failure() {
            println!("{}  {}", job.updated_at, failure);
        }
    }
    Ok(())
}
