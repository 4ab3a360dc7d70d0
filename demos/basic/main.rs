//! Basic demo using the in-memory store.
//!
//! This demo shows:
//! - Enqueueing jobs on two lanes, one with priority over the other
//! - Processing them with a worker pool
//! - Cancelling a running job from a client
//!
//! Run with: `cargo run -p demo-basic`

use laneq_core::{Client, JobContext, Payload, QueueConfig, Status, WorkerPool};
use laneq_memory::MemoryStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Email notification job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
    /// How long sending takes.
    millis: u64,
}

/// Send an email, giving up if the job is cancelled.
async fn send_email(ctx: JobContext, payload: Payload) -> bool {
    let email: EmailJob = match payload.field("payload") {
        Ok(Some(email)) => email,
        Ok(None) | Err(_) => {
            tracing::warn!("Malformed email job");
            return false;
        }
    };

    println!("[{}] sending to: {} ({})", ctx.lane(), email.to, email.subject);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(email.millis)) => {
            println!("[{}] sent to {}", ctx.lane(), email.to);
            true
        }
        _ = ctx.cancelled() => {
            println!("[{}] cancelled: {}", ctx.lane(), email.to);
            false
        }
    }
}

#[tokio::main]
async fn main() -> laneq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("laneq job queue demo\n");

    let store = MemoryStore::new();
    let client = Client::new(store.clone());

    let emails = vec![
        ("bulk", "alice@example.com", "Weekly digest", 300),
        ("bulk", "bob@example.com", "New feature announcement", 300),
        ("urgent", "charlie@example.com", "Password reset", 100),
        ("urgent", "diana@example.com", "Your order shipped", 100),
        ("bulk", "eve@example.com", "Very long newsletter", 60_000),
    ];

    let mut slow = None;
    for (lane, to, subject, millis) in emails {
        let job = EmailJob {
            to: to.to_string(),
            subject: subject.to_string(),
            millis,
        };
        let job_id = client.enqueue(lane, job).await?;
        println!("  enqueued on {}: {}", lane, job_id);
        if millis > 1_000 {
            slow = Some(job_id);
        }
    }

    let config = QueueConfig::builder()
        .lanes(["urgent", "bulk"])
        .heartbeat(Duration::from_millis(100))
        .timeout(Duration::from_secs(2))
        .tries(3)
        .build()?;

    let pool = WorkerPool::builder()
        .store(store.clone())
        .config(config)
        .workers(2)
        .handler(send_email)
        .shutdown_timeout(Duration::from_secs(5))
        .build()?;

    println!("\nStarting worker pool (2 workers)...\n");

    let watcher = client.clone();
    pool.run_until(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Some(id) = slow {
                let status = watcher.get(&id).await.ok().flatten().map(|job| job.status);
                if status == Some(Status::Running) {
                    println!("\ncancelling slow job {}", id);
                    watcher.cancel(&id).await.ok();
                }
            }
            let done = watcher.count(Status::Succeeded).await.unwrap_or(0)
                + watcher.count(Status::Cancelled).await.unwrap_or(0);
            if done == 5 {
                break;
            }
        }
    })
    .await?;

    println!();
    for status in Status::ALL {
        let count = client.count(status).await?;
        if count > 0 {
            println!("{:>12}: {}", status, count);
        }
    }

    Ok(())
}
