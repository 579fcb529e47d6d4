//! Queue inspection and maintenance: `coderun queue`.

use anyhow::Result;
use coderun::config::CoderunConfig;
use coderun::queue::{JobStatus, JobType};
use console::style;
use serde_json::json;

use super::super::{Cli, QueueCommands};
use super::{fmt_ms, open_service, print_json};

pub async fn cmd_queue(cli: &Cli, config: &CoderunConfig, command: QueueCommands) -> Result<()> {
    let service = open_service(config)?;
    let queue = service.queue();
    match command {
        QueueCommands::Stats => {
            let stats = queue.stats().await?;
            if cli.json {
                return print_json(&stats);
            }
            println!();
            println!("{} ({} jobs)", style("Queue").bold().cyan(), stats.total);
            println!();
            println!("By status:");
            for (status, count) in &stats.by_status {
                println!("  {:<10} {}", status, count);
            }
            println!("By type:");
            for (job_type, count) in &stats.by_type {
                println!("  {:<15} {}", job_type, count);
            }
            println!();
        }
        QueueCommands::List { limit } => {
            let jobs = queue.list(limit).await?;
            if cli.json {
                return print_json(&jobs);
            }
            if jobs.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }
            println!(
                "{:<5} {:<15} {:<10} {:<4} {:<8} {:<5} Scheduled",
                "Id", "Type", "Status", "Pri", "Attempts", "Run"
            );
            for job in &jobs {
                let status = match job.status {
                    JobStatus::Failed => style(job.status.as_str()).red(),
                    JobStatus::Completed => style(job.status.as_str()).green(),
                    JobStatus::Running => style(job.status.as_str()).yellow(),
                    JobStatus::Pending => style(job.status.as_str()).dim(),
                };
                println!(
                    "{:<5} {:<15} {:<10} {:<4} {:<8} {:<5} {}",
                    job.id,
                    job.job_type.as_str(),
                    status,
                    job.priority,
                    format!("{}/{}", job.attempts, job.max_attempts),
                    job.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    fmt_ms(job.scheduled_at)
                );
                if let Some(err) = &job.error_message {
                    println!("      {}", style(err).dim());
                }
            }
        }
        QueueCommands::Cleanup { days } => {
            let days = days.unwrap_or(config.toml.queue.cleanup_days);
            let deleted = queue.cleanup(days).await?;
            println!("Deleted {} finished job(s) older than {} day(s)", deleted, days);
        }
        QueueCommands::ResetStuck { minutes } => {
            let minutes = minutes.unwrap_or(config.toml.worker.stuck_threshold_minutes);
            let reset = queue.reset_stuck(minutes).await?;
            println!("Released {} job(s) running longer than {} minute(s)", reset, minutes);
        }
        QueueCommands::EnqueueMaintenance => {
            let cleanup = queue
                .push(
                    JobType::Cleanup,
                    json!({ "days": config.toml.queue.cleanup_days }),
                    queue.options(),
                )
                .await?;
            let backups = queue
                .push(
                    JobType::BackupCleanup,
                    json!({ "retention_days": config.toml.apply.backup_retention_days }),
                    queue.options(),
                )
                .await?;
            if cli.json {
                return print_json(&[cleanup, backups]);
            }
            println!("Queued job #{} ({})", cleanup.id, cleanup.job_type);
            println!("Queued job #{} ({})", backups.id, backups.job_type);
        }
    }
    Ok(())
}
