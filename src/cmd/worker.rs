//! `coderun worker`: drain the queue once, or keep serving until Ctrl-C.

use std::time::Duration;

use anyhow::Result;
use coderun::config::CoderunConfig;
use coderun::queue::{JobWorker, WorkerSettings, WorkerSummary};
use console::style;
use tokio::sync::watch;
use tracing::info;

use super::open_service;

pub async fn cmd_worker(config: &CoderunConfig, budget: Option<u64>, serve: bool) -> Result<()> {
    let service = open_service(config)?;
    let mut settings = WorkerSettings::from_config(config);
    if let Some(secs) = budget {
        settings.budget = Duration::from_secs(secs);
    }
    let worker = JobWorker::new(service, settings.clone());

    let summary = if serve {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                let _ = tx.send(true);
            }
        });
        println!(
            "{} polling every {}s (Ctrl-C to stop)",
            style("Worker").cyan().bold(),
            settings.poll_interval.as_secs()
        );
        worker.serve(rx).await
    } else {
        worker.drain(settings.budget).await?
    };

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &WorkerSummary) {
    let failed = if summary.failed > 0 {
        style(summary.failed.to_string()).red().bold()
    } else {
        style(summary.failed.to_string()).dim()
    };
    println!(
        "Processed {} job(s), {} failed in {:.1}s",
        summary.processed,
        failed,
        summary.elapsed.as_secs_f64()
    );
}
