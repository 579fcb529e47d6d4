//! Run lifecycle commands: `coderun run`.

use anyhow::Result;
use coderun::config::CoderunConfig;
use coderun::runs::{Phase, Run, RunDetail, RunStatus};
use console::style;

use super::super::{Cli, RunCommands};
use super::{fmt_ms, open_service, print_json};

pub async fn cmd_run(cli: &Cli, config: &CoderunConfig, command: RunCommands) -> Result<()> {
    let service = open_service(config)?;
    match command {
        RunCommands::Create {
            repo,
            request,
            user,
            thread,
        } => {
            let run = service.create_run(repo, &request, user, thread).await?;
            if cli.json {
                print_json(&run)?;
            } else {
                println!("{} run #{}", style("Created").green().bold(), run.id);
            }
        }
        RunCommands::Show { id } => {
            let detail = service.get_run_detail(id).await?;
            if cli.json {
                print_json(&detail)?;
            } else {
                print_detail(&detail);
            }
        }
        RunCommands::List { limit } => {
            let runs = service.list_runs(limit).await?;
            if cli.json {
                print_json(&runs)?;
            } else if runs.is_empty() {
                println!("No runs yet. Use 'coderun run create'.");
            } else {
                println!("{:<5} {:<6} {:<12} {:<20} Request", "Id", "Repo", "Status", "Created");
                println!("{:<5} {:<6} {:<12} {:<20} -------", "-----", "------", "------------", "--------------------");
                for run in &runs {
                    println!(
                        "{:<5} {:<6} {:<12} {:<20} {}",
                        run.id,
                        run.repo_id,
                        status_label(run.status),
                        run.created_at,
                        first_line(&run.request_text, 50)
                    );
                }
            }
        }
        RunCommands::Plan { id } => phase(cli, &service, id, Phase::Plan).await?,
        RunCommands::Code { id } => phase(cli, &service, id, Phase::Code).await?,
        RunCommands::Review { id } => phase(cli, &service, id, Phase::Review).await?,
        RunCommands::Apply { id } => phase(cli, &service, id, Phase::Apply).await?,
        RunCommands::Rollback { id } => phase(cli, &service, id, Phase::Rollback).await?,
        RunCommands::Advance { id } => {
            let run = service.get_run(id).await?;
            let Some(next) = coderun::runs::state::next_phase(&run) else {
                anyhow::bail!("Run #{} is {} and has no phase left to run", id, run.status);
            };
            phase(cli, &service, id, next).await?;
        }
        RunCommands::Cancel { id, reason } => {
            let run = service.cancel(id, &reason).await?;
            if cli.json {
                print_json(&run)?;
            } else {
                println!("Run #{} {}", run.id, status_label(run.status));
            }
        }
        RunCommands::Enqueue { id } => {
            let job = service.enqueue(id).await?;
            if cli.json {
                print_json(&job)?;
            } else {
                println!(
                    "Queued job #{} ({}) for run #{} at {}",
                    job.id,
                    job.job_type,
                    id,
                    fmt_ms(job.scheduled_at)
                );
            }
        }
    }
    Ok(())
}

async fn phase(cli: &Cli, service: &coderun::RunService, id: i64, phase: Phase) -> Result<()> {
    if !cli.json {
        println!("{} {} for run #{}...", style("Running").cyan().bold(), phase, id);
    }
    let run = service.advance_phase(id, phase).await?;
    if cli.json {
        return print_json(&run);
    }
    print_run(&run);
    Ok(())
}

fn print_detail(detail: &RunDetail) {
    print_run(&detail.run);
    if detail.steps.is_empty() {
        return;
    }
    println!();
    println!("{}", style("Steps").bold());
    for step in &detail.steps {
        let tokens = step.usage.input_tokens + step.usage.output_tokens;
        print!("  {:<9} {:<10} {}", step.phase.as_str(), step.status.as_str(), step.started_at);
        if tokens > 0 {
            print!("  {} tokens", tokens);
        }
        println!();
        if let Some(err) = &step.error_message {
            println!("            {}", style(err).red());
        }
    }
}

fn print_run(run: &Run) {
    println!();
    println!(
        "{} #{} (repo #{})  {}",
        style("Run").bold(),
        run.id,
        run.repo_id,
        status_label(run.status)
    );
    println!("  Request: {}", first_line(&run.request_text, 72));
    if let Some(plan) = &run.plan_artifact {
        println!("  Plan:    {}", first_line(&plan.summary, 72));
        for (i, step) in plan.steps.iter().enumerate() {
            println!("           {}. {}", i + 1, step);
        }
    }
    if let Some(diff) = &run.diff_content {
        println!("  Diff:    {} lines", diff.lines().count());
    }
    if let Some(review) = &run.review_result {
        let verdict = if review.safe_to_apply {
            style("safe").green()
        } else {
            style("unsafe").red()
        };
        println!(
            "  Review:  {} (risk: {}) {}",
            verdict,
            review.risk_level.as_str(),
            first_line(&review.summary, 60)
        );
        for issue in &review.issues {
            let location = issue.file.as_deref().unwrap_or("-");
            println!(
                "           [{}] {} {}",
                issue.severity.as_str(),
                location,
                issue.message
            );
        }
    }
    if let Some(report) = &run.apply_report {
        for file in &report.files {
            println!("  {:?} {} ({:?})", file.status, file.path, file.change);
        }
    }
    if let Some(commit) = &run.git_checkpoint {
        println!("  Checkpoint: {}", short(commit));
    }
    if let Some(commit) = &run.applied_commit {
        println!("  Applied:    {}", short(commit));
    }
    if let Some(err) = &run.error_message {
        println!("  {} {}", style("Error:").red().bold(), err);
    }
    println!("  Updated: {}", run.updated_at);
}

fn status_label(status: RunStatus) -> console::StyledObject<&'static str> {
    let label = style(status.as_str());
    match status {
        RunStatus::Completed | RunStatus::Ready => label.green(),
        RunStatus::Failed => label.red().bold(),
        RunStatus::RolledBack => label.dim(),
        _ => label.yellow(),
    }
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}
