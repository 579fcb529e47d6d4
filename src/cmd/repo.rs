//! Repository registration: `coderun repo`.

use anyhow::Result;
use coderun::config::CoderunConfig;
use coderun::runs::Repo;

use super::super::{Cli, RepoCommands};
use super::{open_service, print_json};

pub async fn cmd_repo(cli: &Cli, config: &CoderunConfig, command: RepoCommands) -> Result<()> {
    let service = open_service(config)?;
    match command {
        RepoCommands::Add { path, name, allow } => {
            let name = name.unwrap_or_else(|| {
                path.canonicalize()
                    .ok()
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .unwrap_or_else(|| "repo".to_string())
            });
            let repo = service.register_repo(&name, &path, allow).await?;
            if cli.json {
                print_json(&repo)?;
            } else {
                println!(
                    "{} repo #{} {} at {}",
                    console::style("Registered").green().bold(),
                    repo.id,
                    repo.name,
                    repo.base_path
                );
            }
        }
        RepoCommands::List => {
            let repos = service.list_repos().await?;
            if cli.json {
                print_json(&repos)?;
            } else if repos.is_empty() {
                println!("No repositories registered. Use 'coderun repo add <path>'.");
            } else {
                println!("{:<5} {:<20} {:<10} Path", "Id", "Name", "Flags");
                println!("{:<5} {:<20} {:<10} ----", "-----", "--------------------", "----------");
                for repo in &repos {
                    println!(
                        "{:<5} {:<20} {:<10} {}",
                        repo.id,
                        repo.name,
                        flags(repo),
                        repo.base_path
                    );
                }
            }
        }
        RepoCommands::Set {
            id,
            read_only,
            maintenance_locked,
        } => {
            let repo = service.set_repo_flags(id, read_only, maintenance_locked).await?;
            if cli.json {
                print_json(&repo)?;
            } else {
                println!("Repo #{} flags: {}", repo.id, flags(&repo));
            }
        }
    }
    Ok(())
}

fn flags(repo: &Repo) -> String {
    match (repo.read_only, repo.maintenance_locked) {
        (false, false) => "-".to_string(),
        (true, false) => "ro".to_string(),
        (false, true) => "locked".to_string(),
        (true, true) => "ro,locked".to_string(),
    }
}
