//! `coderun init`.

use anyhow::{Context, Result};
use coderun::config::{CoderunConfig, CoderunToml};
use coderun::db::Db;

pub fn cmd_init(config: &CoderunConfig) -> Result<()> {
    let data_dir = &config.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    for dir in [config.backups_dir(), config.locks_dir(), config.log_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let config_path = config.config_path();
    if config_path.exists() {
        println!("Keeping existing {}", config_path.display());
    } else {
        CoderunToml::default().save(&config_path)?;
        println!("Created {}", config_path.display());
    }

    Db::open(&config.db_path())?;
    println!(
        "{} coderun in {}",
        console::style("Initialized").green().bold(),
        data_dir.display()
    );
    Ok(())
}
