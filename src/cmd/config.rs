//! Configuration view and validation commands: `coderun config`.

use anyhow::Result;
use coderun::config::CoderunConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &CoderunConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_path();
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No coderun.toml at {} (using defaults)", config_path.display());
            }
            println!("Data dir:    {}", config.data_dir.display());
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  {} {}", console::style("⚠").yellow(), warning);
                }
            }
            println!();
        }
    }
    Ok(())
}
