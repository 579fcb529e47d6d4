//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `init`   | `Init`           |
//! | `config` | `Config`         |
//! | `repo`   | `Repo`           |
//! | `run`    | `Run`            |
//! | `worker` | `Worker`         |
//! | `queue`  | `Queue`          |

pub mod config;
pub mod init;
pub mod queue;
pub mod repo;
pub mod run;
pub mod worker;

pub use config::cmd_config;
pub use init::cmd_init;
pub use queue::cmd_queue;
pub use repo::cmd_repo;
pub use run::cmd_run;
pub use worker::cmd_worker;

use std::sync::Arc;

use anyhow::Result;
use coderun::RunService;
use coderun::config::CoderunConfig;
use coderun::phases::ClaudeCli;
use serde::Serialize;

/// Wire a `RunService` backed by the `claude` CLI from the effective config.
pub(crate) fn open_service(config: &CoderunConfig) -> Result<RunService> {
    let reasoner = Arc::new(ClaudeCli::from_config(&config.toml.reasoning));
    RunService::from_config(config, reasoner)
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render epoch milliseconds as local time.
pub(crate) fn fmt_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}
