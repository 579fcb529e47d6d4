//! Runs: the records, their lifecycle and the service that drives them.

pub mod db;
pub mod models;
pub mod service;
pub mod state;

pub use models::{Phase, Repo, RepoPolicy, Run, RunDetail, RunStatus, RunStep};
pub use service::RunService;
