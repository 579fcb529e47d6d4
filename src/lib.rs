pub mod apply;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod errors;
pub mod lock;
pub mod logging;
pub mod phases;
pub mod queue;
pub mod runs;
pub mod safety;

pub use errors::{CheckpointError, DiffError, QueueError, RunError, ServiceError};
pub use runs::RunService;
