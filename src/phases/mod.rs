//! Phase executors and the reasoning service they call.
//!
//! | Module      | Purpose                                              |
//! |-------------|------------------------------------------------------|
//! | `reasoning` | `ReasoningService` trait and its result types        |
//! | `context`   | Repository listing and file contents for prompts     |
//! | `claude`    | `ReasoningService` backed by the `claude` CLI        |
//! | `executors` | Plan, code, review, apply and rollback               |

pub mod claude;
pub mod context;
pub mod executors;
pub mod reasoning;

pub use claude::ClaudeCli;
pub use context::{RepoContext, read_files};
pub use executors::{PhaseExecutors, PhaseSettings};
pub use reasoning::{FileContents, Reasoned, ReasoningService};
