//! Diff application: parsing, path policy, atomic writes and backups.

pub mod applier;
pub mod backup;
pub mod diff;

pub use applier::{AppliedChanges, ApplyOutcome, ApplyReport, DiffApplier, FileResult, FileStatus};
pub use backup::BackupStore;
pub use diff::{ChangeKind, FilePatch};
