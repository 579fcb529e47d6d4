use std::collections::BTreeMap;

use async_trait::async_trait;

use super::context::RepoContext;
use crate::errors::ServiceError;
use crate::runs::models::{PlanArtifact, ReviewResult, Usage};

/// Repository-relative path → file content.
pub type FileContents = BTreeMap<String, String>;

/// A reasoning result together with the tokens it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Reasoned<T> {
    pub value: T,
    pub usage: Usage,
}

impl<T> Reasoned<T> {
    pub fn new(value: T, usage: Usage) -> Self {
        Self { value, usage }
    }
}

/// The model behind the plan, code and review phases.
/// Real implementation: `ClaudeCli`. Tests use scripted doubles.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Turn a change request into a structured plan.
    async fn plan(
        &self,
        request_text: &str,
        context: &RepoContext,
    ) -> Result<Reasoned<PlanArtifact>, ServiceError>;

    /// Produce a unified diff implementing `plan`, given the current contents
    /// of the files it names.
    async fn generate_code(
        &self,
        plan: &PlanArtifact,
        context: &RepoContext,
        files: &FileContents,
    ) -> Result<Reasoned<String>, ServiceError>;

    /// Judge whether `diff` is safe to apply.
    async fn review(
        &self,
        diff: &str,
        plan: &PlanArtifact,
        context: &RepoContext,
    ) -> Result<Reasoned<ReviewResult>, ServiceError>;
}
