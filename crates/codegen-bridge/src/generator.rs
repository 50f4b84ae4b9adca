//! Boundary to the code-generation logic.
//!
//! The session treats generation as an opaque step: given the project
//! description and a configuration name it yields an ordered, finite list of
//! file-system changes, or fails with an exit code to report.

use std::future::Future;

use crate::bridge::protocol::{FileSystemChange, ProjectDescription};

/// Exit code used when a generator does not pick one.
pub const DEFAULT_GENERATION_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generation failed: {message}")]
pub struct GenerationError {
    pub message: String,
    exit_code: i32,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: DEFAULT_GENERATION_EXIT_CODE,
        }
    }

    /// Set the process exit code. Zero would read as success, so it maps to the default.
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = if exit_code == 0 {
            DEFAULT_GENERATION_EXIT_CODE
        } else {
            exit_code
        };
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        project: &ProjectDescription,
        configuration: &str,
    ) -> Result<Vec<FileSystemChange>, GenerationError>;
}

/// Adapts an async closure into a [`Generator`].
pub struct FnGenerator<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(ProjectDescription, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<FileSystemChange>, GenerationError>> + Send + 'static,
{
    async fn generate(
        &self,
        project: &ProjectDescription,
        configuration: &str,
    ) -> Result<Vec<FileSystemChange>, GenerationError> {
        (self.0)(project.clone(), configuration.to_string()).await
    }
}
