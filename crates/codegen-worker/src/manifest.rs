//! Generator that replays change records from a JSON manifest.
//!
//! The manifest is a JSON array of change records:
//!
//! ```json
//! [{"kind": "add", "path": "Controllers/HomeController.cs", "contents": "..."}]
//! ```
//!
//! Relative paths are resolved against the project root reported by the host.

use std::path::{Path, PathBuf};

use anyhow::Context;

use codegen_bridge::{FileSystemChange, GenerationError, Generator, ProjectDescription};

pub struct ManifestGenerator {
    manifest: Option<PathBuf>,
    simulation_mode: bool,
    expected_project: Option<PathBuf>,
}

impl ManifestGenerator {
    pub fn new(manifest: Option<PathBuf>) -> Self {
        Self {
            manifest,
            simulation_mode: false,
            expected_project: None,
        }
    }

    /// Tag every record's description as simulated.
    pub fn with_simulation_mode(mut self, simulation_mode: bool) -> Self {
        self.simulation_mode = simulation_mode;
        self
    }

    /// Project path given on the command line, compared against the host's root.
    pub fn with_expected_project(mut self, project: PathBuf) -> Self {
        self.expected_project = Some(project);
        self
    }

    fn load(&self, project: &ProjectDescription) -> anyhow::Result<Vec<FileSystemChange>> {
        let Some(manifest) = &self.manifest else {
            return Ok(Vec::new());
        };

        let text = std::fs::read_to_string(manifest)
            .with_context(|| format!("failed to read manifest {}", manifest.display()))?;
        let records: Vec<FileSystemChange> = serde_json::from_str(&text)
            .with_context(|| format!("invalid manifest {}", manifest.display()))?;

        Ok(records
            .into_iter()
            .map(|change| self.resolve(change, &project.root))
            .collect())
    }

    fn resolve(&self, mut change: FileSystemChange, root: &Path) -> FileSystemChange {
        if change.path.is_relative() {
            change.path = root.join(&change.path);
        }
        if self.simulation_mode {
            change.description = Some(match change.description.take() {
                Some(description) => format!("[simulation] {description}"),
                None => "[simulation]".to_string(),
            });
        }
        change
    }
}

#[async_trait::async_trait]
impl Generator for ManifestGenerator {
    async fn generate(
        &self,
        project: &ProjectDescription,
        configuration: &str,
    ) -> Result<Vec<FileSystemChange>, GenerationError> {
        if let Some(expected) = &self.expected_project
            && !expected.starts_with(&project.root)
        {
            tracing::warn!(
                expected = %expected.display(),
                root = %project.root.display(),
                "Host project root differs from the requested project"
            );
        }

        let changes = self
            .load(project)
            .map_err(|e| GenerationError::new(format!("{e:#}")))?;
        tracing::info!(
            count = changes.len(),
            %configuration,
            simulation_mode = self.simulation_mode,
            "Loaded changes from manifest"
        );
        Ok(changes)
    }
}
