//! Artifact publishing and coverage reporting

use crate::runtime::RunnerError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Publishes artifact bytes under a name, returning where they landed
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, bytes: Vec<u8>, name: &str) -> Result<String, RunnerError>;
}

/// Uploads a coverage report
#[async_trait]
pub trait CoverageReporter: Send + Sync {
    async fn upload(&self, report: Vec<u8>, name: &str) -> Result<(), RunnerError>;
}

/// Stores artifacts and coverage reports under a local directory
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn write(&self, relative: &Path, bytes: &[u8]) -> Result<PathBuf, RunnerError> {
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(RunnerError::Publish(format!(
                "invalid artifact name '{}'",
                relative.display()
            )));
        }

        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;

        Ok(std::path::absolute(&target).unwrap_or(target))
    }
}

#[async_trait]
impl ArtifactPublisher for DirectoryPublisher {
    async fn publish(&self, bytes: Vec<u8>, name: &str) -> Result<String, RunnerError> {
        let path = self.write(&Path::new("artifacts").join(name), &bytes).await?;
        info!("Published artifact {} ({} bytes)", name, bytes.len());
        Ok(format!("file://{}", path.display()))
    }
}

#[async_trait]
impl CoverageReporter for DirectoryPublisher {
    async fn upload(&self, report: Vec<u8>, name: &str) -> Result<(), RunnerError> {
        self.write(&Path::new("coverage").join(name), &report).await?;
        info!("Stored coverage report {}", name);
        Ok(())
    }
}
