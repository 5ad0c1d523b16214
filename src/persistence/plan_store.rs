use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{read_optional, validate_module, PersistenceError};
use crate::collaborators::PlanStore;

/// Plan documents at `<plan_dir>/<module>.plan.md`
#[derive(Debug, Clone)]
pub struct FilePlanStore {
    plan_dir: PathBuf,
}

impl FilePlanStore {
    pub fn new(plan_dir: impl Into<PathBuf>) -> Self {
        Self {
            plan_dir: plan_dir.into(),
        }
    }

    pub fn plan_path(&self, module: &str) -> Result<PathBuf, PersistenceError> {
        validate_module(module)?;
        Ok(self.plan_dir.join(format!("{module}.plan.md")))
    }

    pub async fn read_plan(&self, module: &str) -> Result<Option<String>, PersistenceError> {
        read_optional(&self.plan_path(module)?).await
    }

    /// Append `text` as a new entry separated by a blank line
    pub async fn append_plan(&self, module: &str, text: &str) -> Result<(), PersistenceError> {
        let path = self.plan_path(module)?;
        tokio::fs::create_dir_all(&self.plan_dir).await?;

        let existing = read_optional(&path).await?.unwrap_or_default();
        let mut entry = String::new();
        if !existing.is_empty() {
            if !existing.ends_with('\n') {
                entry.push('\n');
            }
            entry.push('\n');
        }
        entry.push_str(text.trim_end());
        entry.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;

        debug!(module = %module, file = ?path, bytes = entry.len(), "Plan entry appended");
        Ok(())
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn read(&self, module: &str) -> anyhow::Result<Option<String>> {
        Ok(self.read_plan(module).await?)
    }

    async fn append(&self, module: &str, text: &str) -> anyhow::Result<()> {
        Ok(self.append_plan(module, text).await?)
    }
}
