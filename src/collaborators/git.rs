use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{build::CheckoutBuilder, BranchType, Repository};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::GitWorkflowService;

/// Keeps each module's work on its own `<prefix>/<module>` branch
#[derive(Debug, Clone)]
pub struct Git2WorkflowService {
    repo_path: PathBuf,
    branch_prefix: String,
}

impl Git2WorkflowService {
    pub fn new(repo_path: impl Into<PathBuf>, branch_prefix: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    pub fn branch_name(&self, module: &str) -> String {
        let prefix = self.branch_prefix.trim_matches('/');
        if prefix.is_empty() {
            module.to_string()
        } else {
            format!("{prefix}/{module}")
        }
    }

    /// Create the branch from HEAD if missing, then switch to it
    fn ensure_branch_blocking(repo_path: &Path, branch: &str) -> Result<()> {
        let repo = Repository::discover(repo_path).context("Failed to open git repository")?;

        let exists = repo.find_branch(branch, BranchType::Local).is_ok();
        if !exists {
            let head = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .context("Repository has no commit to branch from")?;
            repo.branch(branch, &head, false)
                .with_context(|| format!("Failed to create branch '{branch}'"))?;
            info!(branch = %branch, from = %head.id(), "Created module branch");
        }

        let reference = format!("refs/heads/{branch}");
        let on_branch = repo
            .head()
            .ok()
            .and_then(|h| h.name().map(|n| n == reference))
            .unwrap_or(false);
        if on_branch {
            debug!(branch = %branch, "Already on module branch");
            return Ok(());
        }

        let target = repo
            .revparse_single(&reference)
            .with_context(|| format!("Branch '{branch}' has no target"))?;
        repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out '{branch}'"))?;
        repo.set_head(&reference)?;
        info!(branch = %branch, "Switched to module branch");
        Ok(())
    }
}

#[async_trait]
impl GitWorkflowService for Git2WorkflowService {
    async fn ensure_module_branch(&self, module: &str) -> Result<String> {
        let branch = self.branch_name(module);
        let repo_path = self.repo_path.clone();
        let name = branch.clone();

        // git2 is blocking and its Repository is not Sync
        tokio::task::spawn_blocking(move || Self::ensure_branch_blocking(&repo_path, &name))
            .await
            .context("Git task panicked")??;

        Ok(branch)
    }
}
