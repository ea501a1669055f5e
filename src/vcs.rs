use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("failed to run `git {args}`: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`git {args}` failed: {stderr}")]
    Command { args: String, stderr: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { hash: String },
    NothingToCommit,
    NoRepository,
}

/// Narrow port for committing collected artifacts. "Not a repository" and
/// "nothing to commit" are successful outcomes, not errors.
#[async_trait]
pub trait VersionControlPort: Send + Sync {
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), VcsError>;
    async fn commit(&self, message: &str) -> Result<CommitOutcome, VcsError>;
}

/// Adapter over the `git` binary, run in the store's working directory.
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, VcsError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .map_err(|source| VcsError::Spawn {
                args: args.join(" "),
                source,
            })
    }

    async fn is_repository(&self) -> bool {
        match self.git(&["rev-parse", "--is-inside-work-tree"]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl VersionControlPort for GitCli {
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), VcsError> {
        if !self.is_repository().await {
            return Ok(());
        }
        let mut existing = Vec::new();
        for path in paths {
            if path.exists() {
                existing.push(path_arg(path));
            }
        }
        if existing.is_empty() {
            return Ok(());
        }

        let mut args = vec!["add".to_string()];
        args.extend(existing);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.git(&arg_refs).await?;
        if !output.status.success() {
            return Err(VcsError::Command {
                args: arg_refs.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<CommitOutcome, VcsError> {
        if !self.is_repository().await {
            tracing::warn!("Not a git repository; skipping commit");
            return Ok(CommitOutcome::NoRepository);
        }

        // Exit status 0 means the staging area is clean.
        let diff = self.git(&["diff", "--cached", "--quiet"]).await?;
        if diff.status.success() {
            return Ok(CommitOutcome::NothingToCommit);
        }

        let output = self.git(&["commit", "-m", message]).await?;
        if !output.status.success() {
            return Err(VcsError::Command {
                args: format!("commit -m {message}"),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let head = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(CommitOutcome::Committed {
            hash: String::from_utf8_lossy(&head.stdout).trim().to_string(),
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Port implementation for dry runs and tests.
pub struct NoopVcs;

#[async_trait]
impl VersionControlPort for NoopVcs {
    async fn stage(&self, _paths: &[PathBuf]) -> Result<(), VcsError> {
        Ok(())
    }

    async fn commit(&self, _message: &str) -> Result<CommitOutcome, VcsError> {
        Ok(CommitOutcome::NothingToCommit)
    }
}
