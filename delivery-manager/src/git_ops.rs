//! Git and worktree plumbing for delivery pipelines.
//!
//! A small, explicit wrapper around `git` subprocess calls. Each pipeline run
//! gets an exclusive worktree so concurrent inspection of the project
//! checkout never collides with agent work; dual-worker phases additionally
//! get one branch and worktree per worker, merged back when the phase joins.

use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound on concurrent workers within one phase. Merge handling is
/// defined for simple two-way merges; wider fan-out is not supported.
pub const MAX_PHASE_WORKERS: usize = 2;

/// Result of folding phase worker branches back into the feature branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub clean: bool,
    /// Paths still carrying conflict markers, for the reviewer to resolve.
    pub conflicts: Vec<String>,
}

/// One worker's isolated workspace within a phase.
#[derive(Debug, Clone)]
pub struct PhaseWorkspace {
    pub branch: String,
    pub dir: PathBuf,
}

/// Git operations rooted at one project checkout.
#[derive(Debug, Clone)]
pub struct GitOps {
    root: PathBuf,
}

impl GitOps {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fail unless the project root is inside a git repository.
    pub async fn ensure_repo(&self) -> Result<()> {
        let out = self
            .run(&self.root, &["rev-parse", "--is-inside-work-tree"])
            .await?;
        if !out.status.success() {
            bail!("{} is not a git repository", self.root.display());
        }
        Ok(())
    }

    /// Warn (non-fatal) when the checkout has uncommitted changes. Agents
    /// commit their own work; pre-existing dirt is the operator's business.
    pub async fn ensure_clean(&self) -> Result<()> {
        let out = self
            .run_capture(&self.root, &["status", "--porcelain"])
            .await?;
        let dirty = out.lines().filter(|l| !l.trim().is_empty()).count();
        if dirty > 0 {
            warn!(
                path = %self.root.display(),
                files = dirty,
                "checkout has uncommitted changes, continuing anyway"
            );
        }
        Ok(())
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String> {
        let out = self
            .run_capture(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Create (or reuse) the feature branch for a delivery slug. Idempotent:
    /// an existing branch is returned as-is, not recreated.
    pub async fn create_feature_branch(&self, slug: &str) -> Result<String> {
        let branch = format!("delivery/{}", slug);
        if self.branch_exists(&branch).await? {
            debug!(%branch, "feature branch already exists");
        } else {
            self.run_checked(&self.root, &["branch", &branch]).await?;
            info!(%branch, "created feature branch");
        }
        Ok(branch)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        let out = self
            .run(&self.root, &["show-ref", "--verify", "--quiet", &refname])
            .await?;
        Ok(out.status.success())
    }

    /// Set up the pipeline's exclusive worktree on the feature branch. A
    /// leftover worktree from a previous run at the same path is removed
    /// first, so reuse never inherits stale state.
    pub async fn setup_worktree(&self, slug: &str, branch: &str) -> Result<PathBuf> {
        let dir = self.worktree_dir(slug);
        if dir.exists() {
            self.cleanup_worktree(&dir).await;
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create worktree parent {}", parent.display()))?;
        }
        let dir_str = path_arg(&dir)?;
        self.run_checked(&self.root, &["worktree", "add", dir_str, branch])
            .await?;
        info!(dir = %dir.display(), %branch, "worktree ready");
        Ok(dir)
    }

    /// Remove a worktree. Best-effort: a failure here leaves garbage on disk
    /// but never blocks the pipeline outcome.
    pub async fn cleanup_worktree(&self, dir: &Path) {
        let dir_str = match path_arg(dir) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "skipping worktree cleanup");
                return;
            }
        };
        let removed = self
            .run(&self.root, &["worktree", "remove", "--force", dir_str])
            .await;
        match removed {
            Ok(out) if out.status.success() => debug!(dir = %dir.display(), "worktree removed"),
            Ok(out) => warn!(
                dir = %dir.display(),
                err = %String::from_utf8_lossy(&out.stderr).trim(),
                "worktree removal failed"
            ),
            Err(e) => warn!(dir = %dir.display(), err = %e, "worktree removal failed"),
        }
        if let Err(e) = self.run(&self.root, &["worktree", "prune"]).await {
            warn!(err = %e, "worktree prune failed");
        }
    }

    /// Create one branch + worktree per phase worker, forked from the tip of
    /// the feature branch. Supports at most [`MAX_PHASE_WORKERS`].
    pub async fn setup_phase_branches(
        &self,
        slug: &str,
        base_branch: &str,
        phase: usize,
        workers: usize,
    ) -> Result<Vec<PhaseWorkspace>> {
        if workers > MAX_PHASE_WORKERS {
            bail!(
                "phase {} requests {} workers, at most {} supported",
                phase,
                workers,
                MAX_PHASE_WORKERS
            );
        }
        let mut workspaces = Vec::with_capacity(workers);
        for worker in 1..=workers {
            let branch = format!("{}/phase-{}-w{}", base_branch, phase, worker);
            let dir = self.worktree_dir(&format!("{}-phase-{}-w{}", slug, phase, worker));
            if dir.exists() {
                self.cleanup_worktree(&dir).await;
            }
            if self.branch_exists(&branch).await? {
                self.run_checked(&self.root, &["branch", "-f", &branch, base_branch])
                    .await?;
            } else {
                self.run_checked(&self.root, &["branch", &branch, base_branch])
                    .await?;
            }
            let dir_str = path_arg(&dir)?;
            self.run_checked(&self.root, &["worktree", "add", dir_str, &branch])
                .await?;
            workspaces.push(PhaseWorkspace { branch, dir });
        }
        Ok(workspaces)
    }

    /// Merge phase worker branches into the feature branch inside the main
    /// pipeline worktree. A conflicted merge is committed with its markers
    /// left in place and reported, not rolled back: the reviewer resolves.
    pub async fn merge_phase_branches(
        &self,
        workdir: &Path,
        branches: &[String],
    ) -> Result<MergeOutcome> {
        let mut conflicts = Vec::new();
        for branch in branches {
            let message = format!("Merge {}", branch);
            let merged = self
                .run(
                    workdir,
                    &["merge", "--no-ff", "-m", &message, branch],
                )
                .await?;
            if merged.status.success() {
                continue;
            }
            let conflicted = self
                .run_capture(workdir, &["diff", "--name-only", "--diff-filter=U"])
                .await?;
            let files: Vec<String> = conflicted
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect();
            if files.is_empty() {
                // Not a content conflict: a real merge failure.
                bail!(
                    "merging {} failed: {}",
                    branch,
                    String::from_utf8_lossy(&merged.stderr).trim()
                );
            }
            warn!(%branch, files = files.len(), "merge conflict, committing markers for review");
            self.run_checked(workdir, &["add", "-A"]).await?;
            let conflict_message = format!("Merge {} (unresolved conflicts)", branch);
            self.run_checked(workdir, &["commit", "-m", &conflict_message])
                .await?;
            conflicts.extend(files);
        }
        conflicts.sort();
        conflicts.dedup();
        Ok(MergeOutcome {
            clean: conflicts.is_empty(),
            conflicts,
        })
    }

    /// Stage and commit everything in a worktree. Returns `false` (and does
    /// nothing) when there is nothing to commit.
    pub async fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool> {
        self.run_checked(workdir, &["add", "-A"]).await?;
        let staged = self
            .run_capture(workdir, &["diff", "--cached", "--name-only"])
            .await?;
        if staged.trim().is_empty() {
            return Ok(false);
        }
        self.run_checked(workdir, &["commit", "-m", message]).await?;
        Ok(true)
    }

    /// Push the feature branch and open a pull request with `gh`. When no
    /// remote or no `gh` is available this degrades to push-only (or
    /// nothing), returning `None` rather than failing the pipeline.
    pub async fn create_pull_request(
        &self,
        workdir: &Path,
        branch: &str,
        title: &str,
    ) -> Result<Option<String>> {
        let pushed = self
            .run(workdir, &["push", "-u", "origin", branch])
            .await?;
        if !pushed.status.success() {
            warn!(
                %branch,
                err = %String::from_utf8_lossy(&pushed.stderr).trim(),
                "push failed, leaving branch local"
            );
            return Ok(None);
        }

        let gh = Command::new("gh")
            .args([
                "pr",
                "create",
                "--title",
                title,
                "--body",
                "Automated delivery pipeline run.",
                "--head",
                branch,
            ])
            .current_dir(workdir)
            .output()
            .await;
        match gh {
            Ok(out) if out.status.success() => {
                let url = String::from_utf8_lossy(&out.stdout).trim().to_string();
                info!(%url, "pull request created");
                Ok(Some(url))
            }
            Ok(out) => {
                warn!(
                    err = %String::from_utf8_lossy(&out.stderr).trim(),
                    "gh pr create failed, branch pushed without a pull request"
                );
                Ok(None)
            }
            Err(e) => {
                debug!(err = %e, "gh unavailable, branch pushed without a pull request");
                Ok(None)
            }
        }
    }

    fn worktree_dir(&self, name: &str) -> PathBuf {
        self.root.join(".delivery").join("worktrees").join(name)
    }

    async fn run_capture(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = self.run_checked(dir, args).await?;
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    async fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let out = self.run(dir, args).await?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(out)
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-UTF8 path {}", path.display()))
}
