//! Workspace isolation and integration.
//!
//! Each assigned worker gets its own checkout: a git worktree under
//! `worktrees/worker-<id>` on branch `weaver/<story-id>`, derived from the
//! base branch. On story completion the branch is rebased onto the current
//! base and squash-merged, keeping base history linear. Conflicts are not
//! resolved automatically — the scheduler turns them into a scheduled
//! conflict-resolution step.

use crate::git::Git;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Directory under the project root that holds per-worker worktrees.
pub const WORKTREE_DIR: &str = "worktrees";

/// Outcome of an integration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationOutcome {
    /// Rebase + squash merge landed on the base branch
    Merged,
    /// Rebase or merge hit a conflict; a resolution step is needed
    Conflict,
}

/// Manages per-worker isolated checkouts of the project repository.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    project_dir: PathBuf,
    base_branch: String,
}

impl WorkspaceManager {
    /// Capture the current branch of `project_dir` as the integration base.
    pub fn new(project_dir: impl Into<PathBuf>) -> Result<Self> {
        let project_dir = project_dir.into();
        let base_branch = Git::new(&project_dir)
            .current_branch()
            .context("determine base branch for workspace integration")?;
        Ok(Self {
            project_dir,
            base_branch,
        })
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn worktree_path(&self, worker_id: u32) -> PathBuf {
        self.project_dir.join(WORKTREE_DIR).join(format!("worker-{worker_id}"))
    }

    fn branch_name(story_id: &str) -> String {
        format!("weaver/{story_id}")
    }

    /// Create a fresh worktree for a worker on a new story branch.
    ///
    /// Stale registrations from previous runs are pruned, leftover
    /// directories removed, and a pre-existing story branch deleted so the
    /// checkout always starts from the current base.
    pub fn create(&self, worker_id: u32, story_id: &str) -> Result<PathBuf> {
        let git = Git::new(&self.project_dir);
        let path = self.worktree_path(worker_id);
        let branch = Self::branch_name(story_id);

        std::fs::create_dir_all(self.project_dir.join(WORKTREE_DIR))
            .context("create worktrees directory")?;

        git.worktree_prune();
        git.worktree_remove(&path);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("remove stale worktree {}", path.display()))?;
        }
        git.branch_delete(&branch);

        git.worktree_add(&path, &branch, &self.base_branch)?;
        Ok(path)
    }

    /// Re-attach a worker slot to a story branch that survived an
    /// orchestrator restart, preserving committed step work. Falls back to a
    /// fresh checkout when no branch exists.
    pub fn create_or_attach(&self, worker_id: u32, story_id: &str) -> Result<PathBuf> {
        let git = Git::new(&self.project_dir);
        let branch = Self::branch_name(story_id);
        if !git.branch_exists(&branch) {
            return self.create(worker_id, story_id);
        }

        let path = self.worktree_path(worker_id);
        std::fs::create_dir_all(self.project_dir.join(WORKTREE_DIR))
            .context("create worktrees directory")?;
        git.worktree_prune();
        git.worktree_remove(&path);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("remove stale worktree {}", path.display()))?;
        }
        git.worktree_attach(&path, &branch)?;
        Ok(path)
    }

    /// Remove a worker's worktree registration and directory.
    pub fn remove(&self, worker_id: u32) {
        let git = Git::new(&self.project_dir);
        let path = self.worktree_path(worker_id);
        git.worktree_remove(&path);
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }
        git.worktree_prune();
    }

    /// Delete a story branch after integration (or abandonment).
    pub fn delete_branch(&self, story_id: &str) {
        Git::new(&self.project_dir).branch_delete(&Self::branch_name(story_id));
    }

    /// Integrate a completed story: rebase its branch onto the current base,
    /// then squash-merge with a conventional commit message.
    pub fn integrate(&self, worker_id: u32, story_id: &str) -> Result<IntegrationOutcome> {
        let branch = Self::branch_name(story_id);
        let worktree = Git::new(self.worktree_path(worker_id));
        let base = Git::new(&self.project_dir);

        if !worktree.rebase_onto(&self.base_branch)? {
            return Ok(IntegrationOutcome::Conflict);
        }
        if !base.merge_squash(&branch)? {
            return Ok(IntegrationOutcome::Conflict);
        }
        // An empty squash (story changed nothing) leaves nothing staged;
        // commit only when there is something to commit.
        if base
            .commit(&format!("{story_id} (squash merge from {branch})"))
            .is_err()
        {
            let status = std::process::Command::new("git")
                .args(["diff", "--cached", "--quiet"])
                .current_dir(&self.project_dir)
                .status()
                .context("check staged changes after squash")?;
            if !status.success() {
                anyhow::bail!("commit of squash merge for {story_id} failed");
            }
        }
        Ok(IntegrationOutcome::Merged)
    }

    /// Save uncommitted work from a workspace to a diagnostic path, then
    /// reset it hard to `rev`. Used on failures and during reconciliation.
    pub fn salvage_and_reset(&self, workdir: &Path, rev: &str, diff_path: &Path) -> Result<()> {
        let git = Git::new(workdir);
        git.save_diff(rev, diff_path)?;
        git.reset_hard(rev)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.name", "test"],
            vec!["config", "user.email", "t@t.dev"],
        ] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
        }
        std::fs::write(dir.join("base.txt"), "base\n").unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", "init"]] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
        }
    }

    fn commit_in(dir: &Path, name: &str, content: &str, msg: &str) {
        std::fs::write(dir.join(name), content).unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", msg]] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
        }
    }

    #[test]
    fn test_create_integrate_remove_cycle() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        assert_eq!(manager.base_branch(), "main");

        let wt = manager.create(1, "US-001").unwrap();
        assert!(wt.join("base.txt").exists());

        commit_in(&wt, "feature.txt", "feature\n", "story work");

        let outcome = manager.integrate(1, "US-001").unwrap();
        assert_eq!(outcome, IntegrationOutcome::Merged);
        assert!(dir.path().join("feature.txt").exists());

        manager.remove(1);
        manager.delete_branch("US-001");
        assert!(!wt.exists());
    }

    #[test]
    fn test_create_is_idempotent_across_stale_state() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let manager = WorkspaceManager::new(dir.path()).unwrap();

        let first = manager.create(1, "US-001").unwrap();
        assert!(first.exists());
        // recreate for a different story on the same slot without cleanup
        let second = manager.create(1, "US-002").unwrap();
        assert_eq!(first, second);
        assert!(second.join("base.txt").exists());
        manager.remove(1);
    }

    #[test]
    fn test_integrate_conflict_reported_not_resolved() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let manager = WorkspaceManager::new(dir.path()).unwrap();

        let wt = manager.create(1, "US-001").unwrap();
        commit_in(&wt, "base.txt", "worker version\n", "conflicting work");
        commit_in(dir.path(), "base.txt", "base version\n", "base moved on");

        let outcome = manager.integrate(1, "US-001").unwrap();
        assert_eq!(outcome, IntegrationOutcome::Conflict);
        // base left clean
        assert_eq!(
            std::fs::read_to_string(dir.path().join("base.txt")).unwrap(),
            "base version\n"
        );
        manager.remove(1);
        manager.delete_branch("US-001");
    }

    #[test]
    fn test_salvage_and_reset_preserves_diff() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let rev = Git::new(dir.path()).head_rev().unwrap();

        std::fs::write(dir.path().join("base.txt"), "dirty\n").unwrap();
        let diff_path = dir.path().join("salvage.diff");
        manager
            .salvage_and_reset(dir.path(), &rev, &diff_path)
            .unwrap();

        let diff = std::fs::read_to_string(&diff_path).unwrap();
        assert!(diff.contains("+dirty"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("base.txt")).unwrap(),
            "base\n"
        );
    }
}
