use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::types::{Task, TaskId};

const FALLBACK_USER_NAME: &str = "squadron";
const FALLBACK_USER_EMAIL: &str = "squadron@localhost";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git {op} failed: {stderr}")]
    GitCommand { op: &'static str, stderr: String },
    #[error("failed to run git: {0}")]
    Spawn(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree already exists: {0}")]
    AlreadyExists(String),
    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// MergeResult
// ---------------------------------------------------------------------------

/// Outcome of merging a task branch into the target branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeResult {
    Success,
    /// The merge was aborted; these paths conflicted.
    Conflict(Vec<String>),
    /// The branch has no commits the target lacks.
    NothingToMerge,
}

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI invocations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Source-control adapter: worktree lifecycle, commits and merges for one
/// repository.
///
/// Worktrees live under `base_dir`, which is usually outside the repository
/// so agents never see each other's copies.
pub struct WorktreeManager {
    repo_dir: PathBuf,
    base_dir: PathBuf,
    git: Box<dyn GitRunner>,
}

impl WorktreeManager {
    /// Create a manager backed by the real git binary.
    pub fn new(repo_dir: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self::with_git_runner(repo_dir, base_dir, Box::new(RealGitRunner))
    }

    /// Create a manager with a custom git runner (for testing).
    pub fn with_git_runner(
        repo_dir: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            base_dir: base_dir.into(),
            git,
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn git(&self, dir: &Path, op: &'static str, args: &[&str]) -> Result<GitOutput> {
        debug!(dir = %dir.display(), ?args, "git");
        let output = self.git.run_git(dir, args).map_err(WorktreeError::Spawn)?;
        if output.success {
            Ok(output)
        } else {
            Err(WorktreeError::GitCommand {
                op,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Branch checked out in the main working tree.
    pub fn current_branch(&self) -> Result<String> {
        let out = self.git(
            &self.repo_dir,
            "rev-parse",
            &["rev-parse", "--abbrev-ref", "HEAD"],
        )?;
        Ok(out.stdout.trim().to_string())
    }

    /// `true` when `dir` has no staged, unstaged or untracked changes.
    pub fn is_clean(&self, dir: &Path) -> Result<bool> {
        let out = self.git(dir, "status", &["status", "--porcelain"])?;
        Ok(out.stdout.trim().is_empty())
    }

    /// Directory a task's worktree is created in.
    pub fn worktree_path_for(&self, task: &Task) -> PathBuf {
        self.base_dir
            .join(format!("task-{}-{}", task.short_id(), sanitize_name(&task.title)))
    }

    /// Branch name for a task: `squadron/<short-id>-<slug>`.
    pub fn branch_for(&self, task: &Task) -> String {
        format!("squadron/{}-{}", task.short_id(), sanitize_name(&task.title))
    }

    /// `git worktree add -b <branch> <path> HEAD`.
    pub fn create_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeInfo> {
        if path.exists() {
            return Err(WorktreeError::AlreadyExists(path.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let base_branch = self.current_branch()?;
        let path_str = path_str(path)?;

        info!(branch, worktree = %path.display(), base = %base_branch, "creating worktree");
        self.git(
            &self.repo_dir,
            "worktree add",
            &["worktree", "add", "-b", branch, path_str, "HEAD"],
        )?;

        Ok(WorktreeInfo {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            base_branch,
            task_id: None,
            created_at: Utc::now(),
        })
    }

    /// Remove a worktree directory and its administrative entry.
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path_str(path)?;
        info!(worktree = %path.display(), "removing worktree");
        let removed = self.git(
            &self.repo_dir,
            "worktree remove",
            &["worktree", "remove", "--force", path_str],
        );
        if let Err(e) = removed {
            if path.exists() {
                return Err(e);
            }
            debug!(worktree = %path.display(), "worktree directory already gone");
        }
        if let Err(e) = self.git(&self.repo_dir, "worktree prune", &["worktree", "prune"]) {
            warn!(error = %e, "git worktree prune failed");
        }
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git(&self.repo_dir, "branch -D", &["branch", "-D", branch])?;
        Ok(())
    }

    /// Stage everything in `worktree` and commit. Returns `false` when there
    /// was nothing to commit.
    pub fn commit_all(&self, worktree: &Path, message: &str) -> Result<bool> {
        self.git(worktree, "add", &["add", "-A"])?;
        if self.is_clean(worktree)? {
            debug!(worktree = %worktree.display(), "nothing to commit");
            return Ok(false);
        }
        let mut args = self.identity_args(worktree);
        args.extend(["commit".to_string(), "-m".to_string(), message.to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(worktree, "commit", &args)?;
        info!(worktree = %worktree.display(), "committed changes");
        Ok(true)
    }

    /// Merge `branch` into `into` inside the main working tree.
    ///
    /// On conflict the merge is aborted, leaving `into` untouched, and the
    /// conflicting paths are returned. If neither `merge --abort` nor
    /// `reset --merge` can restore the checkout, that failure is returned.
    pub fn merge_branch(&self, branch: &str, into: &str) -> Result<MergeResult> {
        info!(branch, into, "attempting merge");

        if self.current_branch()? != into {
            self.git(&self.repo_dir, "checkout", &["checkout", into])?;
        }

        let range = format!("{into}..{branch}");
        let ahead = self.git(&self.repo_dir, "rev-list", &["rev-list", "--count", &range])?;
        if ahead.stdout.trim() == "0" {
            info!(branch, "nothing to merge");
            return Ok(MergeResult::NothingToMerge);
        }

        let merge = self
            .git
            .run_git(
                &self.repo_dir,
                &["merge", "--no-ff", "--no-commit", branch],
            )
            .map_err(WorktreeError::Spawn)?;

        if merge.success {
            let message = format!("Merge branch '{branch}' into {into}");
            let mut args = self.identity_args(&self.repo_dir);
            args.extend(["commit".to_string(), "-m".to_string(), message]);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.git(&self.repo_dir, "commit", &args)?;
            info!(branch, into, "merge successful");
            return Ok(MergeResult::Success);
        }

        let conflicts = match self.git.run_git(
            &self.repo_dir,
            &["diff", "--name-only", "--diff-filter=U"],
        ) {
            Ok(out) if out.success && !out.stdout.trim().is_empty() => out
                .stdout
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            _ => merge
                .stderr
                .lines()
                .chain(merge.stdout.lines())
                .filter(|l| l.contains("CONFLICT"))
                .map(str::to_string)
                .collect(),
        };
        if let Err(e) = self.git(&self.repo_dir, "merge --abort", &["merge", "--abort"]) {
            warn!(branch, error = %e, "merge --abort failed; resetting merge state");
            if let Err(e) = self.git(&self.repo_dir, "reset --merge", &["reset", "--merge"]) {
                error!(branch, error = %e, "main checkout left mid-merge");
                return Err(e);
            }
        }

        warn!(branch, conflicts = ?conflicts, "merge conflicts detected");
        Ok(MergeResult::Conflict(conflicts))
    }

    /// `-c user.name=.. -c user.email=..` when the repository has no identity.
    fn identity_args(&self, dir: &Path) -> Vec<String> {
        let configured = self
            .git
            .run_git(dir, &["config", "user.email"])
            .map(|o| o.success && !o.stdout.trim().is_empty())
            .unwrap_or(false);
        if configured {
            Vec::new()
        } else {
            vec![
                "-c".into(),
                format!("user.name={FALLBACK_USER_NAME}"),
                "-c".into(),
                format!("user.email={FALLBACK_USER_EMAIL}"),
            ]
        }
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| WorktreeError::InvalidPath(path.display().to_string()))
}

/// Lower-case slug for directory and branch names, at most 40 chars.
pub fn sanitize_name(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let mut collapsed = String::with_capacity(slug.len());
    for c in slug.chars() {
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }
    let trimmed: String = collapsed.trim_matches('-').chars().take(40).collect();
    let trimmed = trimmed.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
