use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sq_core::config::Config;
use sq_core::types::{Task, TaskId};
use sq_core::worktree::{MergeResult, WorktreeInfo, WorktreeManager};
use tracing::{debug, info, warn};

use super::{MergeOutcome, ModeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationSettings {
    pub auto_merge: bool,
    pub keep_worktrees: bool,
}

impl IsolationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auto_merge: config.execution.auto_merge,
            keep_worktrees: config.execution.keep_worktrees,
        }
    }
}

// ---------------------------------------------------------------------------
// WorktreeIsolation
// ---------------------------------------------------------------------------

/// Worktree bookkeeping shared by the isolating modes.
///
/// Without a manager (the working directory is not a git repository) every
/// operation degrades to running in place.
pub struct WorktreeIsolation {
    manager: Option<Arc<WorktreeManager>>,
    settings: IsolationSettings,
    base_branch: Mutex<Option<String>>,
    /// Every worktree created and not yet removed, by path.
    live: Mutex<HashMap<PathBuf, WorktreeInfo>>,
    /// Worktrees of successful tasks waiting for `merge`.
    awaiting_merge: Mutex<HashMap<TaskId, WorktreeInfo>>,
    cleaned: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run a blocking git operation off the async runtime.
async fn blocking<T, F>(manager: &Arc<WorktreeManager>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&WorktreeManager) -> std::result::Result<T, sq_core::worktree::WorktreeError>
        + Send
        + 'static,
{
    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || f(&manager))
        .await
        .map_err(|e| ModeError::Join(e.to_string()))?
        .map_err(ModeError::from)
}

impl WorktreeIsolation {
    pub fn new(manager: Option<Arc<WorktreeManager>>, settings: IsolationSettings) -> Self {
        Self {
            manager,
            settings,
            base_branch: Mutex::new(None),
            live: Mutex::new(HashMap::new()),
            awaiting_merge: Mutex::new(HashMap::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.manager.is_some()
    }

    pub fn settings(&self) -> &IsolationSettings {
        &self.settings
    }

    /// Record the branch merges go back into.
    pub async fn prepare(&self) -> Result<()> {
        let Some(manager) = &self.manager else {
            warn!("not a git repository; tasks will run in place without isolation");
            return Ok(());
        };
        let branch = blocking(manager, |m| m.current_branch()).await?;
        info!(base_branch = %branch, "worktree isolation ready");
        *lock(&self.base_branch) = Some(branch);
        Ok(())
    }

    /// Create a worktree for `task`; `variant` distinguishes redundant copies.
    /// `None` when isolation is unavailable.
    pub async fn create(&self, task: &Task, variant: Option<usize>) -> Result<Option<WorktreeInfo>> {
        let Some(manager) = &self.manager else {
            return Ok(None);
        };
        let suffix = variant.map(|v| format!("-v{v}")).unwrap_or_default();
        let path = PathBuf::from(format!(
            "{}{suffix}",
            manager.worktree_path_for(task).display()
        ));
        let branch = format!("{}{suffix}", manager.branch_for(task));
        let task_id = task.id;
        let mut info = {
            let path = path.clone();
            blocking(manager, move |m| m.create_worktree(&branch, &path)).await?
        };
        info.task_id = Some(task_id);
        lock(&self.live).insert(path, info.clone());
        Ok(Some(info))
    }

    /// Commit everything in a worktree. Returns whether a commit was made.
    pub async fn commit(&self, worktree: &Path, message: &str) -> Result<bool> {
        let Some(manager) = &self.manager else {
            return Ok(false);
        };
        let worktree = worktree.to_path_buf();
        let message = message.to_string();
        blocking(manager, move |m| m.commit_all(&worktree, &message)).await
    }

    pub fn hold_for_merge(&self, task_id: TaskId, info: WorktreeInfo) {
        lock(&self.awaiting_merge).insert(task_id, info);
    }

    /// Merge the worktree branch of `task` into the base branch.
    pub async fn merge(&self, task: &Task) -> MergeOutcome {
        let Some(manager) = &self.manager else {
            return MergeOutcome::Skipped;
        };
        let Some(info) = lock(&self.awaiting_merge).remove(&task.id) else {
            return MergeOutcome::Skipped;
        };
        if !self.settings.auto_merge {
            debug!(task_id = %task.id, branch = %info.branch, "auto-merge disabled; branch left for review");
            return MergeOutcome::Skipped;
        }
        let into = lock(&self.base_branch)
            .clone()
            .unwrap_or_else(|| info.base_branch.clone());
        let branch = info.branch.clone();
        let result = {
            let into = into.clone();
            blocking(manager, move |m| m.merge_branch(&branch, &into)).await
        };
        match result {
            Ok(MergeResult::Success) => {
                info!(task_id = %task.id, branch = %info.branch, into = %into, "merged");
                self.retire(&info).await;
                MergeOutcome::Merged
            }
            Ok(MergeResult::NothingToMerge) => {
                self.retire(&info).await;
                MergeOutcome::NothingToMerge
            }
            Ok(MergeResult::Conflict(files)) => {
                warn!(task_id = %task.id, branch = %info.branch, ?files, "merge conflict; worktree kept");
                MergeOutcome::Conflict(files)
            }
            Err(e) => {
                warn!(task_id = %task.id, branch = %info.branch, error = %e, "merge failed");
                MergeOutcome::Failed(e.to_string())
            }
        }
    }

    /// Remove a merged worktree and its branch unless worktrees are kept.
    async fn retire(&self, info: &WorktreeInfo) {
        if self.settings.keep_worktrees {
            return;
        }
        self.discard(info).await;
    }

    /// Remove a worktree and delete its branch.
    pub async fn discard(&self, info: &WorktreeInfo) {
        let Some(manager) = &self.manager else { return };
        lock(&self.live).remove(&info.path);
        let path = info.path.clone();
        let branch = info.branch.clone();
        let result = blocking(manager, move |m| {
            m.remove_worktree(&path)?;
            m.delete_branch(&branch)
        })
        .await;
        if let Err(e) = result {
            warn!(worktree = %info.path.display(), error = %e, "failed to discard worktree");
        }
    }

    /// Remove remaining worktree directories. Branches stay so unmerged work
    /// is never lost. Idempotent.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(manager) = &self.manager else { return };
        let remaining: Vec<WorktreeInfo> = lock(&self.live).drain().map(|(_, v)| v).collect();
        if self.settings.keep_worktrees {
            for info in &remaining {
                info!(worktree = %info.path.display(), branch = %info.branch, "worktree kept");
            }
            return;
        }
        for info in remaining {
            let path = info.path.clone();
            if let Err(e) = blocking(manager, move |m| m.remove_worktree(&path)).await {
                warn!(worktree = %info.path.display(), error = %e, "failed to remove worktree");
            }
        }
    }
}
