//! Worktree adapter tests against a recording git runner, plus one pass
//! against the real git binary when it is installed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sq_core::worktree::{GitOutput, GitRunner, MergeResult, WorktreeError, WorktreeManager};

// ===========================================================================
// Mock GitRunner
// ===========================================================================

/// Records commands and answers from a queue of canned responses.
#[derive(Clone)]
struct MockGitRunner {
    responses: Arc<Mutex<Vec<GitOutput>>>,
    commands: Arc<Mutex<Vec<(PathBuf, Vec<String>)>>>,
}

impl MockGitRunner {
    fn new(responses: Vec<GitOutput>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn commands(&self) -> Vec<Vec<String>> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl GitRunner for MockGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        self.commands.lock().unwrap().push((
            dir.to_path_buf(),
            args.iter().map(|s| s.to_string()).collect(),
        ));
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(GitOutput::ok(""))
        } else {
            Ok(responses.remove(0))
        }
    }
}

fn manager(mock: &MockGitRunner, base: &Path) -> WorktreeManager {
    WorktreeManager::with_git_runner("/repo", base, Box::new(mock.clone()))
}

// ===========================================================================
// create / remove
// ===========================================================================

#[test]
fn create_worktree_adds_branch_from_head() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("main\n"), // rev-parse
        GitOutput::ok(""),       // worktree add
    ]);
    let path = tmp.path().join("task-1");
    let info = manager(&mock, tmp.path())
        .create_worktree("squadron/1-x", &path)
        .unwrap();

    assert_eq!(info.branch, "squadron/1-x");
    assert_eq!(info.base_branch, "main");
    assert_eq!(info.path, path);
    let cmds = mock.commands();
    assert_eq!(cmds[1][..4], ["worktree", "add", "-b", "squadron/1-x"]);
    assert_eq!(cmds[1].last().map(String::as_str), Some("HEAD"));
}

#[test]
fn create_worktree_rejects_existing_path() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![]);
    let err = manager(&mock, tmp.path())
        .create_worktree("b", tmp.path())
        .unwrap_err();
    assert!(matches!(err, WorktreeError::AlreadyExists(_)));
    assert!(mock.commands().is_empty());
}

#[test]
fn create_worktree_surfaces_git_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("main\n"),
        GitOutput::failed("fatal: a branch named 'b' already exists"),
    ]);
    let err = manager(&mock, tmp.path())
        .create_worktree("b", &tmp.path().join("wt"))
        .unwrap_err();
    match err {
        WorktreeError::GitCommand { op, stderr } => {
            assert_eq!(op, "worktree add");
            assert!(stderr.contains("already exists"));
        }
        other => panic!("expected GitCommand, got {other:?}"),
    }
}

#[test]
fn remove_missing_worktree_is_not_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![GitOutput::failed("not a working tree")]);
    manager(&mock, tmp.path())
        .remove_worktree(&tmp.path().join("gone"))
        .unwrap();
    let cmds = mock.commands();
    assert_eq!(cmds[0][..3], ["worktree", "remove", "--force"]);
    assert_eq!(cmds[1], ["worktree", "prune"]);
}

// ===========================================================================
// commit_all
// ===========================================================================

#[test]
fn commit_all_skips_clean_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok(""), // add -A
        GitOutput::ok(""), // status --porcelain
    ]);
    let committed = manager(&mock, tmp.path())
        .commit_all(Path::new("/wt"), "msg")
        .unwrap();
    assert!(!committed);
    assert_eq!(mock.commands().len(), 2);
}

#[test]
fn commit_all_supplies_identity_when_missing() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok(""),              // add -A
        GitOutput::ok(" M src/lib.rs"), // status
        GitOutput::failed(""),          // config user.email
        GitOutput::ok(""),              // commit
    ]);
    let committed = manager(&mock, tmp.path())
        .commit_all(Path::new("/wt"), "task done")
        .unwrap();
    assert!(committed);
    let commit = mock.commands().pop().unwrap();
    assert_eq!(commit[0], "-c");
    assert!(commit.contains(&"commit".to_string()));
    assert_eq!(commit.last().map(String::as_str), Some("task done"));
}

// ===========================================================================
// merge_branch
// ===========================================================================

#[test]
fn merge_nothing_to_merge() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("main\n"), // rev-parse
        GitOutput::ok("0\n"),    // rev-list
    ]);
    let result = manager(&mock, tmp.path()).merge_branch("b", "main").unwrap();
    assert_eq!(result, MergeResult::NothingToMerge);
}

#[test]
fn merge_success_commits() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("main\n"),          // rev-parse
        GitOutput::ok("2\n"),             // rev-list
        GitOutput::ok(""),                // merge --no-commit
        GitOutput::ok("me@example.com"), // config user.email
        GitOutput::ok(""),                // commit
    ]);
    let result = manager(&mock, tmp.path()).merge_branch("b", "main").unwrap();
    assert_eq!(result, MergeResult::Success);
    let cmds = mock.commands();
    assert_eq!(cmds[2], ["merge", "--no-ff", "--no-commit", "b"]);
    assert_eq!(cmds[4][0], "commit");
}

#[test]
fn merge_checks_out_target_first() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("feature\n"), // rev-parse
        GitOutput::ok(""),          // checkout main
        GitOutput::ok("0\n"),       // rev-list
    ]);
    manager(&mock, tmp.path()).merge_branch("b", "main").unwrap();
    assert_eq!(mock.commands()[1], ["checkout", "main"]);
}

#[test]
fn merge_conflict_aborts_and_lists_files() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("main\n"),
        GitOutput::ok("1\n"),
        GitOutput::failed("CONFLICT (add/add): Merge conflict in out.txt"),
        GitOutput::ok("out.txt\n"), // diff --name-only
        GitOutput::ok(""),          // merge --abort
    ]);
    let result = manager(&mock, tmp.path()).merge_branch("b", "main").unwrap();
    assert_eq!(result, MergeResult::Conflict(vec!["out.txt".to_string()]));
    assert_eq!(mock.commands().last().unwrap(), &["merge", "--abort"]);
}

#[test]
fn failed_abort_falls_back_to_reset() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("main\n"),
        GitOutput::ok("1\n"),
        GitOutput::failed("CONFLICT (content): Merge conflict in a.rs"),
        GitOutput::ok("a.rs\n"),
        GitOutput::failed("fatal: There is no merge to abort"),
        GitOutput::ok(""), // reset --merge
    ]);
    let result = manager(&mock, tmp.path()).merge_branch("b", "main").unwrap();
    assert_eq!(result, MergeResult::Conflict(vec!["a.rs".to_string()]));
    assert_eq!(mock.commands().last().unwrap(), &["reset", "--merge"]);
}

#[test]
fn stuck_merge_state_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::ok("main\n"),
        GitOutput::ok("1\n"),
        GitOutput::failed("CONFLICT (content): Merge conflict in a.rs"),
        GitOutput::ok("a.rs\n"),
        GitOutput::failed("fatal: cannot abort"),
        GitOutput::failed("fatal: index.lock exists"),
    ]);
    let err = manager(&mock, tmp.path()).merge_branch("b", "main").unwrap_err();
    assert!(matches!(err, WorktreeError::GitCommand { op: "reset --merge", .. }));
}

#[test]
fn prune_failure_does_not_fail_removal() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = MockGitRunner::new(vec![
        GitOutput::failed("not a working tree"),
        GitOutput::failed("prune failed"),
    ]);
    manager(&mock, tmp.path())
        .remove_worktree(&tmp.path().join("gone"))
        .unwrap();
}

// ===========================================================================
// Real git
// ===========================================================================

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

#[test]
fn real_git_worktree_lifecycle() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let repo = tempfile::tempdir().unwrap();
    let wt_base = tempfile::tempdir().unwrap();
    git(repo.path(), &["init", "-q"]);
    git(repo.path(), &["config", "user.email", "t@example.com"]);
    git(repo.path(), &["config", "user.name", "t"]);
    std::fs::write(repo.path().join("README"), "hi\n").unwrap();
    git(repo.path(), &["add", "."]);
    git(repo.path(), &["commit", "-q", "-m", "init"]);

    let manager = WorktreeManager::new(repo.path(), wt_base.path());
    let base = manager.current_branch().unwrap();
    let path = wt_base.path().join("task-a");
    manager.create_worktree("squadron/a", &path).unwrap();
    assert!(path.join("README").exists());

    std::fs::write(path.join("out.txt"), "a\n").unwrap();
    assert!(manager.commit_all(&path, "add out").unwrap());
    assert!(!repo.path().join("out.txt").exists());

    assert_eq!(manager.merge_branch("squadron/a", &base).unwrap(), MergeResult::Success);
    assert!(repo.path().join("out.txt").exists());
    assert!(manager.is_clean(repo.path()).unwrap());

    manager.remove_worktree(&path).unwrap();
    assert!(!path.exists());
    manager.delete_branch("squadron/a").unwrap();
}
