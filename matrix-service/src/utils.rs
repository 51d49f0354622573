// Utility Functions
// Repository root detection and the checked-out branch used for default events

use std::path::{Path, PathBuf};
use std::process::Command;

/// Find the root of a git repository by walking up from the given starting path.
///
/// Returns `None` if no ancestor contains a `.git` entry.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Repository to check out: the enclosing git root, else `start` itself.
pub fn resolve_repository(start: &Path) -> PathBuf {
    find_repo_root(start).unwrap_or_else(|| start.to_path_buf())
}

/// Branch currently checked out in `repo`.
///
/// `None` when git is unavailable, `repo` is not a repository, or HEAD is detached.
pub fn current_branch(repo: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(repo)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty() && branch != "HEAD").then_some(branch)
}
