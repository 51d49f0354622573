// actions/checkout
// Materializes the local repository into the instance workspace

use crate::runners::actions::{ActionInputs, LocalAction};
use crate::runners::{StepInvocation, StepOutcome};
use crate::{ServiceError, ServiceResult};

use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const NAME: &str = "actions/checkout";

/// Build output directories that are never copied
const SKIPPED_DIRS: &[&str] = &["target"];

/// Copies the repository directory into `workspace/` (or `workspace/<path>`)
pub struct Checkout {
    repository: PathBuf,
}

impl Checkout {
    pub fn new(repository: PathBuf) -> Self {
        Self { repository }
    }
}

#[async_trait::async_trait]
impl LocalAction for Checkout {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        invocation: &StepInvocation<'_>,
    ) -> ServiceResult<StepOutcome> {
        let workspace = invocation.environment.workspace();
        let dest = match inputs.get("path") {
            Some(path) => workspace.join(relative_path(&path)?),
            None => workspace,
        };

        let source = self.repository.canonicalize().map_err(|e| {
            ServiceError::action(
                NAME,
                format!("repository {} is not accessible: {}", self.repository.display(), e),
            )
        })?;
        // The environment root may live inside the repository
        let env_root = invocation
            .environment
            .root()
            .parent()
            .and_then(|p| p.canonicalize().ok());

        let target = dest.clone();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &target, env_root.as_deref()))
            .await
            .map_err(|e| ServiceError::action(NAME, e.to_string()))??;

        invocation.emit(
            &format!("Copied {} files into {}", copied, dest.display()),
            false,
        );
        Ok(StepOutcome::success())
    }
}

/// `with.path` must stay inside the workspace
fn relative_path(path: &str) -> ServiceResult<PathBuf> {
    let path = Path::new(path);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ServiceError::action(
            NAME,
            format!("path '{}' must be relative to the workspace", path.display()),
        ));
    }
    Ok(path.to_path_buf())
}

fn copy_tree(source: &Path, dest: &Path, skip: Option<&Path>) -> ServiceResult<usize> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;

    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let skipped_name = entry.file_type().is_dir()
                && SKIPPED_DIRS
                    .iter()
                    .any(|name| entry.file_name() == *name);
            let inside_env_root = skip.is_some_and(|root| entry.path().starts_with(root));
            !skipped_name && !inside_env_root
        });

    for entry in walker {
        let entry = entry.map_err(|e| ServiceError::action(NAME, e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| ServiceError::action(NAME, e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    debug!(from = %source.display(), to = %dest.display(), copied, "checked out repository");
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> ServiceResult<()> {
    std::os::unix::fs::symlink(fs::read_link(link)?, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> ServiceResult<()> {
    if link.is_file() {
        fs::copy(link, target)?;
    }
    Ok(())
}
