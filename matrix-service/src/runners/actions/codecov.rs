// codecov/codecov-action
// Hands coverage reports to a local uploader; failures are fatal only with fail_ci_if_error

use crate::runners::actions::{ActionInputs, LocalAction};
use crate::runners::shell::ShellRunner;
use crate::runners::{StepInvocation, StepOutcome};
use crate::{ServiceError, ServiceResult};

use std::ffi::OsStr;
use std::path::PathBuf;
use tracing::warn;

const NAME: &str = "codecov/codecov-action";

/// Uploader looked up on the step's PATH when none is configured
pub const DEFAULT_UPLOADER: &str = "codecov";

/// Runs the coverage uploader over the reports named in `files` / `file`
#[derive(Debug, Default)]
pub struct CodecovUpload {
    uploader: Option<PathBuf>,
    shell: ShellRunner,
}

impl CodecovUpload {
    pub fn new(uploader: Option<PathBuf>) -> Self {
        Self {
            uploader,
            shell: ShellRunner::new(),
        }
    }

    fn uploader(&self, invocation: &StepInvocation<'_>) -> Result<PathBuf, String> {
        match &self.uploader {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(format!("uploader {} does not exist", path.display())),
            None => {
                let search_path = invocation.env.get("PATH").map(OsStr::new);
                which::which_in(DEFAULT_UPLOADER, search_path, &invocation.working_dir)
                    .map_err(|_| format!("uploader '{}' not found on PATH", DEFAULT_UPLOADER))
            }
        }
    }

    /// Run the upload; `Err` carries the reason it failed.
    async fn upload(
        &self,
        inputs: &ActionInputs,
        invocation: &StepInvocation<'_>,
    ) -> Result<(), String> {
        let mut files = inputs.list("files");
        files.extend(inputs.list("file"));
        if files.is_empty() {
            return Err("no coverage files given (set 'files')".to_string());
        }
        if let Some(missing) = files
            .iter()
            .find(|file| !invocation.working_dir.join(file).is_file())
        {
            return Err(format!("coverage report {} not found", missing));
        }

        let uploader = self.uploader(invocation)?;

        let mut args = Vec::new();
        for file in &files {
            args.push("-f".to_string());
            args.push(file.clone());
        }
        if let Some(flags) = inputs.get("flags") {
            args.push("-F".to_string());
            args.push(flags);
        }
        if let Some(name) = inputs.get("name") {
            args.push("-n".to_string());
            args.push(name);
        }
        if inputs.flag("verbose", false) {
            args.push("-v".to_string());
        }

        let output = self
            .shell
            .run_command(&uploader.to_string_lossy(), &args, invocation)
            .await;
        match output.to_outcome().error {
            None => Ok(()),
            Some(error) => Err(format!("uploader {}", error)),
        }
    }
}

#[async_trait::async_trait]
impl LocalAction for CodecovUpload {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        invocation: &StepInvocation<'_>,
    ) -> ServiceResult<StepOutcome> {
        match self.upload(inputs, invocation).await {
            Ok(()) => Ok(StepOutcome::success()),
            Err(reason) if inputs.flag("fail_ci_if_error", false) => {
                Err(ServiceError::CoverageUpload(reason))
            }
            Err(reason) => {
                warn!(step = invocation.index, %reason, "coverage upload failed, continuing");
                Ok(StepOutcome::success()
                    .with_warning(format!("coverage upload failed: {}", reason)))
            }
        }
    }
}
