// actions/setup-python
// Locates a host interpreter and provisions a virtual environment for the instance

use crate::runners::actions::{ActionInputs, LocalAction};
use crate::runners::shell::ShellRunner;
use crate::runners::{StepInvocation, StepOutcome};
use crate::{ServiceError, ServiceResult};

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const NAME: &str = "actions/setup-python";

const PROBE: &str = "import platform; print(platform.python_version()); print(platform.machine())";

/// An interpreter found on the host
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Interpreter {
    pub path: PathBuf,
    pub version: String,
    pub machine: String,
}

/// Provides the requested Python through a venv under `tool/`
#[derive(Debug, Default)]
pub struct SetupPython {
    shell: ShellRunner,
}

impl SetupPython {
    pub fn new() -> Self {
        Self::default()
    }

    async fn probe(&self, path: &Path, invocation: &StepInvocation<'_>) -> Option<Interpreter> {
        let quiet = invocation.clone().with_output(Arc::new(|_: &str, _: bool| {}));
        let output = self
            .shell
            .run_command(
                &path.to_string_lossy(),
                &["-c".to_string(), PROBE.to_string()],
                &quiet,
            )
            .await;
        if !output.succeeded() {
            return None;
        }
        let mut lines = output.stdout.lines();
        Some(Interpreter {
            path: path.to_path_buf(),
            version: lines.next()?.trim().to_string(),
            machine: lines.next().unwrap_or_default().trim().to_string(),
        })
    }

    async fn find(
        &self,
        version: &str,
        architecture: Option<&str>,
        invocation: &StepInvocation<'_>,
    ) -> ServiceResult<Interpreter> {
        let search_path = invocation.env.get("PATH").map(OsStr::new);
        let mut seen = Vec::new();

        for candidate in candidates(version) {
            let Ok(path) = which::which_in(&candidate, search_path, &invocation.working_dir) else {
                continue;
            };
            if seen.contains(&path) {
                continue;
            }
            seen.push(path.clone());

            let Some(found) = self.probe(&path, invocation).await else {
                continue;
            };
            debug!(path = %path.display(), version = %found.version, machine = %found.machine, "probed interpreter");
            if version_matches(&found.version, version)
                && architecture.map_or(true, |arch| arch_matches(&found.machine, arch))
            {
                return Ok(found);
            }
        }

        Err(ServiceError::action(
            NAME,
            format!(
                "no Python {}{} found on PATH",
                version,
                architecture
                    .map(|a| format!(" ({})", a))
                    .unwrap_or_default()
            ),
        ))
    }

    async fn create_venv(
        &self,
        interpreter: &Interpreter,
        venv: &Path,
        invocation: &StepInvocation<'_>,
    ) -> ServiceResult<Vec<String>> {
        let python = interpreter.path.to_string_lossy().into_owned();
        let venv_arg = venv.to_string_lossy().into_owned();
        let mut warnings = Vec::new();

        let output = self
            .shell
            .run_command(&python, &["-m".into(), "venv".into(), venv_arg.clone()], invocation)
            .await;
        if output.succeeded() {
            return Ok(warnings);
        }

        // Distribution builds may ship venv without ensurepip
        let message = format!(
            "venv with pip failed ({}), retrying without pip",
            output.stderr.lines().last().unwrap_or("no output")
        );
        warn!(venv = %venv.display(), "{}", message);
        warnings.push(message);

        let output = self
            .shell
            .run_command(
                &python,
                &["-m".into(), "venv".into(), "--without-pip".into(), venv_arg],
                invocation,
            )
            .await;
        if output.succeeded() {
            Ok(warnings)
        } else {
            Err(ServiceError::action(
                NAME,
                format!(
                    "failed to create virtual environment at {}: {}",
                    venv.display(),
                    output.to_outcome().error.unwrap_or_default()
                ),
            ))
        }
    }
}

#[async_trait::async_trait]
impl LocalAction for SetupPython {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        invocation: &StepInvocation<'_>,
    ) -> ServiceResult<StepOutcome> {
        let version = inputs.require(NAME, "python-version")?;
        let architecture = inputs.get("architecture");
        if let Some(arch) = &architecture {
            if !matches!(arch.to_lowercase().as_str(), "x64" | "x86" | "arm64") {
                return Err(ServiceError::action(
                    NAME,
                    format!("unsupported architecture '{}'", arch),
                ));
            }
        }

        let interpreter = self
            .find(&version, architecture.as_deref(), invocation)
            .await?;
        invocation.emit(
            &format!(
                "Using Python {} ({}) from {}",
                interpreter.version,
                interpreter.machine,
                interpreter.path.display()
            ),
            false,
        );

        let venv = invocation
            .environment
            .tool_dir()
            .join("python")
            .join(&interpreter.version)
            .join(architecture.as_deref().unwrap_or("default"));
        if let Some(parent) = venv.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let warnings = self.create_venv(&interpreter, &venv, invocation).await?;

        let bin = if cfg!(windows) {
            venv.join("Scripts")
        } else {
            venv.join("bin")
        };
        let environment = invocation.environment;
        environment.add_path(&bin)?;
        environment.export_env("pythonLocation", &venv.to_string_lossy())?;
        environment.set_output("python-version", &interpreter.version)?;
        environment.set_output("python-path", &bin.join("python").to_string_lossy())?;

        let mut outcome = StepOutcome::success();
        outcome.warnings = warnings;
        Ok(outcome)
    }
}

/// Executable names to try for a requested version
pub(crate) fn candidates(version: &str) -> Vec<String> {
    let mut names = Vec::new();
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() >= 2
        && parts[..2]
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        names.push(format!("python{}.{}", parts[0], parts[1]));
    }
    names.push("python3".to_string());
    names.push("python".to_string());
    names
}

/// `3.8` accepts `3.8.18`, but not `3.80.1`
pub(crate) fn version_matches(found: &str, requested: &str) -> bool {
    let requested = requested.trim().trim_end_matches(".x");
    found == requested || found.starts_with(&format!("{}.", requested))
}

/// Map `platform.machine()` values onto action architectures
pub(crate) fn arch_matches(machine: &str, architecture: &str) -> bool {
    let machine = machine.to_lowercase();
    match architecture.to_lowercase().as_str() {
        "x64" => matches!(machine.as_str(), "x86_64" | "amd64" | "x64"),
        "x86" => matches!(machine.as_str(), "i386" | "i486" | "i586" | "i686" | "x86"),
        "arm64" => matches!(machine.as_str(), "aarch64" | "arm64"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::environment::IsolatedEnvironment;
    use std::collections::HashMap;

    fn host_env() -> HashMap<String, String> {
        ["PATH", "HOME"]
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect()
    }

    fn inputs(yaml: &str) -> ActionInputs {
        ActionInputs::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_candidates() {
        assert_eq!(candidates("3.8"), vec!["python3.8", "python3", "python"]);
        assert_eq!(candidates("3.11.4"), vec!["python3.11", "python3", "python"]);
        assert_eq!(candidates("pypy3.9"), vec!["python3", "python"]);
        assert_eq!(candidates("3.8.x")[0], "python3.8");
    }

    #[test]
    fn test_version_matches() {
        assert!(version_matches("3.8.18", "3.8"));
        assert!(version_matches("3.8.18", "3.8.18"));
        assert!(version_matches("3.8.18", "3.8.x"));
        assert!(!version_matches("3.80.1", "3.8"));
        assert!(!version_matches("3.9.1", "3.8"));
    }

    #[test]
    fn test_arch_matches() {
        assert!(arch_matches("x86_64", "x64"));
        assert!(arch_matches("AMD64", "x64"));
        assert!(arch_matches("aarch64", "arm64"));
        assert!(arch_matches("i686", "x86"));
        assert!(!arch_matches("aarch64", "x64"));
    }

    #[tokio::test]
    async fn test_requires_version() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env).with_env(host_env());

        let err = SetupPython::new()
            .run(&inputs("architecture: x64"), &invocation)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("python-version"));
    }

    #[tokio::test]
    async fn test_unavailable_version_fails() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env).with_env(host_env());

        let err = SetupPython::new()
            .run(&inputs("python-version: '1.0'"), &invocation)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no Python 1.0"));
        assert!(env.take_command_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provisions_host_interpreter() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env).with_env(host_env());

        let action = SetupPython::new();
        let Some(host) = (match which::which("python3") {
            Ok(path) => action.probe(&path, &invocation).await,
            Err(_) => None,
        }) else {
            // No interpreter on this machine
            return;
        };
        let requested: Vec<&str> = host.version.split('.').take(2).collect();

        let outcome = action
            .run(&inputs(&format!("python-version: '{}'", requested.join("."))), &invocation)
            .await
            .unwrap();
        assert!(outcome.succeeded());

        let files = env.take_command_files().unwrap();
        assert_eq!(files.path.len(), 1);
        assert!(files.path[0].starts_with(&*env.tool_dir().to_string_lossy()));
        assert!(files.env.iter().any(|(k, _)| k == "pythonLocation"));
        assert!(files
            .outputs
            .contains(&("python-version".to_string(), host.version.clone())));
    }
}
