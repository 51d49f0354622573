// Shell Runner
// Executes `run` steps through bash, sh, pwsh, python, or a custom shell template

use crate::runners::{OutputCallback, StepInvocation, StepOutcome};
use crate::{ServiceError, ServiceResult};

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long output is drained after the process exits
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Shell types supported by the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shell {
    /// `bash --noprofile --norc -eo pipefail {0}`
    Bash,
    /// `sh -e {0}`
    Sh,
    /// PowerShell Core
    Pwsh,
    /// `python {0}`
    Python,
    /// Any other `shell:` value; must contain `{0}`
    Custom(String),
}

impl Shell {
    /// Select the shell for a step. Without an explicit shell, bash is used
    /// when it is on PATH, otherwise sh.
    pub fn resolve(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some("bash") => Shell::Bash,
            Some("sh") => Shell::Sh,
            Some("pwsh") | Some("powershell") => Shell::Pwsh,
            Some("python") => Shell::Python,
            Some(custom) if !custom.is_empty() => Shell::Custom(custom.to_string()),
            _ => {
                if which::which("bash").is_ok() {
                    Shell::Bash
                } else {
                    Shell::Sh
                }
            }
        }
    }

    /// Command template; `{0}` is replaced with the script path
    pub fn template(&self) -> &str {
        match self {
            Shell::Bash => "bash --noprofile --norc -eo pipefail {0}",
            Shell::Sh => "sh -e {0}",
            Shell::Pwsh => "pwsh -command \". '{0}'\"",
            Shell::Python => "python {0}",
            Shell::Custom(template) => template,
        }
    }

    /// Extension of the generated script file
    pub fn extension(&self) -> &'static str {
        match self {
            Shell::Pwsh => "ps1",
            Shell::Python => "py",
            Shell::Bash | Shell::Sh | Shell::Custom(_) => "sh",
        }
    }

    /// Program and arguments that run `script`.
    pub fn command_line(&self, script: &Path) -> ServiceResult<(String, Vec<String>)> {
        let template = self.template();
        if !template.contains("{0}") {
            return Err(ServiceError::invalid_workflow(format!(
                "shell '{}' must contain '{{0}}' for the script path",
                template
            )));
        }

        let script = script.to_string_lossy();
        let mut words = split_template(template)
            .into_iter()
            .map(|word| word.replace("{0}", &script));
        let program = words
            .next()
            .ok_or_else(|| ServiceError::invalid_workflow("empty shell template"))?;
        Ok((program, words.collect()))
    }
}

/// Split a shell template into words, honouring double quotes.
fn split_template(template: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_word = false;

    for c in template.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Output collected during execution
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (None when killed or never started)
    pub exit_code: Option<i32>,
    /// Set when the process could not be started
    pub spawn_error: Option<String>,
    /// Set when the process was killed for exceeding its timeout
    pub timed_out: Option<Duration>,
}

impl ShellOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert the output to a step outcome
    pub fn to_outcome(&self) -> StepOutcome {
        let error = if let Some(error) = &self.spawn_error {
            Some(error.clone())
        } else if let Some(timeout) = self.timed_out {
            Some(format!("timed out after {:?}", timeout))
        } else {
            match self.exit_code {
                Some(0) => None,
                Some(code) => Some(format!("process exited with code {}", code)),
                None => Some("process terminated by signal".to_string()),
            }
        };

        StepOutcome {
            exit_code: self.exit_code,
            error,
            warnings: Vec::new(),
        }
    }
}

/// Shell runner for executing scripts
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    /// Write `script` to the environment's temp directory and run it.
    pub async fn run(
        &self,
        script: &str,
        shell: Option<&str>,
        invocation: &StepInvocation<'_>,
    ) -> StepOutcome {
        let shell = Shell::resolve(shell);
        let script_path = invocation.environment.temp_dir().join(format!(
            "step-{}.{}",
            invocation.index,
            shell.extension()
        ));

        if let Err(e) = tokio::fs::write(&script_path, script).await {
            return StepOutcome::failure(format!(
                "failed to write script {}: {}",
                script_path.display(),
                e
            ));
        }

        let (program, args) = match shell.command_line(&script_path) {
            Ok(command) => command,
            Err(e) => return StepOutcome::failure(e.to_string()),
        };

        debug!(step = invocation.index, %program, ?args, "running script");
        self.run_command(&program, &args, invocation)
            .await
            .to_outcome()
    }

    /// Run a program with the invocation's environment, working directory,
    /// timeout and output streaming.
    pub async fn run_command(
        &self,
        program: &str,
        args: &[String],
        invocation: &StepInvocation<'_>,
    ) -> ShellOutput {
        let program_path = resolve_program(program, &invocation.env, &invocation.working_dir);

        let mut cmd = Command::new(&program_path);
        cmd.args(args);
        cmd.current_dir(&invocation.working_dir);
        cmd.env_clear();
        cmd.envs(&invocation.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ShellOutput {
                    spawn_error: Some(format!("failed to start '{}': {}", program, e)),
                    ..Default::default()
                };
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ShellOutput {
                spawn_error: Some(format!("failed to capture output of '{}'", program)),
                ..Default::default()
            };
        };

        // Read output streams concurrently, forwarding each line as it arrives
        let stdout_lines = CollectedLines::default();
        let stderr_lines = CollectedLines::default();
        let mut stdout_handle = spawn_reader(
            stdout,
            invocation.on_output.clone(),
            false,
            stdout_lines.clone(),
        );
        let mut stderr_handle = spawn_reader(
            stderr,
            invocation.on_output.clone(),
            true,
            stderr_lines.clone(),
        );

        let deadline = invocation.timeout.map(|timeout| Instant::now() + timeout);
        let wait_result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    kill_process_tree(&mut child, program).await;
                    stdout_handle.abort();
                    stderr_handle.abort();
                    return ShellOutput {
                        stdout: stdout_lines.joined(),
                        stderr: stderr_lines.joined(),
                        timed_out: invocation.timeout,
                        ..Default::default()
                    };
                }
            },
            None => child.wait().await,
        };

        // Background processes may keep the pipes open after the shell exits
        let grace = Instant::now() + OUTPUT_GRACE;
        let drain_until = deadline.map_or(grace, |deadline| deadline.min(grace));
        for handle in [&mut stdout_handle, &mut stderr_handle] {
            if tokio::time::timeout_at(drain_until, &mut *handle).await.is_err() {
                debug!(program, "output still open after exit, detaching readers");
                handle.abort();
            }
        }

        let stdout = stdout_lines.joined();
        let stderr = stderr_lines.joined();
        match wait_result {
            Ok(status) => ShellOutput {
                stdout,
                stderr,
                exit_code: status.code(),
                ..Default::default()
            },
            Err(e) => ShellOutput {
                stdout,
                stderr,
                spawn_error: Some(format!("failed to wait for '{}': {}", program, e)),
                ..Default::default()
            },
        }
    }
}

/// Lines captured from one stream, readable even if its reader was aborted
#[derive(Clone, Default)]
struct CollectedLines(Arc<Mutex<Vec<String>>>);

impl CollectedLines {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.0.lock() {
            lines.push(line);
        }
    }

    fn joined(&self) -> String {
        self.0
            .lock()
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }
}

/// Forward every line of `reader` until EOF. Bytes that are not UTF-8 are
/// replaced rather than ending the stream, so the writer never sees a closed pipe.
fn spawn_reader<R>(
    reader: R,
    on_output: OutputCallback,
    is_error: bool,
    collected: CollectedLines,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(trim_line_ending(&buf)).into_owned();
                    on_output(&line, is_error);
                    collected.push(line);
                }
                Err(e) => {
                    debug!(error = %e, "failed to read process output");
                    break;
                }
            }
        }
    })
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Kill the step's whole process group so background children die with it.
async fn kill_process_tree(child: &mut Child, program: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: a negative pid signals the process group created for this
        // child by `process_group(0)`; SIGKILL has no memory-safety effects.
        let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if rc == 0 {
            if let Err(e) = child.wait().await {
                warn!(program, error = %e, "failed to reap killed process");
            }
            return;
        }
        warn!(
            program,
            pid,
            error = %std::io::Error::last_os_error(),
            "failed to kill process group"
        );
    }

    if let Err(e) = child.kill().await {
        warn!(program, error = %e, "failed to kill timed out process");
    }
}

/// Look `program` up on the step's PATH rather than the host's.
fn resolve_program(program: &str, env: &HashMap<String, String>, cwd: &Path) -> PathBuf {
    let path = env.get("PATH").map(OsStr::new);
    which::which_in(program, path, cwd).unwrap_or_else(|_| PathBuf::from(program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::environment::IsolatedEnvironment;
    use std::sync::{Arc, Mutex};

    fn host_env() -> HashMap<String, String> {
        ["PATH", "HOME"]
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect()
    }

    #[test]
    fn test_shell_templates() {
        let script = Path::new("/tmp/step-0.sh");
        let (program, args) = Shell::Bash.command_line(script).unwrap();
        assert_eq!(program, "bash");
        assert_eq!(
            args,
            vec!["--noprofile", "--norc", "-eo", "pipefail", "/tmp/step-0.sh"]
        );

        let (program, args) = Shell::Sh.command_line(script).unwrap();
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-e", "/tmp/step-0.sh"]);

        let (_, args) = Shell::Pwsh.command_line(Path::new("/tmp/step-0.ps1")).unwrap();
        assert_eq!(args, vec!["-command", ". '/tmp/step-0.ps1'"]);
    }

    #[test]
    fn test_custom_shell_requires_placeholder() {
        let shell = Shell::resolve(Some("perl {0}"));
        assert_eq!(shell, Shell::Custom("perl {0}".into()));
        assert!(shell.command_line(Path::new("x")).is_ok());
        assert!(Shell::resolve(Some("perl")).command_line(Path::new("x")).is_err());
    }

    #[test]
    fn test_resolve_named_shells() {
        assert_eq!(Shell::resolve(Some("sh")), Shell::Sh);
        assert_eq!(Shell::resolve(Some("python")), Shell::Python);
        assert_eq!(Shell::resolve(Some("powershell")), Shell::Pwsh);
        assert!(matches!(Shell::resolve(None), Shell::Bash | Shell::Sh));
    }

    #[tokio::test]
    async fn test_run_script_streams_output() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let invocation = StepInvocation::new(0, &env)
            .with_env(host_env())
            .with_output(Arc::new(move |line: &str, is_error: bool| {
                sink.lock().unwrap().push((line.to_string(), is_error));
            }));

        let outcome = ShellRunner::new()
            .run("echo hello\necho oops >&2", Some("sh"), &invocation)
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(0));
        let lines = lines.lock().unwrap();
        assert!(lines.contains(&("hello".to_string(), false)));
        assert!(lines.contains(&("oops".to_string(), true)));
        assert!(env.temp_dir().join("step-0.sh").is_file());
    }

    #[tokio::test]
    async fn test_run_script_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(3, &env).with_env(host_env());

        let outcome = ShellRunner::new().run("exit 42", Some("sh"), &invocation).await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(42));
    }

    #[tokio::test]
    async fn test_sh_stops_on_first_error() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let marker = env.workspace().join("reached");
        let invocation = StepInvocation::new(0, &env).with_env(host_env());

        let script = format!("false\ntouch {}", marker.display());
        let outcome = ShellRunner::new().run(&script, Some("sh"), &invocation).await;
        assert!(!outcome.succeeded());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_environment_is_not_inherited() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let mut vars = host_env();
        vars.insert("MATRIX_TORCH".into(), "2.0.0".into());
        let invocation = StepInvocation::new(0, &env).with_env(vars);

        let output = ShellRunner::new()
            .run_command(
                "sh",
                &["-c".into(), "echo \"$MATRIX_TORCH:${CARGO:-unset}\"".into()],
                &invocation,
            )
            .await;
        assert!(output.succeeded());
        assert_eq!(output.stdout, "2.0.0:unset");
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env).with_env(host_env());

        let output = ShellRunner::new()
            .run_command("sh", &["-c".into(), "pwd".into()], &invocation)
            .await;
        assert_eq!(
            Path::new(&output.stdout).canonicalize().unwrap(),
            env.workspace().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env)
            .with_env(host_env())
            .with_timeout(Some(Duration::from_millis(200)));

        let outcome = ShellRunner::new().run("sleep 5", Some("sh"), &invocation).await;
        assert!(!outcome.succeeded());
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_draining() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let invocation = StepInvocation::new(0, &env)
            .with_env(host_env())
            .with_output(Arc::new(move |line: &str, _: bool| {
                sink.lock().unwrap().push(line.to_string());
            }));

        let script = "printf 'caf\\351\\n'\nsleep 0.2\nfor i in 1 2 3 4 5; do echo \"line $i\"; done";
        let outcome = ShellRunner::new().run(script, Some("bash"), &invocation).await;

        assert!(outcome.succeeded(), "{:?}", outcome.error);
        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "caf\u{FFFD}");
        assert_eq!(&lines[1..], &["line 1", "line 2", "line 3", "line 4", "line 5"]);
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_step_open() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env)
            .with_env(host_env())
            .with_timeout(Some(Duration::from_millis(300)));

        let started = std::time::Instant::now();
        let output = ShellRunner::new()
            .run_command(
                "bash",
                &["-c".to_string(), "sleep 4 &\necho started".to_string()],
                &invocation,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(output.timed_out.is_none());
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "started");
    }

    #[tokio::test]
    async fn test_background_process_without_timeout_is_detached() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env).with_env(host_env());

        let started = std::time::Instant::now();
        let outcome = ShellRunner::new()
            .run("sleep 4 &\necho started", Some("sh"), &invocation)
            .await;

        assert!(outcome.succeeded());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let marker = root.path().join("marker");
        let invocation = StepInvocation::new(0, &env)
            .with_env(host_env())
            .with_timeout(Some(Duration::from_millis(300)));

        let script = format!("(sleep 1; touch '{}') &\nsleep 7.3", marker.display());
        let started = std::time::Instant::now();
        let outcome = ShellRunner::new().run(&script, Some("sh"), &invocation).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcome.error.unwrap().contains("timed out"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let invocation = StepInvocation::new(0, &env).with_env(host_env());

        let output = ShellRunner::new()
            .run_command("definitely-not-a-real-program", &[], &invocation)
            .await;
        assert!(output.spawn_error.is_some());
        assert!(!output.to_outcome().succeeded());
    }
}
