// Isolated Environments
// Per-instance scratch directories and the GITHUB_ENV / GITHUB_PATH / GITHUB_OUTPUT command files

use crate::{ServiceError, ServiceResult};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Directory the repository is checked out into
pub const WORKSPACE_DIR: &str = "workspace";
/// Directory toolchains (virtual environments, tool caches) are installed into
pub const TOOL_DIR: &str = "tool";
/// Directory for step scripts and `RUNNER_TEMP`
pub const TEMP_DIR: &str = "temp";

const ENV_FILE: &str = "env";
const PATH_FILE: &str = "path";
const OUTPUT_FILE: &str = "output";

/// A freshly provisioned directory owned by exactly one job instance.
///
/// Dropping the value removes the directory; [`IsolatedEnvironment::teardown`]
/// does the same explicitly and can keep it for inspection instead.
#[derive(Debug)]
pub struct IsolatedEnvironment {
    dir: TempDir,
}

/// Contents of the command files written by a step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandFiles {
    /// Variables appended to `GITHUB_ENV`, in write order
    pub env: Vec<(String, String)>,
    /// Directories appended to `GITHUB_PATH`, in write order
    pub path: Vec<String>,
    /// Outputs appended to `GITHUB_OUTPUT`, in write order
    pub outputs: Vec<(String, String)>,
}

impl CommandFiles {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.path.is_empty() && self.outputs.is_empty()
    }
}

impl IsolatedEnvironment {
    /// Create a new environment directory under `root`.
    pub fn provision(root: &Path) -> ServiceResult<Self> {
        let failed = |e: io::Error| ServiceError::Provisioning {
            path: root.to_path_buf(),
            message: e.to_string(),
        };

        fs::create_dir_all(root).map_err(failed)?;
        let dir = tempfile::Builder::new()
            .prefix("instance-")
            .tempdir_in(root)
            .map_err(failed)?;

        let env = Self { dir };
        for sub in [WORKSPACE_DIR, TOOL_DIR, TEMP_DIR] {
            fs::create_dir(env.root().join(sub)).map_err(failed)?;
        }
        for file in [ENV_FILE, PATH_FILE, OUTPUT_FILE] {
            fs::File::create(env.root().join(file)).map_err(failed)?;
        }

        debug!(path = %env.root().display(), "provisioned environment");
        Ok(env)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn workspace(&self) -> PathBuf {
        self.root().join(WORKSPACE_DIR)
    }

    pub fn tool_dir(&self) -> PathBuf {
        self.root().join(TOOL_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root().join(TEMP_DIR)
    }

    /// File exported as `GITHUB_ENV`
    pub fn env_file(&self) -> PathBuf {
        self.root().join(ENV_FILE)
    }

    /// File exported as `GITHUB_PATH`
    pub fn path_file(&self) -> PathBuf {
        self.root().join(PATH_FILE)
    }

    /// File exported as `GITHUB_OUTPUT`
    pub fn output_file(&self) -> PathBuf {
        self.root().join(OUTPUT_FILE)
    }

    /// Read what the last step wrote to the command files, then truncate them.
    pub fn take_command_files(&self) -> ServiceResult<CommandFiles> {
        let env = parse_key_values(&take_file(&self.env_file())?)?;
        let path = take_file(&self.path_file())?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        let outputs = parse_key_values(&take_file(&self.output_file())?)?;

        Ok(CommandFiles { env, path, outputs })
    }

    /// Append `NAME=value` to `GITHUB_ENV`, as a step would.
    pub fn export_env(&self, name: &str, value: &str) -> ServiceResult<()> {
        append_line(&self.env_file(), &format_key_value(name, value))
    }

    /// Append a directory to `GITHUB_PATH`.
    pub fn add_path(&self, dir: &Path) -> ServiceResult<()> {
        append_line(&self.path_file(), &dir.to_string_lossy())
    }

    /// Append a step output to `GITHUB_OUTPUT`.
    pub fn set_output(&self, name: &str, value: &str) -> ServiceResult<()> {
        append_line(&self.output_file(), &format_key_value(name, value))
    }

    /// Remove the environment, or keep it on disk and return its path.
    pub fn teardown(self, keep: bool) -> ServiceResult<Option<PathBuf>> {
        if keep {
            let path = self.dir.keep();
            debug!(path = %path.display(), "keeping environment");
            Ok(Some(path))
        } else {
            let path = self.root().to_path_buf();
            self.dir.close()?;
            debug!(path = %path.display(), "removed environment");
            Ok(None)
        }
    }
}

fn take_file(path: &Path) -> ServiceResult<String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        // A step may delete the file; treat it as empty
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    fs::write(path, "")?;
    Ok(content)
}

fn append_line(path: &Path, line: &str) -> ServiceResult<()> {
    use std::io::Write;

    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

fn format_key_value(name: &str, value: &str) -> String {
    if value.contains('\n') {
        format!("{}<<__MATRIX_CI_EOF__\n{}\n__MATRIX_CI_EOF__", name, value)
    } else {
        format!("{}={}", name, value)
    }
}

/// Parse `NAME=value` lines and `NAME<<DELIMITER` heredoc blocks.
pub fn parse_key_values(content: &str) -> ServiceResult<Vec<(String, String)>> {
    let mut entries = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        let equals = line.find('=');
        let heredoc = line.find("<<");
        match (equals, heredoc) {
            (Some(eq), h) if h.map_or(true, |h| eq < h) => {
                let name = line[..eq].trim();
                if name.is_empty() {
                    return Err(invalid_command(format!("missing name in '{}'", line)));
                }
                entries.push((name.to_string(), line[eq + 1..].to_string()));
            }
            (_, Some(h)) => {
                let name = line[..h].trim();
                let delimiter = line[h + 2..].trim();
                if name.is_empty() || delimiter.is_empty() {
                    return Err(invalid_command(format!("malformed heredoc '{}'", line)));
                }
                let mut value = Vec::new();
                let mut closed = false;
                for body in lines.by_ref() {
                    if body == delimiter {
                        closed = true;
                        break;
                    }
                    value.push(body);
                }
                if !closed {
                    return Err(invalid_command(format!(
                        "heredoc for '{}' is missing delimiter '{}'",
                        name, delimiter
                    )));
                }
                entries.push((name.to_string(), value.join("\n")));
            }
            _ => return Err(invalid_command(format!("invalid line '{}'", line))),
        }
    }

    Ok(entries)
}

fn invalid_command(message: String) -> ServiceError {
    io::Error::new(io::ErrorKind::InvalidData, format!("command file: {}", message)).into()
}
