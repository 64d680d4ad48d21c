//! External tool invocation (pg_dump, psql, aws, rclone, sendmail, ...).
//!
//! Every call carries an explicit timeout; a timeout is reported as that
//! step's failure. The [`CommandRunner`] trait is the seam that tests (and
//! in-process replacements) plug into.

use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Value following `flag` in the argument list, if any.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion (or timeout). A non-zero exit is not an error here.
    async fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput>;

    /// Whether `program` can be executed.
    fn is_available(&self, program: &str) -> bool;
}

/// Run `cmd` and turn a non-zero exit into [`DrError::ToolFailed`].
pub async fn run_checked(runner: &dyn CommandRunner, cmd: &ToolCommand) -> Result<ToolOutput> {
    let output = runner.run(cmd).await?;
    if !output.success() {
        return Err(DrError::ToolFailed {
            tool: cmd.program.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Runs real processes via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        debug!(program = %cmd.program, args = ?cmd.args, "Running external tool");

        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if cmd.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DrError::ToolMissing(cmd.program.clone())
            } else {
                DrError::Io(e)
            }
        })?;

        let input = cmd.stdin.clone();
        let mut stdin = child.stdin.take();
        let interaction = async move {
            if let (Some(pipe), Some(data)) = (stdin.as_mut(), input) {
                pipe.write_all(&data).await?;
                pipe.shutdown().await?;
            }
            drop(stdin);
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(cmd.timeout, interaction)
            .await
            .map_err(|_| DrError::Timeout {
                tool: cmd.program.clone(),
                secs: cmd.timeout.as_secs(),
            })??;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn is_available(&self, program: &str) -> bool {
        find_in_path(program).is_some()
    }
}

/// Resolve `program` against `PATH` (absolute/relative paths are checked directly).
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_after() {
        let cmd = ToolCommand::new("pg_dump", Duration::from_secs(5))
            .args(["-Fc", "-f", "/tmp/out.dump"])
            .arg("tenant_a");
        assert_eq!(cmd.arg_after("-f"), Some("/tmp/out.dump"));
        assert_eq!(cmd.arg_after("-h"), None);
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner;
        let cmd = ToolCommand::new("sh", Duration::from_secs(10)).args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = runner.run(&cmd).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");

        let err = run_checked(&runner, &cmd).await.unwrap_err();
        assert!(matches!(err, DrError::ToolFailed { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_system_runner_stdin() {
        let cmd = ToolCommand::new("cat", Duration::from_secs(10)).stdin("piped body");
        let output = SystemRunner.run(&cmd).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "piped body");
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let cmd = ToolCommand::new("sleep", Duration::from_millis(100)).arg("5");
        let err = SystemRunner.run(&cmd).await.unwrap_err();
        assert!(matches!(err, DrError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let cmd = ToolCommand::new("dr-definitely-not-a-real-tool", Duration::from_secs(1));
        let err = SystemRunner.run(&cmd).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!SystemRunner.is_available("dr-definitely-not-a-real-tool"));
        assert!(SystemRunner.is_available("sh"));
    }
}
