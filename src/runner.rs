//! Shell-runner shim: subprocess execution for recipe callbacks.
//!
//! Scripts run through a shell (recipes are shell-oriented by nature), with
//! captured output caps, a thread-based timeout, and cooperative
//! cancellation. The engine polls its cancel flag before every spawn; the
//! native runner additionally kills in-flight children when the same flag
//! flips mid-run.

use crate::error::PhaseError;
use camino::Utf8PathBuf;
use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_OUTPUT_CAP: usize = 1 << 20;

/// Which shell interprets the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Sh,
    Bash,
    Cmd,
}

impl ShellKind {
    /// Platform default: `sh` on Unix, `cmd` on Windows.
    #[must_use]
    pub const fn platform_default() -> Self {
        if cfg!(windows) { Self::Cmd } else { Self::Sh }
    }

    const fn program(self) -> &'static str {
        match self {
            Self::Sh => "sh",
            Self::Bash => "bash",
            Self::Cmd => "cmd",
        }
    }

    const fn script_flag(self) -> &'static str {
        match self {
            Self::Sh | Self::Bash => "-c",
            Self::Cmd => "/C",
        }
    }
}

/// One subprocess invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub script: String,
    pub cwd: Utf8PathBuf,
    /// Overrides merged last over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub shell: ShellKind,
    /// Capture stdout/stderr into the result (capped) instead of
    /// inheriting the parent's streams.
    pub capture: bool,
    /// Treat a non-zero exit code as an error.
    pub check: bool,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    #[must_use]
    pub fn new(script: impl Into<String>, cwd: impl Into<Utf8PathBuf>) -> Self {
        Self {
            script: script.into(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            shell: ShellKind::platform_default(),
            capture: true,
            check: true,
            timeout: None,
        }
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub const fn shell(mut self, shell: ShellKind) -> Self {
        self.shell = shell;
        self
    }

    #[must_use]
    pub const fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a completed (not timed-out) subprocess.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RunResult {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes one shell script to completion.
pub trait ShellRunner: Send + Sync {
    fn run(&self, request: &RunRequest) -> Result<RunResult, PhaseError>;
}

/// Native subprocess runner with thread-based timeout handling.
#[derive(Debug, Clone, Default)]
pub struct NativeRunner {
    cancel: Option<Arc<AtomicBool>>,
    output_cap: Option<usize>,
}

impl NativeRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill in-flight children when `flag` flips to true.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub const fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = Some(cap);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Read a pipe to EOF, retaining at most `cap` bytes.
fn read_capped<R: Read>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
                // Keep draining past the cap so the child never blocks on a
                // full pipe.
            }
        }
    }
    kept
}

impl ShellRunner for NativeRunner {
    fn run(&self, request: &RunRequest) -> Result<RunResult, PhaseError> {
        if self.cancelled() {
            return Err(PhaseError::Cancelled);
        }

        let cap = self.output_cap.unwrap_or(DEFAULT_OUTPUT_CAP);
        let mut cmd = Command::new(request.shell.program());
        cmd.arg(request.shell.script_flag())
            .arg(&request.script)
            .current_dir(request.cwd.as_std_path())
            .envs(&request.env);
        if request.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd.stdin(Stdio::null());

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| PhaseError::Subprocess {
            reason: format!("failed to spawn {}: {e}", request.shell.program()),
        })?;

        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| std::thread::spawn(move || read_capped(pipe, cap)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| std::thread::spawn(move || read_capped(pipe, cap)));

        let deadline = request.timeout.map(|t| started + t);
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| PhaseError::Subprocess {
                reason: format!("wait failed: {e}"),
            })? {
                break status;
            }
            if self.cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PhaseError::Cancelled);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PhaseError::Timeout {
                    seconds: request.timeout.unwrap_or_default().as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        let code = status.code().unwrap_or(-1);
        debug!(code, elapsed_ms = started.elapsed().as_millis() as u64, "subprocess finished");

        if request.check && code != 0 {
            return Err(PhaseError::ShellExit { code });
        }

        Ok(RunResult {
            code,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn cwd(td: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap()
    }

    #[test]
    #[cfg(unix)]
    fn test_run_captures_stdout() {
        let td = TempDir::new().unwrap();
        let result = NativeRunner::new()
            .run(&RunRequest::new("echo hello-from-runner", cwd(&td)))
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello-from-runner");
    }

    #[test]
    #[cfg(unix)]
    fn test_nonzero_exit_with_check_is_shell_exit() {
        let td = TempDir::new().unwrap();
        let err = NativeRunner::new()
            .run(&RunRequest::new("exit 3", cwd(&td)))
            .unwrap_err();
        assert!(matches!(err, PhaseError::ShellExit { code: 3 }));
    }

    #[test]
    #[cfg(unix)]
    fn test_nonzero_exit_without_check_is_reported() {
        let td = TempDir::new().unwrap();
        let result = NativeRunner::new()
            .run(&RunRequest::new("exit 3", cwd(&td)).check(false))
            .unwrap();
        assert_eq!(result.code, 3);
    }

    #[test]
    #[cfg(unix)]
    fn test_env_overrides_reach_subprocess() {
        let td = TempDir::new().unwrap();
        let result = NativeRunner::new()
            .run(&RunRequest::new("echo \"$GALLEY_TEST_VAR\"", cwd(&td)).env("GALLEY_TEST_VAR", "42"))
            .unwrap();
        assert_eq!(result.stdout.trim(), "42");
    }

    #[test]
    #[cfg(unix)]
    fn test_timeout_kills_child() {
        let td = TempDir::new().unwrap();
        let started = Instant::now();
        let err = NativeRunner::new()
            .run(&RunRequest::new("sleep 30", cwd(&td)).timeout(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, PhaseError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    #[cfg(unix)]
    fn test_cancel_flag_blocks_new_spawns() {
        let td = TempDir::new().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let err = NativeRunner::new()
            .with_cancel(flag)
            .run(&RunRequest::new("echo never", cwd(&td)))
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    #[cfg(unix)]
    fn test_cwd_is_respected() {
        let td = TempDir::new().unwrap();
        let result = NativeRunner::new()
            .run(&RunRequest::new("pwd", cwd(&td)))
            .unwrap();
        let reported = result.stdout.trim();
        let canonical = std::fs::canonicalize(td.path()).unwrap();
        assert_eq!(
            std::fs::canonicalize(reported).unwrap(),
            canonical,
            "subprocess must run in the requested cwd"
        );
    }
}
