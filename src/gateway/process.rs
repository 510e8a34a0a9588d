use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Cap on captured bytes per stream. The pipe is drained past the cap so a
/// chatty subprocess cannot deadlock on a full pipe buffer.
const MAX_CAPTURE: usize = 1_048_576;

/// Grace period between terminate and force-kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < MAX_CAPTURE {
                    let take = (MAX_CAPTURE - buf.len()).min(n);
                    buf.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    buf
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg("-15")
            .arg(pid.to_string())
            .status()
            .await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("Subprocess {} ignored SIGTERM, force-killing", pid);
    }
    let _ = child.kill().await;
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}

/// Run an argv vector with no shell interpretation, bounded output capture,
/// and a wall-clock timeout (0 = no limit). Environment variables named in
/// `strip_env` are removed before spawning.
///
/// "Binary not found" and "timed out" are normal outcomes (returncodes 127
/// and -1); only spawn failures with another cause are errors.
pub async fn run_command(
    argv: &[String],
    cwd: Option<&Path>,
    timeout_secs: u64,
    strip_env: &[String],
) -> Result<ExecOutcome> {
    let program = argv
        .first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for var in strip_env {
        cmd.env_remove(var);
    }
    if let Some(dir) = cwd
        && dir.is_dir()
    {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ExecOutcome {
                stdout: String::new(),
                stderr: format!("Command '{}' not found on host. Install it first.", program),
                returncode: 127,
            });
        }
        Err(e) => return Err(e).with_context(|| format!("spawning '{}'", program)),
    };

    let stdout_task = child.stdout.take().map(|p| tokio::spawn(read_capped(p)));
    let stderr_task = child.stderr.take().map(|p| tokio::spawn(read_capped(p)));

    let status = if timeout_secs == 0 {
        child.wait().await.context("waiting for subprocess")?
    } else {
        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(status) => status.context("waiting for subprocess")?,
            Err(_) => {
                debug!("Subprocess '{}' hit {}s timeout", program, timeout_secs);
                terminate(&mut child).await;
                if let Some(task) = stdout_task {
                    let _ = task.await;
                }
                if let Some(task) = stderr_task {
                    let _ = task.await;
                }
                return Ok(ExecOutcome {
                    stdout: String::new(),
                    stderr: "Command timed out".to_string(),
                    returncode: -1,
                });
            }
        }
    };

    let stdout = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(ExecOutcome {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        returncode: exit_code(status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_command(&argv(&["echo", "hello"]), None, 10, &[])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.returncode, 0);
    }

    #[tokio::test]
    async fn missing_binary_maps_to_127() {
        let out = run_command(&argv(&["definitely-not-a-real-binary-xyz"]), None, 10, &[])
            .await
            .unwrap();
        assert_eq!(out.returncode, 127);
        assert!(out.stderr.contains("not found"));
    }

    #[tokio::test]
    async fn timeout_maps_to_minus_one() {
        let start = std::time::Instant::now();
        let out = run_command(&argv(&["sleep", "30"]), None, 1, &[])
            .await
            .unwrap();
        assert_eq!(out.returncode, -1);
        assert_eq!(out.stderr, "Command timed out");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn argv_elements_are_not_shell_expanded() {
        let out = run_command(&argv(&["echo", "; touch /tmp/pwned"]), None, 10, &[])
            .await
            .unwrap();
        assert_eq!(out.returncode, 0);
        assert!(out.stdout.contains("; touch /tmp/pwned"));
    }

    #[tokio::test]
    async fn strip_env_removes_variables() {
        // Safety: variable is test-local and only read by the child process.
        unsafe { std::env::set_var("CIANA_STRIP_ME", "1") };
        let out = run_command(
            &argv(&["sh", "-c", "echo \"${CIANA_STRIP_ME:-unset}\""]),
            None,
            10,
            &["CIANA_STRIP_ME".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.trim(), "unset");
    }
}
