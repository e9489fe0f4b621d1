//! Child spawning helpers.
//!
//! `spawn_captured` always yields a PID and routes Windows `.cmd`/`.bat`
//! entry points through `cmd.exe`, so `PATH`-resolved launchers behave the
//! same in every shell. `ensure_exit` awaits a graceful exit and escalates
//! to a hard kill after the deadline.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use cm_domain::error::{Error, Result};

/// Spawn `program args...` with piped stdio and return the child plus PID.
pub fn spawn_captured(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<(Child, u32)> {
    let mut command = build_command(program, args);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command
        .spawn()
        .map_err(|e| Error::Other(format!("spawning {program}: {e}")))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Other(format!("{program} exited before PID capture")))?;
    Ok((child, pid))
}

#[cfg(windows)]
fn build_command(program: &str, args: &[&str]) -> Command {
    let lowered = program.to_ascii_lowercase();
    if lowered.ends_with(".cmd") || lowered.ends_with(".bat") {
        let mut command = Command::new("cmd.exe");
        command.arg("/C").arg(program).args(args);
        return command;
    }
    let mut command = Command::new(program);
    command.args(args);
    command
}

#[cfg(not(windows))]
fn build_command(program: &str, args: &[&str]) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    command
}

/// Await a child's exit up to `timeout`, then SIGKILL and reap.
pub async fn ensure_exit(child: &mut Child, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            status?;
            Ok(())
        }
        Err(_) => {
            tracing::warn!(
                pid = child.id(),
                timeout_ms = timeout.as_millis() as u64,
                "child did not exit in time, killing"
            );
            child.start_kill().map_err(Error::Io)?;
            child.wait().await?;
            Ok(())
        }
    }
}

/// Send SIGKILL (TerminateProcess on Windows) to an arbitrary PID we no
/// longer hold a handle for. Best-effort.
pub fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .args(["-KILL", &pid.to_string()])
            .status();
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .status();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_captures_a_pid() {
        let (mut child, pid) = spawn_captured("sh", &["-c", "true"], None).unwrap();
        assert!(pid > 0);
        ensure_exit(&mut child, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_exit_kills_a_hung_child() {
        let (mut child, _pid) = spawn_captured("sh", &["-c", "sleep 30"], None).unwrap();
        let start = std::time::Instant::now();
        ensure_exit(&mut child, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spawn_missing_program_errors() {
        let result = spawn_captured("definitely-not-a-real-binary-xyz", &[], None);
        assert!(result.is_err());
    }
}
