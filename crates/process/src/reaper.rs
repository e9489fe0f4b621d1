//! Orphan reaping.
//!
//! Three sweeps, run periodically and (aggressively) at startup:
//!
//! 1. registered PIDs whose session is no longer active,
//! 2. system-level orphans (reparented to PID 1 on Unix, parentless on
//!    Windows) whose command line matches our known binary names,
//! 3. idle direct children of this daemon: older than two minutes at 0% CPU.
//!
//! Explicit reaping is a correctness property here - a leaked provider
//! subprocess keeps burning quota long after its session died.

use std::time::Duration;

use crate::registry::ProcessRegistry;
use crate::spawn::kill_pid;

/// Idle-child age threshold.
const IDLE_CHILD_AGE: Duration = Duration::from_secs(120);

/// Command-line substrings swept at startup and by the periodic reaper.
#[derive(Debug, Clone)]
pub struct SweepPatterns {
    /// Child helpers: swept with no age gate.
    pub child: Vec<String>,
    /// Daemon binaries: only swept when older than `daemon_min_age`.
    pub daemon: Vec<String>,
    pub daemon_min_age: Duration,
}

impl Default for SweepPatterns {
    fn default() -> Self {
        Self {
            child: vec!["chroma-rpc".into()],
            daemon: vec!["claude-mem-worker".into()],
            daemon_min_age: Duration::from_secs(30 * 60),
        }
    }
}

/// One row of the system process table.
#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub pid: u32,
    pub ppid: u32,
    pub cpu_percent: f64,
    pub elapsed: Duration,
    pub command: String,
}

/// Periodic sweep: registered orphans, system orphans, and idle children.
/// Returns the number of processes killed.
pub fn reap_orphans(
    registry: &ProcessRegistry,
    active_session_ids: &[i64],
    patterns: &SweepPatterns,
) -> usize {
    let mut killed = 0;

    for pid in registry.orphaned_pids(active_session_ids) {
        tracing::info!(pid, "killing registered child of an inactive session");
        kill_pid(pid);
        registry.unregister(pid);
        killed += 1;
    }

    let table = list_system_processes();
    let own_pid = std::process::id();
    for victim in select_system_orphans(&table, patterns, own_pid) {
        tracing::info!(pid = victim.pid, command = %victim.command, "killing orphaned subprocess");
        kill_pid(victim.pid);
        killed += 1;
    }
    for victim in select_idle_children(&table, own_pid) {
        tracing::info!(pid = victim.pid, command = %victim.command, "killing idle direct child");
        kill_pid(victim.pid);
        killed += 1;
    }
    killed
}

/// Startup sweep: system orphans only (nothing is registered yet).
pub fn startup_sweep(patterns: &SweepPatterns) -> usize {
    let table = list_system_processes();
    let victims = select_system_orphans(&table, patterns, std::process::id());
    for victim in &victims {
        tracing::info!(pid = victim.pid, command = %victim.command, "killing leaked subprocess");
        kill_pid(victim.pid);
    }
    victims.len()
}

/// Orphans (reparented to PID 1, or parentless on Windows) whose command
/// line matches a sweep pattern. Child patterns have no age gate; daemon
/// patterns require `daemon_min_age`.
fn select_system_orphans<'a>(
    table: &'a [ProcInfo],
    patterns: &SweepPatterns,
    own_pid: u32,
) -> Vec<&'a ProcInfo> {
    table
        .iter()
        .filter(|p| p.ppid <= 1 && p.pid != own_pid)
        .filter(|p| {
            let child_match = patterns.child.iter().any(|pat| p.command.contains(pat));
            let daemon_match = patterns.daemon.iter().any(|pat| p.command.contains(pat))
                && p.elapsed >= patterns.daemon_min_age;
            child_match || daemon_match
        })
        .collect()
}

/// Direct children of this daemon that have sat idle (0% CPU) past the age
/// threshold.
fn select_idle_children(table: &[ProcInfo], own_pid: u32) -> Vec<&ProcInfo> {
    table
        .iter()
        .filter(|p| p.ppid == own_pid && p.elapsed >= IDLE_CHILD_AGE && p.cpu_percent == 0.0)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process-table listing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(unix)]
pub fn list_system_processes() -> Vec<ProcInfo> {
    let output = match std::process::Command::new("ps")
        .args(["-eo", "pid=,ppid=,pcpu=,etimes=,args="])
        .output()
    {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };
    parse_ps_output(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(windows)]
pub fn list_system_processes() -> Vec<ProcInfo> {
    // WMI query via wmic; elapsed time and CPU are not reported this way,
    // so Windows only participates in the name-match sweep.
    let output = match std::process::Command::new("wmic")
        .args([
            "process",
            "get",
            "ProcessId,ParentProcessId,CommandLine",
            "/format:csv",
        ])
        .output()
    {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut procs = Vec::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 {
            continue;
        }
        // CSV layout: Node,CommandLine,ParentProcessId,ProcessId
        let command = fields[1].to_owned();
        let ppid = fields[2].trim().parse().unwrap_or(0);
        let pid = match fields[3].trim().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        procs.push(ProcInfo {
            pid,
            ppid,
            cpu_percent: -1.0,
            elapsed: Duration::ZERO,
            command,
        });
    }
    procs
}

fn parse_ps_output(text: &str) -> Vec<ProcInfo> {
    let mut procs = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(pid), Some(ppid), Some(pcpu), Some(etimes)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>()) else {
            continue;
        };
        let command: String = parts.collect::<Vec<_>>().join(" ");
        procs.push(ProcInfo {
            pid,
            ppid,
            cpu_percent: pcpu.parse().unwrap_or(0.0),
            elapsed: Duration::from_secs(etimes.parse().unwrap_or(0)),
            command,
        });
    }
    procs
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, ppid: u32, cpu: f64, elapsed_secs: u64, command: &str) -> ProcInfo {
        ProcInfo {
            pid,
            ppid,
            cpu_percent: cpu,
            elapsed: Duration::from_secs(elapsed_secs),
            command: command.into(),
        }
    }

    #[test]
    fn parse_ps_lines() {
        let text = "  101  1  0.0  500  chroma-rpc --path /data\n\
                    notanumber x y z junk\n\
                      202  100  3.5  10  claude -p\n";
        let procs = parse_ps_output(text);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 101);
        assert_eq!(procs[0].ppid, 1);
        assert_eq!(procs[0].command, "chroma-rpc --path /data");
        assert_eq!(procs[1].cpu_percent, 3.5);
    }

    #[test]
    fn child_patterns_have_no_age_gate() {
        let patterns = SweepPatterns::default();
        let table = vec![proc(300, 1, 0.0, 1, "chroma-rpc --path /x")];
        let victims = select_system_orphans(&table, &patterns, 7777);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].pid, 300);
    }

    #[test]
    fn daemon_patterns_respect_the_age_gate() {
        let patterns = SweepPatterns::default();
        let young = vec![proc(301, 1, 0.0, 60, "claude-mem-worker serve")];
        assert!(select_system_orphans(&young, &patterns, 7777).is_empty());

        let old = vec![proc(301, 1, 0.0, 31 * 60, "claude-mem-worker serve")];
        assert_eq!(select_system_orphans(&old, &patterns, 7777).len(), 1);
    }

    #[test]
    fn non_orphans_are_left_alone() {
        let patterns = SweepPatterns::default();
        let table = vec![proc(400, 1234, 0.0, 9999, "chroma-rpc --path /x")];
        assert!(select_system_orphans(&table, &patterns, 7777).is_empty());
    }

    #[test]
    fn own_pid_is_never_swept() {
        let patterns = SweepPatterns {
            daemon: vec!["claude-mem-worker".into()],
            daemon_min_age: Duration::ZERO,
            ..SweepPatterns::default()
        };
        let table = vec![proc(500, 1, 0.0, 9999, "claude-mem-worker serve")];
        assert!(select_system_orphans(&table, &patterns, 500).is_empty());
    }

    #[test]
    fn idle_children_require_age_and_zero_cpu() {
        let own = 7777;
        let table = vec![
            proc(1, own, 0.0, 300, "stuck-child"),
            proc(2, own, 1.5, 300, "busy-child"),
            proc(3, own, 0.0, 30, "young-child"),
            proc(4, 9999, 0.0, 300, "not-ours"),
        ];
        let victims = select_idle_children(&table, own);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].pid, 1);
    }

    #[test]
    fn unknown_commands_never_match() {
        let patterns = SweepPatterns::default();
        let table = vec![
            proc(600, 1, 0.0, 9999, "postgres -D /var/lib"),
            proc(601, 1, 0.0, 9999, "sshd: user@pts/0"),
        ];
        assert!(select_system_orphans(&table, &patterns, 7777).is_empty());
    }
}
