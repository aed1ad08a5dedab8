//! Stray process reconciliation
//!
//! A dispatcher or launcher left over from an earlier run (for example after
//! the supervisor was killed hard) keeps the port busy. Before every start and
//! on full shutdown the process table is scanned by name and matches are
//! terminated. This is a heuristic safety net: individual failures are logged
//! and skipped, and nothing here is needed for correct supervision.

use sysinfo::{Pid, Signal, System};
use tracing::{debug, info, warn};

/// Which processes a sweep terminates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatch {
    /// Executable name, compared case-insensitively without `.exe`
    pub name: String,
    /// If set, the command line must also contain this text
    pub cmd_pattern: Option<String>,
}

impl ProcessMatch {
    /// Match processes running the executable at `program`
    pub fn executable(program: &str) -> Self {
        Self {
            name: executable_name(program),
            cmd_pattern: None,
        }
    }

    pub fn with_cmd_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.cmd_pattern = Some(pattern.into());
        self
    }

    fn matches(&self, name: &str, cmd: &[String]) -> bool {
        if self.name.is_empty() || executable_name(name) != self.name {
            return false;
        }
        match &self.cmd_pattern {
            None => true,
            Some(pattern) => cmd.iter().any(|arg| arg == pattern),
        }
    }
}

/// Lowercased file name of an executable, without a Windows `.exe` suffix
pub fn executable_name(program: &str) -> String {
    // Either separator, whatever the host platform
    let file = program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match file.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => file,
    }
}

/// Terminate every process matching one of `targets`, except `exclude` and
/// this process. Returns how many processes were signalled.
pub fn sweep(targets: &[ProcessMatch], exclude: &[u32]) -> usize {
    if targets.is_empty() {
        return 0;
    }

    let mut sys = System::new();
    sys.refresh_processes();
    let own_pid = std::process::id();

    let mut terminated = 0;
    for (pid, process) in sys.processes() {
        let raw_pid = pid.as_u32();
        if raw_pid == own_pid || exclude.contains(&raw_pid) {
            continue;
        }
        if !targets.iter().any(|t| t.matches(process.name(), process.cmd())) {
            continue;
        }

        // Graceful where the platform supports it, forced otherwise
        let signalled = match process.kill_with(Signal::Term) {
            Some(sent) => sent,
            None => process.kill(),
        };
        if signalled {
            info!(pid = raw_pid, name = process.name(), "Terminated stray process");
            terminated += 1;
        } else {
            warn!(pid = raw_pid, name = process.name(), "Could not terminate stray process");
        }
    }

    debug!(terminated, "Reconciliation sweep finished");
    terminated
}

/// A process found by [`find`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundProcess {
    pub pid: u32,
    pub name: String,
    /// Time since the process started
    pub run_time: std::time::Duration,
}

/// Processes matching one of `targets`, other than this one, ordered by pid
pub fn find(targets: &[ProcessMatch]) -> Vec<FoundProcess> {
    if targets.is_empty() {
        return Vec::new();
    }

    let mut sys = System::new();
    sys.refresh_processes();
    let own_pid = std::process::id();

    let mut found: Vec<FoundProcess> = sys
        .processes()
        .iter()
        .filter(|(pid, process)| {
            pid.as_u32() != own_pid
                && targets.iter().any(|t| t.matches(process.name(), process.cmd()))
        })
        .map(|(pid, process)| FoundProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            run_time: std::time::Duration::from_secs(process.run_time()),
        })
        .collect();
    found.sort_by_key(|p| p.pid);
    found
}

/// [`sweep`] on the blocking thread pool; scanning the process table is
/// synchronous
pub async fn sweep_async(targets: Vec<ProcessMatch>, exclude: Vec<u32>) -> usize {
    tokio::task::spawn_blocking(move || sweep(&targets, &exclude))
        .await
        .unwrap_or(0)
}

/// Whether a process with this pid exists
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_name() {
        assert_eq!(executable_name("webhook"), "webhook");
        assert_eq!(executable_name("/usr/local/bin/webhook"), "webhook");
        assert_eq!(executable_name("C:\\tools\\Webhook.exe"), executable_name("webhook.exe"));
        assert_eq!(executable_name("Webhook.EXE"), "webhook");
        assert_eq!(executable_name(""), "");
    }

    #[test]
    fn test_match_by_name() {
        let target = ProcessMatch::executable("/opt/webhook/webhook");
        assert!(target.matches("webhook", &[]));
        assert!(target.matches("WEBHOOK.exe", &[]));
        assert!(!target.matches("webhook-relay", &[]));
        assert!(!target.matches("python3", &["webhook".to_string()]));
    }

    #[test]
    fn test_match_requires_cmd_pattern() {
        let target = ProcessMatch::executable("scriptgate").with_cmd_pattern("invoke");
        let invoke = vec!["scriptgate".to_string(), "invoke".to_string(), "hello.py".to_string()];
        let serve = vec!["scriptgate".to_string(), "serve".to_string()];
        assert!(target.matches("scriptgate", &invoke));
        assert!(!target.matches("scriptgate", &serve));
    }

    #[test]
    fn test_empty_name_matches_nothing() {
        let target = ProcessMatch::executable("");
        assert!(!target.matches("", &[]));
        assert_eq!(sweep(&[], &[]), 0);
    }

    #[test]
    fn test_sweep_ignores_unmatched_processes() {
        let target = ProcessMatch::executable("scriptgate-no-such-process-name");
        assert!(find(&[target.clone()]).is_empty());
        assert_eq!(sweep(&[target], &[]), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_sweep_terminates_matching_process() {
        use std::os::unix::fs::PermissionsExt;

        // A script under a unique name; the kernel reports it as the process name
        let tmp = tempfile::TempDir::new().unwrap();
        let name = format!("sgstray{}", std::process::id());
        let program = tmp.path().join(&name);
        std::fs::write(&program, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut child = std::process::Command::new(&program).spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(is_running(child.id()));
        let target = ProcessMatch::executable(program.to_str().unwrap());
        let found = find(&[target]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, child.id());

        let swept = sweep(&[ProcessMatch::executable(program.to_str().unwrap())], &[]);
        assert_eq!(swept, 1);
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
