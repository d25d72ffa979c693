//! Process lifecycle: pid file, stale-instance sweep, crash recovery.
//!
//! One daemon per machine. Before binding, stale instances of this binary
//! are terminated and residual state files (pid file, recording flag) from
//! a crashed run are removed so external scripts never see a phantom
//! "recording" state.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::PathsConfig;

/// Remove residual state left by a previous run.
pub fn recover_stale_state(paths: &PathsConfig) {
    if paths.recording_flag.exists() {
        warn!(
            flag = %paths.recording_flag.display(),
            "cleaning up orphaned recording flag"
        );
        let _ = std::fs::remove_file(&paths.recording_flag);
    }
    if paths.pid_file.exists() {
        let _ = std::fs::remove_file(&paths.pid_file);
    }
}

pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())
}

pub fn remove_pid_file(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

/// `true` when a nul-separated `/proc/<pid>/cmdline` belongs to another
/// v2m daemon instance.
fn is_daemon_cmdline(cmdline: &[u8]) -> bool {
    let args: Vec<&str> = cmdline
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .filter_map(|part| std::str::from_utf8(part).ok())
        .collect();
    let Some(argv0) = args.first() else {
        return false;
    };
    let binary = Path::new(argv0)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(argv0);
    binary == "v2m" && args.iter().any(|arg| *arg == "daemon")
}

/// Terminate orphaned daemon instances of this binary.
#[cfg(unix)]
pub fn sweep_orphans() {
    let current_pid = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return;
    };

    let mut killed = 0u32;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == current_pid {
            continue;
        }
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if !is_daemon_cmdline(&cmdline) {
            continue;
        }

        warn!(pid, "terminating orphaned v2m daemon");
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            killed += 1;
        } else {
            debug!(pid, "kill failed: {}", std::io::Error::last_os_error());
        }
    }

    if killed > 0 {
        info!(killed, "orphaned daemon instances terminated");
    }
}

#[cfg(not(unix))]
pub fn sweep_orphans() {}
