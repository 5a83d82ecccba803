//! Launcher adapter (C7): the seam between the scheduler and whatever
//! OS-level facility actually enforces a job's resource limits.
//!
//! Handles are opaque strings, derivable purely from `jobid`, so that
//! post-restart probing works without any in-memory state (spec §4.7).

use anyhow::Result;
use std::process::{Command, Stdio};
use thiserror::Error;

use crate::record::JobRecord;

#[derive(Debug, Error)]
#[error("failed to launch job {jobid}: {message}")]
pub struct LaunchError {
    pub jobid: u64,
    pub message: String,
}

pub trait Launcher: Send + Sync {
    /// Spawn `record` as a resource-limited unit, returning its opaque
    /// handle. Must not block waiting for the job to finish.
    fn launch(&self, record: &JobRecord) -> Result<String, LaunchError>;

    /// Whether the unit identified by `handle` is still active.
    fn alive(&self, handle: &str) -> bool;

    /// The unit's exit code, once it is no longer alive. `None` if it
    /// cannot be determined (e.g. the unit vanished without a recorded
    /// status — the scheduler treats this the same as "not alive").
    fn exit_code(&self, handle: &str) -> Option<i32>;

    /// Send the unit a graceful termination signal. Must return
    /// immediately without waiting for the unit to actually exit — the
    /// scheduler reaps it on a later tick (spec §5: "no per-job blocking
    /// wait exists in the scheduler"). Escalation to a forceful kill after
    /// `T_kill_grace` is the scheduler's job, via [`Launcher::force_kill`].
    fn terminate(&self, handle: &str) -> Result<()>;

    /// Send the unit a forceful termination signal (e.g. `SIGKILL`). Also
    /// must not block on the unit actually exiting.
    fn force_kill(&self, handle: &str) -> Result<()>;
}

/// Build the deterministic handle for a job (shared by backends that key
/// off jobid rather than maintaining their own handle allocation).
fn unit_name(jobid: u64) -> String {
    format!("jqs-{jobid}")
}

/// Resolve the launcher backend selected via `JQS_LAUNCHER`
/// (`systemd-run` by default, `direct` for portability/tests; spec §9
/// "Launcher abstraction... a mock for tests").
pub fn resolve() -> Box<dyn Launcher> {
    match std::env::var("JQS_LAUNCHER").as_deref() {
        Ok("direct") => Box::new(DirectLauncher::new()),
        _ => Box::new(SystemdRunLauncher),
    }
}

/// Targets a `systemd --user` transient scope with hard CPU/memory limits,
/// per spec §4.7 ("a transient scope with a CPU quota equal to cores ×
/// 100% and a memory high/max equal to mem_mb").
pub struct SystemdRunLauncher;

impl Launcher for SystemdRunLauncher {
    fn launch(&self, record: &JobRecord) -> Result<String, LaunchError> {
        let unit = unit_name(record.jobid);
        let cpu_quota = format!("CPUQuota={}%", record.cores * 100);
        let mem_max = format!("MemoryMax={}M", record.mem_mb);

        let stdout_file = std::fs::File::create(&record.stdout_path).map_err(|e| LaunchError {
            jobid: record.jobid,
            message: format!("create stdout file {}: {e}", record.stdout_path),
        })?;
        let stderr_file = std::fs::File::create(&record.stderr_path).map_err(|e| LaunchError {
            jobid: record.jobid,
            message: format!("create stderr file {}: {e}", record.stderr_path),
        })?;

        if !std::path::Path::new(&record.workdir).is_dir() {
            return Err(LaunchError {
                jobid: record.jobid,
                message: format!("workdir does not exist at launch time: {}", record.workdir),
            });
        }

        let status = Command::new("systemd-run")
            .arg("--user")
            .arg("--scope")
            .arg(format!("--unit={unit}"))
            .arg("--collect")
            .arg(format!("-p{cpu_quota}"))
            .arg(format!("-p{mem_max}"))
            .arg("--working-directory")
            .arg(&record.workdir)
            .arg("--")
            .arg(&record.script_path)
            .stdin(Stdio::null())
            .stdout(stdout_file)
            .stderr(stderr_file)
            .spawn();

        match status {
            Ok(_child) => Ok(unit),
            Err(e) => Err(LaunchError {
                jobid: record.jobid,
                message: format!("spawn systemd-run: {e}"),
            }),
        }
    }

    fn alive(&self, handle: &str) -> bool {
        systemctl_show(handle, "ActiveState")
            .map(|state| state == "active" || state == "activating")
            .unwrap_or(false)
    }

    fn exit_code(&self, handle: &str) -> Option<i32> {
        systemctl_show(handle, "ExecMainStatus").and_then(|s| s.parse().ok())
    }

    fn terminate(&self, handle: &str) -> Result<()> {
        // `--no-block` returns as soon as the stop job is queued, instead
        // of waiting for the unit to actually exit.
        let _ = Command::new("systemctl")
            .args(["--user", "--no-block", "stop", &format!("{handle}.scope")])
            .status();
        Ok(())
    }

    fn force_kill(&self, handle: &str) -> Result<()> {
        let _ = Command::new("systemctl")
            .args(["--user", "kill", "--signal=SIGKILL", &format!("{handle}.scope")])
            .status();
        Ok(())
    }
}

fn systemctl_show(handle: &str, property: &str) -> Option<String> {
    let unit = format!("{handle}.scope");
    let output = Command::new("systemctl")
        .args(["--user", "show", &format!("--property={property}"), "--value", &unit])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

/// Spawns the script directly via `std::process::Command`, with no OS-level
/// resource enforcement. Used by the integration test suite and on hosts
/// without a systemd user session; accounting (C4) still gates admission
/// even though the OS does not enforce the limits itself (spec §A.4).
pub struct DirectLauncher {
    children: std::sync::Mutex<std::collections::HashMap<String, std::process::Child>>,
}

impl DirectLauncher {
    pub fn new() -> Self {
        DirectLauncher {
            children: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for DirectLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for DirectLauncher {
    fn launch(&self, record: &JobRecord) -> Result<String, LaunchError> {
        if !std::path::Path::new(&record.workdir).is_dir() {
            return Err(LaunchError {
                jobid: record.jobid,
                message: format!("workdir does not exist at launch time: {}", record.workdir),
            });
        }

        let stdout_file = std::fs::File::create(&record.stdout_path).map_err(|e| LaunchError {
            jobid: record.jobid,
            message: format!("create stdout file {}: {e}", record.stdout_path),
        })?;
        let stderr_file = std::fs::File::create(&record.stderr_path).map_err(|e| LaunchError {
            jobid: record.jobid,
            message: format!("create stderr file {}: {e}", record.stderr_path),
        })?;

        let child = Command::new(&record.script_path)
            .current_dir(&record.workdir)
            .stdin(Stdio::null())
            .stdout(stdout_file)
            .stderr(stderr_file)
            .spawn()
            .map_err(|e| LaunchError {
                jobid: record.jobid,
                message: format!("spawn {}: {e}", record.script_path),
            })?;

        let handle = format!("pid:{}", child.id());
        self.children.lock().unwrap().insert(handle.clone(), child);
        Ok(handle)
    }

    fn alive(&self, handle: &str) -> bool {
        let mut children = self.children.lock().unwrap();
        if let Some(child) = children.get_mut(handle) {
            match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(_) => false,
            }
        } else {
            // Not a child of this process (e.g. after a scheduler restart);
            // fall back to a liveness-only signal-0 probe. Exit code cannot
            // be recovered in that case.
            pid_from_handle(handle).map(probe_pid_alive).unwrap_or(false)
        }
    }

    fn exit_code(&self, handle: &str) -> Option<i32> {
        let mut children = self.children.lock().unwrap();
        let child = children.get_mut(handle)?;
        match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    fn terminate(&self, handle: &str) -> Result<()> {
        if let Some(pid) = pid_from_handle(handle) {
            send_signal(pid, libc::SIGTERM);
        }
        Ok(())
    }

    fn force_kill(&self, handle: &str) -> Result<()> {
        if let Some(pid) = pid_from_handle(handle) {
            send_signal(pid, libc::SIGKILL);
        }
        Ok(())
    }
}

fn pid_from_handle(handle: &str) -> Option<u32> {
    handle.strip_prefix("pid:")?.parse().ok()
}

#[cfg(unix)]
fn probe_pid_alive(pid: u32) -> bool {
    // SAFETY: kill(2) with signal 0 performs no action beyond existence/
    // permission checks and is safe to call with any pid.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) is safe to call with any pid and valid signal number.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}
