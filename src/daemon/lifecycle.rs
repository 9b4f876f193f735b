// Daemon lifecycle: PID file, single-instance guard, stop from another process.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `stop_daemon` waits after SIGTERM. Shutdown deregisters every
/// agent, which is a few bus round-trips.
const GRACEFUL_STOP: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(100);

/// What the PID file says about a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32 },
    /// PID file exists but the process is gone (or the file is unreadable).
    Stale,
    NotRunning,
}

pub struct DaemonLifecycle {
    pid_file: PathBuf,
}

impl DaemonLifecycle {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        if !self.pid_file.exists() {
            return DaemonStatus::NotRunning;
        }
        self.read_pid()
            .ok()
            .filter(|pid| process_exists(*pid))
            .map_or(DaemonStatus::Stale, |pid| DaemonStatus::Running { pid })
    }

    /// Claim the PID file for this process. Fails if another live daemon
    /// holds it; a stale file is replaced.
    pub fn acquire(&self) -> Result<()> {
        let own = std::process::id();
        match self.status() {
            DaemonStatus::Running { pid } if pid != own => anyhow::bail!(
                "agentlink daemon already running as pid {} (use `agentlink daemon stop`)",
                pid
            ),
            DaemonStatus::Stale => {
                warn!(path = %self.pid_file.display(), "replacing stale pid file");
                self.cleanup()?;
            }
            _ => {}
        }

        let dir = self.pid_file.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        fs::write(&self.pid_file, format!("{}\n", own))
            .with_context(|| format!("writing pid file {}", self.pid_file.display()))?;
        debug!(pid = own, path = %self.pid_file.display(), "pid file acquired");
        Ok(())
    }

    /// Remove the PID file. Missing is fine.
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => {
                debug!(path = %self.pid_file.display(), "pid file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing pid file {}", self.pid_file.display())),
        }
    }

    pub fn read_pid(&self) -> Result<u32> {
        let raw = fs::read_to_string(&self.pid_file)
            .with_context(|| format!("reading pid file {}", self.pid_file.display()))?;
        raw.trim()
            .parse::<u32>()
            .with_context(|| format!("pid file {} holds {:?}", self.pid_file.display(), raw.trim()))
    }

    /// Stop a running daemon: SIGTERM, a grace period, then SIGKILL.
    /// Returns the pid that was stopped, or None if nothing was running.
    pub fn stop_daemon(&self) -> Result<Option<u32>> {
        let pid = match self.status() {
            DaemonStatus::Running { pid } => pid,
            DaemonStatus::Stale => {
                self.cleanup()?;
                return Ok(None);
            }
            DaemonStatus::NotRunning => return Ok(None),
        };

        info!(pid, "stopping daemon");
        terminate(pid)?;
        if !wait_for_exit(pid, GRACEFUL_STOP) {
            warn!(pid, grace_secs = GRACEFUL_STOP.as_secs(), "daemon ignored SIGTERM, killing");
            kill(pid)?;
            if !wait_for_exit(pid, Duration::from_millis(500)) {
                anyhow::bail!("daemon pid {} survived SIGKILL", pid);
            }
        }
        self.cleanup()?;
        Ok(Some(pid))
    }
}

fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !process_exists(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL);
    }
}

#[cfg(target_family = "unix")]
fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::unistd::Pid;
    let target = i32::try_from(pid).context("pid out of range")?;
    nix::sys::signal::kill(Pid::from_raw(target), signal)
        .with_context(|| format!("sending {:?} to pid {}", signal, pid))
}

#[cfg(target_family = "unix")]
fn terminate(pid: u32) -> Result<()> {
    send(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(target_family = "unix")]
fn kill(pid: u32) -> Result<()> {
    send(pid, nix::sys::signal::Signal::SIGKILL)
}

// Windows has no graceful signal for a console-less process; both steps
// force-terminate.
#[cfg(target_family = "windows")]
fn terminate(pid: u32) -> Result<()> {
    kill(pid)
}

#[cfg(target_family = "windows")]
fn kill(pid: u32) -> Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()
        .context("running taskkill")?;
    anyhow::ensure!(status.success(), "taskkill failed for pid {}", pid);
    Ok(())
}

/// Whether a process with `pid` exists.
#[cfg(target_family = "unix")]
pub fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Ok(target) = i32::try_from(pid) else {
        return false;
    };
    if target == 0 {
        return false;
    }
    // Signal 0 probes only. EPERM: alive but owned by someone else.
    matches!(
        nix::sys::signal::kill(Pid::from_raw(target), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

#[cfg(target_family = "windows")]
pub fn process_exists(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, ProcessRefreshKind::nothing());
    system.process(Pid::from(pid as usize)).is_some()
}
