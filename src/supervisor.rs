//! spawns and tears down the worker fleet.
//!
//! The supervisor runs as the parent of N worker processes, each a
//! re-invocation of this executable running the worker loop. The fleet
//! is advertised through a liveness file of newline-separated PIDs,
//! parent first; `stop` finds the fleet through that file, asks the
//! parent to drain, and escalates to forced termination if the drain
//! overruns its budget.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::select;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::error::QueueError;

/// Well-known liveness file name, relative to the working directory.
pub const PID_FILE: &str = ".queuectl.pids";

/// How long a graceful drain may take before workers are killed.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Cadence for child-exit and PID-liveness polling.
const POLL: Duration = Duration::from_millis(200);

pub struct Supervisor {
    pid_file: PathBuf,
    /// Arguments the current executable is re-invoked with to run one
    /// worker in the foreground.
    worker_args: Vec<String>,
}

impl Supervisor {
    pub fn new(pid_file: PathBuf, worker_args: Vec<String>) -> Self {
        Self {
            pid_file,
            worker_args,
        }
    }

    /// Spawns `count` workers, writes the liveness file and supervises
    /// until signalled (SIGINT/SIGTERM) or every worker has exited on
    /// its own. Dead workers are logged, not restarted. On the way out
    /// the fleet is drained gracefully and the liveness file removed.
    pub async fn start(&self, count: usize) -> Result<(), QueueError> {
        self.ensure_not_running()?;

        let exe = std::env::current_exe()?;
        let mut children: Vec<(u32, Child)> = Vec::with_capacity(count);
        for n in 0..count {
            let child = Command::new(&exe)
                .args(&self.worker_args)
                .stdin(Stdio::null())
                .spawn()?;
            match child.id() {
                Some(pid) => {
                    info!(pid, worker = n, "spawned worker");
                    children.push((pid, child));
                },
                None => warn!(worker = n, "worker exited before startup"),
            }
        }

        let mut pids = vec![std::process::id()];
        pids.extend(children.iter().map(|(pid, _)| *pid));
        write_pids(&self.pid_file, &pids)?;
        info!(
            count = children.len(),
            file = %self.pid_file.display(),
            "fleet started",
        );

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            select! {
                result = &mut shutdown => {
                    result?;
                    info!("shutdown requested, draining workers");
                    break;
                },
                _ = sleep(POLL) => {
                    children.retain_mut(|(pid, child)| {
                        match child.try_wait() {
                            Ok(Some(status)) => {
                                warn!(pid = *pid, %status, "worker exited");
                                false
                            },
                            Ok(None) => true,
                            Err(error) => {
                                warn!(pid = *pid, %error, "lost track of worker");
                                false
                            },
                        }
                    });
                    if children.is_empty() {
                        info!("all workers have exited");
                        break;
                    }
                },
            }
        }

        self.drain(children).await;

        if let Err(error) = std::fs::remove_file(&self.pid_file) {
            warn!(%error, "could not remove liveness file");
        }
        Ok(())
    }

    /// Stops a running fleet from outside: signals the parent from the
    /// liveness file, waits out the graceful drain, escalates to forced
    /// termination, and cleans up the file.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let Some(pids) = read_pids(&self.pid_file)? else {
            return Err(QueueError::NoFleet);
        };

        // The parent drains its own workers on SIGTERM; signalling it
        // once keeps each worker's shutdown single-stage (graceful).
        match pids.first() {
            Some(&parent) if is_alive(parent) => {
                info!(parent, "asking fleet to drain");
                terminate(parent);
            },
            _ => {
                // Parent is gone; fall back to signalling workers directly.
                for &pid in pids.iter().skip(1).filter(|&&p| is_alive(p)) {
                    warn!(pid, "parent gone, signalling worker directly");
                    terminate(pid);
                }
            },
        }

        // The parent needs its own grace budget plus a margin for the
        // escalation it performs on stragglers.
        let deadline = Instant::now() + STOP_GRACE + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !pids.iter().any(|&pid| is_alive(pid)) {
                break;
            }
            sleep(POLL).await;
        }

        for &pid in pids.iter().filter(|&&p| is_alive(p)) {
            warn!(pid, "still alive after drain budget, killing");
            kill(pid);
        }

        match std::fs::remove_file(&self.pid_file) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        info!("fleet stopped");
        Ok(())
    }

    // Graceful first, forced after the grace window.
    async fn drain(&self, mut children: Vec<(u32, Child)>) {
        for (pid, _) in &children {
            terminate(*pid);
        }

        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            children.retain_mut(|(_, child)| {
                !matches!(child.try_wait(), Ok(Some(_)))
            });
            if children.is_empty() {
                return;
            }
            sleep(POLL).await;
        }

        for (pid, child) in &mut children {
            warn!(pid = *pid, "worker ignored drain, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    fn ensure_not_running(&self) -> Result<(), QueueError> {
        match read_pids(&self.pid_file)? {
            Some(pids) => match pids.first() {
                Some(&parent) if is_alive(parent) => {
                    Err(QueueError::AlreadyRunning(parent))
                },
                _ => {
                    warn!(
                        file = %self.pid_file.display(),
                        "removing stale liveness file",
                    );
                    std::fs::remove_file(&self.pid_file)?;
                    Ok(())
                },
            },
            None => Ok(()),
        }
    }
}

/// Reads the liveness file. `None` means no supervised fleet exists.
pub fn read_pids(pid_file: &Path) -> Result<Option<Vec<u32>>, QueueError> {
    let raw = match std::fs::read_to_string(pid_file) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let pids = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim().parse::<u32>().map_err(|_| {
                QueueError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("malformed liveness file entry: {line:?}"),
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(pids))
}

fn write_pids(pid_file: &Path, pids: &[u32]) -> Result<(), QueueError> {
    let mut contents = String::new();
    for pid in pids {
        contents.push_str(&pid.to_string());
        contents.push('\n');
    }
    std::fs::write(pid_file, contents)?;
    Ok(())
}

/// Whether a PID currently names a live process.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill as nix_kill;
    use nix::unistd::Pid;

    // Signal 0 probes without delivering; EPERM still means alive.
    match nix_kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .is_ok_and(|o| {
            String::from_utf8_lossy(&o.stdout).contains(&pid.to_string())
        })
}

// Graceful shutdown request.
#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill as nix_kill, Signal};
    use nix::unistd::Pid;

    let _ = nix_kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(windows)]
fn terminate(pid: u32) {
    // No reliable cooperative signal on Windows; forced process-tree
    // termination is the accepted fallback here.
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .status();
}

// Forced termination.
#[cfg(unix)]
fn kill(pid: u32) {
    use nix::sys::signal::{kill as nix_kill, Signal};
    use nix::unistd::Pid;

    let _ = nix_kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(windows)]
fn kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .status();
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    select! {
        _ = term.recv() => {},
        _ = int.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE);

        assert_eq!(read_pids(&path).unwrap(), None);

        write_pids(&path, &[100, 200, 300]).unwrap();
        assert_eq!(read_pids(&path).unwrap(), Some(vec![100, 200, 300]));
    }

    #[test]
    fn test_malformed_pid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE);
        std::fs::write(&path, "123\nnot-a-pid\n").unwrap();

        assert!(read_pids(&path).is_err());
    }

    // A PID no kernel hands out (far above any pid_max), but still in
    // range for the signal syscall.
    const DEAD_PID: u32 = i32::MAX as u32 - 1;

    #[test]
    fn test_is_alive() {
        // Our own process is certainly alive.
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(DEAD_PID));
    }

    #[tokio::test]
    async fn test_stop_without_fleet_fails() {
        let dir = TempDir::new().unwrap();
        let supervisor =
            Supervisor::new(dir.path().join(PID_FILE), Vec::new());

        assert!(matches!(
            supervisor.stop().await,
            Err(QueueError::NoFleet)
        ));
    }

    #[test]
    fn test_stale_liveness_file_is_cleared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE);
        // A parent PID that cannot be alive.
        write_pids(&path, &[DEAD_PID]).unwrap();

        let supervisor = Supervisor::new(path.clone(), Vec::new());
        supervisor.ensure_not_running().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_live_parent_blocks_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE);
        write_pids(&path, &[std::process::id()]).unwrap();

        let supervisor = Supervisor::new(path, Vec::new());
        assert!(matches!(
            supervisor.ensure_not_running(),
            Err(QueueError::AlreadyRunning(_))
        ));
    }
}
