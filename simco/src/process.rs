//! Process spawning and termination service.
//!
//! [`ModuleProcessService`] is the seam between the module manager and
//! the OS: production uses [`OsModuleProcessService`], tests inject
//! their own implementation.

use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{CoordinatorError, CoordinatorResult};

/// Grace period between SIGTERM and SIGKILL escalation.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Collaborator interface used by the module manager to fork/exec and
/// terminate module processes.
pub trait ModuleProcessService: Send + Sync {
    /// Spawn a module process with `envs` added to its environment and
    /// stdout/stderr redirected to `log_path`. Returns the child pid.
    fn create_module(
        &self,
        path: &Path,
        args: &[String],
        envs: &[(String, String)],
        log_path: &Path,
    ) -> CoordinatorResult<Pid>;

    /// Terminate a module process: SIGTERM, bounded wait, SIGKILL.
    fn terminate_module(&self, pid: Pid) -> CoordinatorResult<()>;
}

/// Check if a process is alive using `kill(pid, 0)`.
pub fn is_process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        // Process exists but we may not signal it.
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// OS-backed implementation of [`ModuleProcessService`].
#[derive(Debug, Default)]
pub struct OsModuleProcessService;

impl ModuleProcessService for OsModuleProcessService {
    fn create_module(
        &self,
        path: &Path,
        args: &[String],
        envs: &[(String, String)],
        log_path: &Path,
    ) -> CoordinatorResult<Pid> {
        let log = File::create(log_path).map_err(|e| {
            CoordinatorError::Process(format!(
                "cannot create log file {}: {e}",
                log_path.display()
            ))
        })?;
        let log_err = log.try_clone().map_err(|e| CoordinatorError::Process(e.to_string()))?;

        let child = Command::new(path)
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| {
                CoordinatorError::Process(format!("spawning {} failed: {e}", path.display()))
            })?;

        let pid = Pid::from_raw(child.id() as i32);
        info!(pid = pid.as_raw(), path = %path.display(), "module process spawned");
        // The reaper owns exit collection; the Child handle is dropped
        // without waiting.
        Ok(pid)
    }

    fn terminate_module(&self, pid: Pid) -> CoordinatorResult<()> {
        if !is_process_alive(pid) {
            return Ok(());
        }
        kill(pid, Signal::SIGTERM)
            .map_err(|e| CoordinatorError::Process(format!("SIGTERM {pid} failed: {e}")))?;

        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if !is_process_alive(pid) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        warn!(pid = pid.as_raw(), "graceful termination timed out, escalating to SIGKILL");
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(e) => Err(CoordinatorError::Process(format!("SIGKILL {pid} failed: {e}"))),
        }
    }
}
