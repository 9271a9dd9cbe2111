//! Asynchronous child-process exit-status collection.
//!
//! One always-running collector thread polls `waitpid(WNOHANG)` for
//! every registered child and stores `(pid -> exit description)` under a
//! mutex/condvar pair. Lookups are consume-once: the first query for an
//! exited pid returns its description, subsequent queries find nothing.
//!
//! Callers on a hot path query non-forced and back off when the map is
//! contended; forced callers block on the lock (and force an immediate
//! collection pass first).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use simco_common::consts::REAPER_IDLE_SLEEP_MS;

#[derive(Default)]
struct ReaperState {
    /// Children registered for collection and not yet reaped.
    watched: HashSet<i32>,
    /// Exit descriptions of reaped children, consumed on first query.
    exit_info: HashMap<i32, String>,
}

struct ReaperInner {
    state: Mutex<ReaperState>,
    exited: Condvar,
    running: AtomicBool,
}

impl ReaperInner {
    /// One collection pass over every watched pid. Returns the number of
    /// children reaped.
    fn collect(&self) -> usize {
        let watched: Vec<i32> = {
            let state = self.state.lock();
            state.watched.iter().copied().collect()
        };
        let mut reaped = 0;
        for raw in watched {
            let desc = match waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => format!("process exited with code {code}"),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    format!("process killed by signal {signal}")
                }
                Ok(_) => continue,
                // ECHILD: someone else collected it; report it gone so
                // the owner does not wait forever.
                Err(nix::Error::ECHILD) => "process no longer exists".to_string(),
                Err(e) => {
                    debug!(pid = raw, "waitpid error: {e}");
                    continue;
                }
            };
            info!(pid = raw, "reaped child: {desc}");
            let mut state = self.state.lock();
            state.watched.remove(&raw);
            state.exit_info.insert(raw, desc);
            reaped += 1;
        }
        if reaped > 0 {
            self.exited.notify_all();
        }
        reaped
    }
}

/// Background collector of process exit statuses.
pub struct ModuleReaper {
    inner: Arc<ReaperInner>,
    thread: Option<JoinHandle<()>>,
}

impl Default for ModuleReaper {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleReaper {
    /// Start the collector thread.
    pub fn new() -> Self {
        let inner = Arc::new(ReaperInner {
            state: Mutex::new(ReaperState::default()),
            exited: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let worker = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("simco-reaper".to_string())
            .spawn(move || {
                while worker.running.load(Ordering::Acquire) {
                    if worker.collect() == 0 {
                        std::thread::sleep(Duration::from_millis(REAPER_IDLE_SLEEP_MS));
                    }
                }
            })
            .expect("spawning the reaper thread cannot fail");
        Self { inner, thread: Some(thread) }
    }

    /// Register a child for exit-status collection.
    pub fn add_query_handle(&self, pid: Pid) {
        self.inner.state.lock().watched.insert(pid.as_raw());
    }

    /// Stop watching a child without consuming anything.
    pub fn remove_query_handle(&self, pid: Pid) {
        let mut state = self.inner.state.lock();
        state.watched.remove(&pid.as_raw());
        state.exit_info.remove(&pid.as_raw());
    }

    /// Fetch and consume the exit description of `pid`, if it exited.
    ///
    /// Non-forced callers return `None` immediately when the map is
    /// contended; forced callers run a collection pass and block on the
    /// lock.
    pub fn get_module_exit_status(&self, pid: Pid, forced: bool) -> Option<String> {
        if forced {
            self.inner.collect();
            let mut state = self.inner.state.lock();
            state.exit_info.remove(&pid.as_raw())
        } else {
            let mut state = self.inner.state.try_lock()?;
            state.exit_info.remove(&pid.as_raw())
        }
    }

    /// Block up to `timeout` for the exit description of `pid`.
    pub fn wait_module_exit_status(&self, pid: Pid, timeout: Duration) -> Option<String> {
        self.inner.collect();
        let mut state = self.inner.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(desc) = state.exit_info.remove(&pid.as_raw()) {
                return Some(desc);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            self.inner.exited.wait_for(&mut state, deadline - now);
        }
    }
}

impl Drop for ModuleReaper {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("module reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn collects_exit_and_signal_statuses_consume_once() {
        let reaper = ModuleReaper::new();

        // A child that exits on its own.
        let child = Command::new("true").spawn().unwrap();
        let exited = Pid::from_raw(child.id() as i32);
        reaper.add_query_handle(exited);

        // A child we kill.
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let killed = Pid::from_raw(child.id() as i32);
        reaper.add_query_handle(killed);
        nix::sys::signal::kill(killed, nix::sys::signal::Signal::SIGKILL).unwrap();

        let desc = reaper
            .wait_module_exit_status(exited, Duration::from_secs(5))
            .expect("exit status must arrive");
        assert!(desc.contains("code 0"), "unexpected description: {desc}");
        // Consume-once: the second query finds nothing.
        assert_eq!(reaper.get_module_exit_status(exited, true), None);

        let desc = reaper
            .wait_module_exit_status(killed, Duration::from_secs(5))
            .expect("signal status must arrive");
        assert!(desc.contains("signal"), "unexpected description: {desc}");
        assert_eq!(reaper.get_module_exit_status(killed, true), None);
    }

    #[test]
    fn unknown_pid_reports_nothing() {
        let reaper = ModuleReaper::new();
        assert_eq!(reaper.get_module_exit_status(Pid::from_raw(1), true), None);
    }
}
