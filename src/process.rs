//! Master/worker process model.
//!
//! The master blocks the signals it cares about, forks `worker_processes`
//! children and then consumes signals synchronously with `sigwait`: a dead
//! child is reaped and replaced, a stop signal is forwarded to every child
//! as SIGTERM. Children inherit the blocked mask and run a signal thread
//! that stops their worker.

use crate::config::Config;
use crate::logic;
use crate::runtime::timer::HeartbeatPolicy;
use crate::runtime::worker::Worker;
use nix::errno::Errno;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A child dying faster than this is respawned after a pause.
const MIN_CHILD_LIFETIME: Duration = Duration::from_secs(1);
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Which side of the fork this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker(usize),
}

impl Role {
    pub fn title(&self) -> String {
        match self {
            Role::Master => "master process".to_string(),
            Role::Worker(slot) => format!("worker process {slot}"),
        }
    }
}

#[derive(Debug)]
struct Child {
    slot: usize,
    started: Instant,
}

/// Master-side bookkeeping.
pub struct Supervisor<'a> {
    config: &'a Config,
    children: HashMap<Pid, Child>,
    stopping: bool,
}

impl<'a> Supervisor<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            children: HashMap::new(),
            stopping: false,
        }
    }

    /// Fork the workers and supervise them until a stop signal arrives.
    pub fn run(mut self) -> io::Result<()> {
        let signals = master_signals();
        signals.thread_block()?;
        set_process_title(&Role::Master.title());

        info!(workers = self.config.worker_processes, pid = %std::process::id(), "Master started");
        for slot in 0..self.config.worker_processes {
            self.spawn(slot)?;
        }

        while !self.stopping {
            let signal = match signals.wait() {
                Ok(signal) => signal,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            match signal {
                Signal::SIGCHLD => self.reap_and_respawn()?,
                Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT => {
                    info!(signal = ?signal, "Master shutting down");
                    self.stopping = true;
                }
                other => debug!(signal = ?other, "Ignoring signal"),
            }
        }

        self.terminate_children();
        info!("Master stopped");
        Ok(())
    }

    fn spawn(&mut self, slot: usize) -> io::Result<()> {
        // SAFETY: the master never starts threads, so the child is a copy of a
        // single-threaded process.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                info!(slot, pid = %child, "Worker process started");
                self.children.insert(
                    child,
                    Child {
                        slot,
                        started: Instant::now(),
                    },
                );
                Ok(())
            }
            ForkResult::Child => {
                let role = Role::Worker(slot);
                set_process_title(&role.title());
                let code = match run_worker(self.config) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(slot, error = %e, "Worker process failed");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    /// Collect every exited child and start a replacement for each.
    fn reap_and_respawn(&mut self) -> io::Result<()> {
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            let pid = match status {
                WaitStatus::Exited(pid, code) => {
                    warn!(pid = %pid, code, "Worker process exited");
                    pid
                }
                WaitStatus::Signaled(pid, signal, core_dumped) => {
                    warn!(pid = %pid, signal = ?signal, core_dumped, "Worker process killed");
                    pid
                }
                WaitStatus::StillAlive => return Ok(()),
                _ => continue,
            };

            let child = match self.children.remove(&pid) {
                Some(child) => child,
                None => continue,
            };
            if self.stopping {
                continue;
            }
            if child.started.elapsed() < MIN_CHILD_LIFETIME {
                warn!(slot = child.slot, "Worker died right after start, delaying respawn");
                thread::sleep(RESPAWN_BACKOFF);
            }
            self.spawn(child.slot)?;
        }
    }

    fn terminate_children(&mut self) {
        for pid in self.children.keys() {
            if let Err(e) = kill(*pid, Signal::SIGTERM) {
                warn!(pid = %pid, error = %e, "Failed to signal worker");
            }
        }

        while !self.children.is_empty() {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    debug!(pid = %pid, code, "Worker process reaped");
                    self.children.remove(&pid);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    debug!(pid = %pid, signal = ?signal, "Worker process reaped");
                    self.children.remove(&pid);
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    warn!(error = %e, "Stopped waiting for workers");
                    break;
                }
            }
        }
    }
}

/// Run one worker in the current process until a stop signal arrives.
pub fn run_single(config: &Config) -> io::Result<()> {
    stop_signals().thread_block()?;
    set_process_title(&Role::Worker(0).title());
    run_worker(config)
}

/// Body of a worker process. Expects the stop signals to be blocked already.
fn run_worker(config: &Config) -> io::Result<()> {
    let policy = HeartbeatPolicy::new(config.heartbeat_wait(), config.heartbeat.kick_on_timeout);
    let worker = Worker::start(config, logic::dispatcher(), Box::new(policy))?;
    let stop = worker.stop_handle();

    let signals = stop_signals();
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || loop {
            match signals.wait() {
                Ok(signal) => {
                    info!(signal = ?signal, "Worker shutting down");
                    stop.stop();
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "Signal wait failed");
                    stop.stop();
                    break;
                }
            }
        })?;

    worker.run()
}

fn stop_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    set
}

fn master_signals() -> SigSet {
    let mut set = stop_signals();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGHUP);
    set
}

/// Name the calling thread, which for a single-threaded process is the process name.
fn set_process_title(title: &str) {
    let name = match CString::new(title) {
        Ok(name) => name,
        Err(_) => return,
    };
    // SAFETY: PR_SET_NAME copies at most 16 bytes from a valid NUL-terminated string.
    let rc = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        debug!(title, error = %io::Error::last_os_error(), "Failed to set process title");
    }
}
