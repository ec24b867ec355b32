use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use nix::fcntl::OFlag;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::latch::Latch;

/// Grace between SIGTERM and SIGKILL when a launched program is cancelled.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// The profiled target program.
///
/// Forks once. The forked child parks on the start-gate pipe before
/// `execvp`, so the orchestrator can enable capture before the first
/// target instruction runs. `std::process::Command` cannot express this
/// pause: its `spawn` does not return while the child sits between fork
/// and exec, which would block the orchestrator before it ever reached
/// [`Command::start`]. A supervisor thread reaps the program and invokes
/// the session's on-exit callback.
pub struct Command {
    pid: Pid,
    release: Mutex<Option<OwnedFd>>,
    exited: Arc<Latch>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl Command {
    /// Fork the target paused. Failure to fork is fatal to the session,
    /// the caller decides how.
    pub fn spawn(
        argv: &[String],
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Command>> {
        if argv.is_empty() {
            bail!("empty command");
        }

        // everything the forked child touches is prepared up front;
        // between fork and exec only async-signal-safe calls are allowed
        let args = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<Vec<CString>, _>>()
            .context("command argument contains a NUL byte")?;
        let mut arg_ptrs: Vec<*const libc::c_char> =
            args.iter().map(|arg| arg.as_ptr()).collect();
        arg_ptrs.push(std::ptr::null());

        let (gate_rx, gate_tx) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).context("start-gate pipe failed")?;
        let gate_rx_fd = gate_rx.as_raw_fd();
        let gate_tx_fd = gate_tx.as_raw_fd();

        let fork_pid = unsafe { libc::fork() };
        if fork_pid < 0 {
            bail!("fork failed: {}", std::io::Error::last_os_error());
        }

        if fork_pid == 0 {
            // forked child: wait for the go-ahead, then become the target
            unsafe {
                libc::close(gate_tx_fd);
                // the session's signal handlers make no sense here
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                libc::signal(libc::SIGTERM, libc::SIG_DFL);
                libc::signal(libc::SIGABRT, libc::SIG_DFL);

                let mut byte = 0u8;
                loop {
                    let n =
                        libc::read(gate_rx_fd, &mut byte as *mut u8 as *mut libc::c_void, 1);
                    if n == 1 {
                        break;
                    }
                    if n == 0 {
                        // gate closed without a go-ahead: session aborted
                        libc::_exit(1);
                    }
                    if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                        libc::_exit(1);
                    }
                }
                libc::close(gate_rx_fd);

                libc::execvp(args[0].as_ptr(), arg_ptrs.as_ptr());
                libc::_exit(127);
            }
        }

        drop(gate_rx);
        let pid = Pid::from_raw(fork_pid);

        let exited = Arc::new(Latch::new());
        let exited_clone = exited.clone();
        let supervisor = thread::Builder::new()
            .name("opcapd-command".into())
            .spawn(move || {
                loop {
                    match waitpid(pid, None) {
                        Err(nix::errno::Errno::EINTR) => continue,
                        Ok(WaitStatus::Exited(_, 0)) => {
                            info!("command (pid {}) exited cleanly", pid)
                        }
                        Ok(WaitStatus::Exited(_, code)) => {
                            warn!("command (pid {}) exited with status {}", pid, code)
                        }
                        Ok(WaitStatus::Signaled(_, signal, _)) => {
                            warn!("command (pid {}) killed by {}", pid, signal)
                        }
                        Ok(status) => {
                            warn!("unexpected wait status for command (pid {}): {:?}", pid, status)
                        }
                        Err(e) => warn!("wait on command (pid {}) failed: {}", pid, e),
                    }
                    break;
                }
                exited_clone.trip();
                on_exit();
            })
            .context("failed to spawn command supervisor")?;

        Ok(Arc::new(Command {
            pid,
            release: Mutex::new(Some(gate_tx)),
            exited,
            supervisor: Mutex::new(Some(supervisor)),
            cancelled: AtomicBool::new(false),
        }))
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Release the start gate; the target program execs now.
    pub fn start(&self) {
        if let Some(gate) = self.release.lock().unwrap().take() {
            let one = [1u8; 1];
            let n = unsafe {
                libc::write(gate.as_raw_fd(), one.as_ptr() as *const libc::c_void, 1)
            };
            if n != 1 {
                warn!("failed to release command start gate");
            }
        }
    }

    /// Terminate the program: SIGTERM now, SIGKILL after the grace period.
    /// Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        // a never-started program is still parked on the gate; closing it
        // makes the forked child exit before exec
        drop(self.release.lock().unwrap().take());

        debug!("cancelling command (pid {})", self.pid);
        if let Err(e) = kill(self.pid, Signal::SIGTERM) {
            if e != nix::errno::Errno::ESRCH {
                warn!("SIGTERM to {} failed: {}", self.pid, e);
            }
            return;
        }

        let exited = self.exited.clone();
        let pid = self.pid;
        let _ = thread::Builder::new()
            .name("opcapd-command-kill".into())
            .spawn(move || {
                if exited.wait_timeout(KILL_GRACE) {
                    warn!("command (pid {}) ignored SIGTERM, killing", pid);
                    let _ = kill(pid, Signal::SIGKILL);
                }
            });
    }

    /// Block until the supervisor has reaped the program.
    pub fn join(&self) {
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn program_waits_for_start() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let cmd = Command::spawn(&["/bin/true".to_string()], move || {
            fired_clone.store(true, Ordering::Release);
        })
        .unwrap();

        // parked on the start gate, so not reaped yet
        thread::sleep(Duration::from_millis(100));
        assert!(!fired.load(Ordering::Acquire));

        cmd.start();
        cmd.join();
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn cancel_terminates_promptly() {
        let cmd = Command::spawn(&["/bin/sleep".to_string(), "30".to_string()], || {}).unwrap();
        cmd.start();
        thread::sleep(Duration::from_millis(50));

        let begin = Instant::now();
        cmd.cancel();
        cmd.cancel(); // idempotent
        cmd.join();
        assert!(begin.elapsed() < Duration::from_secs(5));
    }
}
