// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! End-session event and process signal plumbing.
//!
//! Shutdown requests reach the stop thread through one eventfd, no matter
//! where they originate: a POSIX signal handler, the duration thread, the
//! pid watcher, or the command supervisor. The handler path is restricted
//! to async-signal-safe operations, which on Linux means an atomic load, an
//! atomic store, and one 8-byte `write(2)`.

use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Result;

/// Exit code of the first fatal fault.
pub const EXIT_FAULT: i32 = 1;
/// Exit code when a second fault arrives during fault cleanup.
pub const EXIT_SECOND_FAULT: i32 = 2;
/// A signal handler fired with no live session registered.
pub const EXIT_NO_SINGLETON: i32 = 5;
/// The end-event write failed inside a signal handler.
pub const EXIT_SIGNAL_WRITE_FAILED: i32 = 6;

/// Raw fd of the live session's end event, -1 when no session exists.
/// Signal handlers receive no user data pointer, so this is the one piece
/// of process-global state the child keeps.
static SESSION_END_FD: AtomicI32 = AtomicI32::new(-1);

/// Signal that requested shutdown, 0 for non-signal shutdowns.
static SIGNAL_NUMBER: AtomicI32 = AtomicI32::new(0);

/// Edge-triggered one-shot shutdown event backed by an eventfd.
pub struct EndEvent {
    fd: OwnedFd,
}

impl EndEvent {
    pub fn new() -> Result<EndEvent> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            bail!("eventfd failed: {}", std::io::Error::last_os_error());
        }
        Ok(EndEvent {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Make the event readable. Async-signal-safe. Returns false when the
    /// write did not complete.
    pub fn signal(&self) -> bool {
        signal_fd(self.fd.as_raw_fd())
    }

    /// Clear the latch. The stop thread reads the event exactly once.
    pub fn consume(&self) {
        let mut value = 0u64;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }
}

fn signal_fd(fd: RawFd) -> bool {
    let value: u64 = 1;
    let written =
        unsafe { libc::write(fd, &value as *const u64 as *const libc::c_void, 8) };
    written == 8
}

/// Register `fd` as the live session's end event. Fails when another
/// session already holds the slot; only one session may exist per process.
pub fn claim_session_slot(fd: RawFd) -> Result<()> {
    if SESSION_END_FD
        .compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        bail!("two capture sessions active in one process");
    }
    Ok(())
}

/// Release the slot claimed by `claim_session_slot`.
pub fn release_session_slot(fd: RawFd) {
    let _ = SESSION_END_FD.compare_exchange(fd, -1, Ordering::AcqRel, Ordering::Acquire);
}

pub fn record_signal(signum: i32) {
    SIGNAL_NUMBER.store(signum, Ordering::Relaxed);
}

pub fn signal_number() -> i32 {
    SIGNAL_NUMBER.load(Ordering::Relaxed)
}

/// Handler for SIGINT/SIGTERM/SIGABRT. Only async-signal-safe calls: no
/// logging, no allocation, no locking.
extern "C" fn end_session_handler(signum: libc::c_int) {
    let fd = SESSION_END_FD.load(Ordering::Acquire);
    if fd < 0 {
        unsafe { libc::_exit(EXIT_NO_SINGLETON) };
    }
    SIGNAL_NUMBER.store(signum, Ordering::Relaxed);
    if !signal_fd(fd) {
        unsafe { libc::_exit(EXIT_SIGNAL_WRITE_FAILED) };
    }
}

/// Install the session signal handlers. SIGCHLD is reset to default so the
/// command supervisor can wait on the launched program outside any handler.
pub fn install_signal_handlers() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = end_session_handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        for signum in [libc::SIGINT, libc::SIGTERM, libc::SIGABRT] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                bail!(
                    "sigaction({}) failed: {}",
                    signum,
                    std::io::Error::last_os_error()
                );
            }
        }

        let mut default: libc::sigaction = std::mem::zeroed();
        default.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut default.sa_mask);
        if libc::sigaction(libc::SIGCHLD, &default, std::ptr::null_mut()) != 0 {
            bail!("sigaction(SIGCHLD) failed: {}", std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::PollFd;
    use nix::poll::PollFlags;
    use nix::poll::PollTimeout;
    use std::os::fd::BorrowedFd;

    #[test]
    fn signal_makes_event_readable_once() {
        let event = EndEvent::new().unwrap();
        assert!(event.signal());
        // a second post coalesces, still one readable edge
        assert!(event.signal());

        let borrowed = unsafe { BorrowedFd::borrow_raw(event.fd()) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let ready = nix::poll::poll(&mut fds, PollTimeout::from(100u16)).unwrap();
        assert_eq!(ready, 1);

        event.consume();
        let borrowed = unsafe { BorrowedFd::borrow_raw(event.fd()) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let ready = nix::poll::poll(&mut fds, PollTimeout::from(10u16)).unwrap();
        assert_eq!(ready, 0);
    }

    #[test]
    fn session_slot_is_exclusive() {
        let first = EndEvent::new().unwrap();
        let second = EndEvent::new().unwrap();
        claim_session_slot(first.fd()).unwrap();
        assert!(claim_session_slot(second.fd()).is_err());
        release_session_slot(first.fd());
        claim_session_slot(second.fd()).unwrap();
        release_session_slot(second.fd());
    }
}
