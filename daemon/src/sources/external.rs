use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Result;
use log::debug;
use log::error;
use log::warn;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use opcap_protocol::FrameKind;
use opcap_protocol::FrameSink;

use crate::event::EndEvent;
use crate::source::SessionNotifier;
use crate::source::Source;

/// State shared between the source handle and its reader thread.
struct Shared {
    notifier: SessionNotifier,
    pipe: Mutex<Option<File>>,
    interrupt_event: EndEvent,
    done: AtomicBool,
    buffer: Mutex<Vec<u8>>,
}

/// Kernel trace forwarder.
///
/// Tails the configured trace pipe from its own thread, multiplexing the
/// pipe with an interrupt eventfd so `interrupt()` unblocks the read wait
/// immediately. A session without a trace pipe still constructs this
/// source; it simply parks until interrupted.
pub struct ExternalTraceSource {
    shared: Arc<Shared>,
    pipe_path: Option<PathBuf>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ExternalTraceSource {
    pub fn new(
        notifier: SessionNotifier,
        pipe_path: Option<PathBuf>,
    ) -> Result<Arc<ExternalTraceSource>> {
        Ok(Arc::new(ExternalTraceSource {
            shared: Arc::new(Shared {
                notifier,
                pipe: Mutex::new(None),
                interrupt_event: EndEvent::new()?,
                done: AtomicBool::new(false),
                buffer: Mutex::new(Vec::new()),
            }),
            pipe_path,
            reader: Mutex::new(None),
        }))
    }
}

impl Shared {
    fn reader_loop(&self) {
        let pipe = self.pipe.lock().unwrap().take();

        match pipe {
            None => {
                // idle source: park on the interrupt event alone
                let fd = unsafe { BorrowedFd::borrow_raw(self.interrupt_event.fd()) };
                let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                let _ = poll(&mut fds, PollTimeout::NONE);
            }
            Some(mut pipe) => self.tail_pipe(&mut pipe),
        }

        self.done.store(true, Ordering::Release);
        self.notifier.data_ready();
    }

    fn tail_pipe(&self, pipe: &mut File) {
        let mut chunk = [0u8; 4096];
        loop {
            let pipe_fd = unsafe { BorrowedFd::borrow_raw(pipe.as_raw_fd()) };
            let event_fd = unsafe { BorrowedFd::borrow_raw(self.interrupt_event.fd()) };
            let mut fds = [
                PollFd::new(event_fd, PollFlags::POLLIN),
                PollFd::new(pipe_fd, PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    error!("trace pipe poll failed: {}", e);
                    return;
                }
            }

            if fds[0].any().unwrap_or(false) {
                debug!("external trace source interrupted");
                return;
            }

            match pipe.read(&mut chunk) {
                Ok(0) => {
                    debug!("trace pipe closed");
                    return;
                }
                Ok(n) => {
                    self.buffer.lock().unwrap().extend_from_slice(&chunk[..n]);
                    self.notifier.data_ready();
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("trace pipe read failed: {}", e);
                    return;
                }
            }
        }
    }
}

impl Source for ExternalTraceSource {
    fn prepare(&self) -> bool {
        let Some(path) = &self.pipe_path else {
            return true;
        };
        match File::open(path) {
            Ok(file) => {
                *self.shared.pipe.lock().unwrap() = Some(file);
                true
            }
            Err(e) => {
                error!("cannot open trace pipe {}: {}", path.display(), e);
                false
            }
        }
    }

    fn start(&self) {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("opcapd-external".into())
            .spawn(move || shared.reader_loop())
            .expect("failed to spawn external trace reader");
        *self.reader.lock().unwrap() = Some(handle);
    }

    fn run(&self) {
        unreachable!("external trace source is never the primary");
    }

    fn write(&self, sink: &FrameSink) -> Result<()> {
        let batch = std::mem::take(&mut *self.shared.buffer.lock().unwrap());
        if batch.is_empty() {
            return Ok(());
        }
        sink.write_frame(FrameKind::Data, &batch, false)
    }

    fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    fn interrupt(&self) {
        self.shared.interrupt_event.signal();
    }

    fn join(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
