// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The session orchestrator.
//!
//! One [`Child`] per process. `run()` owns the whole session lifecycle:
//! counter setup, source creation, the sender/stop/duration/pid-watcher
//! threads, the graceful drain, and the fault path. Shutdown requests from
//! every origin funnel through the end-session eventfd; the stop thread
//! turns the event into the actual teardown under the session mutex, so
//! every source installed afterwards is interrupted before use.

use std::collections::BTreeSet;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::bounded;
use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::error;
use log::info;
use log::warn;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use opcap_protocol::ControlHeader;
use opcap_protocol::ControlOp;
use opcap_protocol::FrameKind;
use opcap_protocol::FrameSink;
use opcap_protocol::CONTROL_HEADER_LEN;

use crate::command::Command;
use crate::config::CaptureConfig;
use crate::config::CaptureTarget;
use crate::config::CounterConfig;
use crate::drivers;
use crate::drivers::Drivers;
use crate::event;
use crate::event::EndEvent;
use crate::event::EXIT_FAULT;
use crate::event::EXIT_SECOND_FAULT;
use crate::latch::Latch;
use crate::local_capture;
use crate::pidwatch;
use crate::pidwatch::WaitForProcessPoller;
use crate::source::SessionNotifier;
use crate::source::Source;
use crate::sources::ExternalTraceSource;
use crate::sources::GpuSource;
use crate::sources::TelemetrySource;
use crate::sources::UserspaceSource;

/// Bounded wait on the producer rendezvous, so a lost post cannot hang the
/// sender.
const SENDER_WAIT: Duration = Duration::from_secs(1);

/// Watched-pid rescan period.
const PID_POLL: Duration = Duration::from_secs(1);

/// Sources and lifecycle flags guarded by the session mutex. Once `ended`
/// turns true it never reverts, and every source present at that moment
/// has been interrupted.
#[derive(Default)]
struct SessionState {
    ended: bool,
    primary: Option<Arc<dyn Source>>,
    others: Vec<Arc<dyn Source>>,
    command: Option<Arc<Command>>,
}

/// The capture child for one profiling session.
pub struct Child {
    config: CaptureConfig,
    drivers: Drivers,
    /// Stop-thread read half of the analyzer socket.
    socket: Option<UnixStream>,
    sink: Arc<FrameSink>,
    end_event: Arc<EndEvent>,
    state: Mutex<SessionState>,
    tick_tx: Sender<()>,
    tick_rx: Receiver<()>,
    /// Pipeline halt gate: two tokens in normal mode, none in one-shot.
    halt_tx: Sender<()>,
    halt_rx: Receiver<()>,
    fault_count: AtomicU32,
    /// Whether the analyzer is mid-command and must be answered before the
    /// socket may close on the fault path.
    analyzer_waiting: AtomicBool,
}

impl Child {
    /// Construct the session. Claims the process-wide session slot and
    /// installs the signal handlers; a second live `Child` is refused.
    pub fn new(config: CaptureConfig, drivers: Drivers) -> Result<Child> {
        let end_event = Arc::new(EndEvent::new()?);
        event::claim_session_slot(end_event.fd())?;
        event::record_signal(0);
        event::install_signal_handlers()?;

        let (socket, sink) = match &config.target {
            CaptureTarget::Remote(stream) => (
                Some(stream.try_clone().context("failed to clone analyzer socket")?),
                Arc::new(FrameSink::remote(
                    stream.try_clone().context("failed to clone analyzer socket")?,
                )),
            ),
            CaptureTarget::Local(dir) => (None, Arc::new(FrameSink::local(dir))),
        };

        let (tick_tx, tick_rx) = unbounded();
        let (halt_tx, halt_rx) = bounded(2);

        Ok(Child {
            config,
            drivers,
            socket,
            sink,
            end_event,
            state: Mutex::new(SessionState::default()),
            tick_tx,
            tick_rx,
            halt_tx,
            halt_rx,
            fault_count: AtomicU32::new(0),
            analyzer_waiting: AtomicBool::new(false),
        })
    }

    fn notifier(&self) -> SessionNotifier {
        SessionNotifier::new(self.tick_tx.clone(), self.end_event.clone())
    }

    fn session_ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    /// Request a graceful end of the session from any thread.
    pub fn end_session(&self) {
        if !self.end_event.signal() {
            error!("end-session event write failed");
            self.handle_fatal("end-session event write failed");
        }
    }

    /// Drive the session from setup to teardown. Blocks for the whole
    /// capture.
    pub fn run(&self) -> Result<()> {
        // resolve the counter set; explicit requests beat the defaults
        let counters = drivers::merge_counters(
            &self.config.counters,
            self.drivers.cpu.default_counters(),
        );
        self.warn_unclaimed(&counters);
        let captured_spes = drivers::resolve_spes(&self.drivers, &self.config.spes);

        match &self.config.target {
            CaptureTarget::Local(dir) => {
                if let Err(e) = local_capture::create_capture_directory(dir) {
                    self.fatal(&format!("{:#}", e));
                }
                local_capture::copy_images(dir, &self.config.images);
                if let Err(e) = self.sink.create_data_file() {
                    self.fatal(&format!("{:#}", e));
                }
                if let Err(e) = local_capture::write_event_catalog(dir, &counters) {
                    self.fatal(&format!("{:#}", e));
                }
            }
            CaptureTarget::Remote(_) => {
                // the analyzer handshake already happened in the parent;
                // from here on it is in its command loop, so a fault must
                // drain its next command before the socket may close
                self.analyzer_waiting.store(true, Ordering::Release);
            }
        }

        // launch the target program paused; capture starts before it runs
        let mut app_pids: BTreeSet<i32> = BTreeSet::new();
        if let Some(argv) = &self.config.command {
            info!("running command:{}", argv.iter().fold(String::new(), |mut s, a| {
                s.push(' ');
                s.push_str(a);
                s
            }));
            let end_event = self.end_event.clone();
            let stop_on_exit = self.config.stop_on_exit;
            let command = match Command::spawn(argv, move || {
                if stop_on_exit {
                    info!("ending session because command exited");
                    if !end_event.signal() {
                        error!("end-session event write failed");
                    }
                }
            }) {
                Ok(command) => command,
                Err(e) => self.fatal(&format!("{:#}", e)),
            };
            info!("profiling pid: {}", command.pid());
            app_pids.insert(command.pid());
            // no threads are running yet, but the stop path expects the
            // command behind the session mutex
            self.state.lock().unwrap().command = Some(command);
        }

        thread::scope(|scope| {
            // the stop thread comes up early so pings are answered even
            // during a slow setup tail
            let stop_thread = thread::Builder::new()
                .name("opcapd-stop".into())
                .spawn_scoped(scope, || self.stop_thread())
                .unwrap_or_else(|e| self.fatal(&format!("failed to spawn stop thread: {}", e)));

            if let Some(name) = &self.config.wait_for_process {
                info!("waiting for pids of process '{}'", name);
                let poller = WaitForProcessPoller::new(name);
                while !poller.poll(Path::new("/proc"), &mut app_pids) && !self.session_ended() {
                    thread::sleep(Duration::from_millis(10));
                }
                debug!("got pids for process '{}'", name);
            }

            // --pid only feeds stop-on-exit when no program was launched
            let watch_pids = if app_pids.is_empty() {
                self.config.pids.clone()
            } else {
                app_pids
            };

            let start_latch = Arc::new(Latch::new());
            let end_latch = Arc::new(Latch::new());

            let mut should_continue = false;
            if !self.session_ended() {
                let started = {
                    let start_latch = start_latch.clone();
                    let command = self.state.lock().unwrap().command.clone();
                    Box::new(move || {
                        start_latch.trip();
                        if let Some(command) = command {
                            command.start();
                        }
                    })
                };
                let primary = match self.drivers.primary.create_primary_source(
                    self.notifier(),
                    &counters,
                    self.config.sample_interval,
                    started,
                ) {
                    Some(primary) => primary,
                    None => self.fatal("failed to init primary capture source"),
                };

                let mut state = self.state.lock().unwrap();
                state.primary = Some(primary);
                should_continue = !state.ended;
            }

            if should_continue {
                // external trace first: it is slow to come up and nothing
                // depends on it
                let external =
                    match ExternalTraceSource::new(self.notifier(), self.config.trace_pipe.clone())
                    {
                        Ok(external) => external,
                        Err(e) => self.fatal(&format!("{:#}", e)),
                    };
                if !self.prepare_and_start(external) {
                    self.fatal("unable to prepare external trace source for capture");
                }

                let primary = self.state.lock().unwrap().primary.clone().unwrap();
                if !primary.prepare() {
                    self.fatal("failed to prepare primary capture source");
                }

                if let Some(gpu) = &self.drivers.gpu {
                    if gpu.counters_enabled(&counters) {
                        let source = GpuSource::new(
                            self.notifier(),
                            gpu.clone(),
                            self.config.sample_interval,
                        );
                        if !self.prepare_and_start(source) {
                            self.fatal("unable to prepare GPU counter source for capture");
                        }
                    }
                }

                // the sender parks on the halt gate until one-shot end
                if !self.config.one_shot {
                    let _ = self.halt_tx.try_send(());
                    let _ = self.halt_tx.try_send(());
                }

                let duration_thread = self.config.duration.map(|duration| {
                    let start_latch = start_latch.clone();
                    let end_latch = end_latch.clone();
                    thread::Builder::new()
                        .name("opcapd-duration".into())
                        .spawn_scoped(scope, move || {
                            self.duration_thread(duration, &start_latch, &end_latch)
                        })
                        .unwrap_or_else(|e| {
                            self.fatal(&format!("failed to spawn duration thread: {}", e))
                        })
                });

                let watch_thread = if self.config.stop_on_exit && !watch_pids.is_empty() {
                    let end_latch = end_latch.clone();
                    Some(
                        thread::Builder::new()
                            .name("opcapd-pidwatcher".into())
                            .spawn_scoped(scope, move || {
                                self.watch_pids_thread(watch_pids, &end_latch)
                            })
                            .unwrap_or_else(|e| {
                                self.fatal(&format!("failed to spawn pid watcher: {}", e))
                            }),
                    )
                } else {
                    None
                };

                if UserspaceSource::should_start(&self.drivers.polled, &counters) {
                    let source = UserspaceSource::new(
                        self.notifier(),
                        &self.drivers.polled,
                        &counters,
                        self.config.sample_interval,
                    );
                    if !self.prepare_and_start(source) {
                        self.fatal("unable to prepare userspace source for capture");
                    }
                }

                if let Some(device) = &self.drivers.telemetry {
                    let source = TelemetrySource::new(
                        self.notifier(),
                        device.connection.clone(),
                        device.global.clone(),
                    );
                    if !self.prepare_and_start(source) {
                        self.fatal("unable to prepare telemetry source for capture");
                    }
                }

                // all sources exist; the sender may run
                let others = self.state.lock().unwrap().others.clone();
                let sender_thread = {
                    let primary = primary.clone();
                    let others = others.clone();
                    thread::Builder::new()
                        .name("opcapd-sender".into())
                        .spawn_scoped(scope, move || self.sender_thread(primary, others))
                        .unwrap_or_else(|e| {
                            self.fatal(&format!("failed to spawn sender thread: {}", e))
                        })
                };

                primary.run();
                debug!("primary source finished running");

                // wake all sleepers
                end_latch.trip();

                // later sources may depend on earlier ones; unwind in
                // reverse insertion order
                for source in others.iter().rev() {
                    source.join();
                }
                if let Some(handle) = watch_thread {
                    let _ = handle.join();
                }
                let _ = sender_thread.join();
                if let Some(handle) = duration_thread {
                    let _ = handle.join();
                }
            }

            let _ = stop_thread.join();
        });

        if let CaptureTarget::Local(dir) = &self.config.target {
            let duration_secs = self.config.duration.map(|d| d.as_secs()).unwrap_or(0);
            if let Err(e) = local_capture::write_captured_description(
                dir,
                self.config.command.as_deref(),
                duration_secs,
                self.config.one_shot,
                &captured_spes,
            ) {
                self.fatal(&format!("{:#}", e));
            }
            if let Err(e) = local_capture::write_counters_description(dir, &counters) {
                self.fatal(&format!("{:#}", e));
            }
        }

        info!("profiling ended");

        // ordered release: auxiliaries in reverse insertion order, then
        // the primary, then the sink
        let command = {
            let mut state = self.state.lock().unwrap();
            while state.others.pop().is_some() {}
            state.primary = None;
            state.command.clone()
        };
        let _ = self.sink.shutdown();

        if let Some(command) = command {
            debug!("waiting for command (pid {})", command.pid());
            command.join();
            debug!("command finished");
        }

        Ok(())
    }

    /// Ready an auxiliary source and register it. A source that starts
    /// after the session already ended is interrupted before anything can
    /// wait on it.
    fn prepare_and_start(&self, source: Arc<dyn Source>) -> bool {
        if !source.prepare() {
            return false;
        }
        source.start();
        let mut state = self.state.lock().unwrap();
        if state.ended {
            source.interrupt();
        }
        state.others.push(source);
        true
    }

    /// The one place the session actually ends: flag it, cancel the
    /// command, interrupt every source, release the halt gate.
    fn do_end_session(&self) {
        let mut state = self.state.lock().unwrap();
        state.ended = true;
        if let Some(command) = &state.command {
            command.cancel();
        }
        if let Some(primary) = &state.primary {
            primary.interrupt();
        }
        for source in &state.others {
            source.interrupt();
        }
        let _ = self.halt_tx.try_send(());
    }

    fn sender_thread(&self, primary: Arc<dyn Source>, others: Vec<Arc<dyn Source>>) {
        // one-shot sessions hold the sender here until end-of-session
        let _ = self.halt_rx.recv();

        let all_done =
            |primary: &Arc<dyn Source>, others: &[Arc<dyn Source>]| -> bool {
                others.iter().all(|s| s.is_done()) && primary.is_done()
            };

        while !all_done(&primary, &others) {
            match self.tick_rx.recv_timeout(SENDER_WAIT) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => debug!("timeout waiting for source data"),
                Err(RecvTimeoutError::Disconnected) => {
                    error!("producer rendezvous disconnected");
                    break;
                }
            }
            self.flush_sources(&primary, &others);
        }

        // one more pass to clear any slop buffered after the done checks
        self.flush_sources(&primary, &others);

        // end-of-capture marker, remote targets only
        if self.sink.is_remote() {
            if let Err(e) = self.sink.write_frame(FrameKind::ApcEnd, &[], true) {
                self.fatal(&format!("failed to write end-of-capture: {:#}", e));
            }
        }
        debug!("exit sender thread");
    }

    fn flush_sources(&self, primary: &Arc<dyn Source>, others: &[Arc<dyn Source>]) {
        for source in others {
            if let Err(e) = source.write(&self.sink) {
                self.fatal(&format!("sink write failed: {:#}", e));
            }
        }
        if let Err(e) = primary.write(&self.sink) {
            self.fatal(&format!("sink write failed: {:#}", e));
        }
    }

    /// Wait for either the end-session event or an analyzer command, then
    /// tear the session down.
    fn stop_thread(&self) {
        loop {
            let end_fd = unsafe { BorrowedFd::borrow_raw(self.end_event.fd()) };
            let mut fds = vec![PollFd::new(end_fd, PollFlags::POLLIN)];
            if let Some(socket) = &self.socket {
                let sock_fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
                fds.push(PollFd::new(sock_fd, PollFlags::POLLIN));
            }

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => self.fatal(&format!("poll failed in stop thread: {}", e)),
            }

            if fds[0].any().unwrap_or(false) {
                self.end_event.consume();
                let signum = event::signal_number();
                if signum != 0 {
                    info!(
                        "shutting down due to signal {}",
                        nix::sys::signal::Signal::try_from(signum)
                            .map(|s| s.as_str())
                            .unwrap_or("?")
                    );
                }
                break;
            }

            if !fds.get(1).map(|fd| fd.any().unwrap_or(false)).unwrap_or(false) {
                continue;
            }

            // stall here until the full command header arrives or the
            // analyzer goes away
            let mut header = [0u8; CONTROL_HEADER_LEN];
            let mut socket = self.socket.as_ref().unwrap();
            if let Err(e) = socket.read_exact(&mut header) {
                debug!("receive failed: {}", e);
                break;
            }

            match ControlHeader::parse(&header).decode() {
                Ok(ControlOp::ApcStop) => {
                    info!("stop command received");
                    break;
                }
                Ok(ControlOp::Ping) => {
                    debug!("ping command received");
                    if let Err(e) = self.sink.write_frame(FrameKind::Ack, &[], true) {
                        warn!("failed to ack ping: {}", e);
                    }
                }
                Err(e) => warn!("ignoring analyzer command: {}", e),
            }
        }

        // the analyzer's command has been consumed (or the analyzer is
        // gone); the fault path no longer needs to drain before closing
        self.analyzer_waiting.store(false, Ordering::Release);

        self.do_end_session();
        debug!("exit stop thread");
    }

    fn duration_thread(&self, duration: Duration, start: &Latch, end: &Latch) {
        start.wait();
        if end.wait_timeout(duration) {
            info!("capture duration expired");
            self.end_session();
        }
        debug!("exit duration thread");
    }

    fn watch_pids_thread(&self, mut pids: BTreeSet<i32>, end: &Latch) {
        while !pids.is_empty() {
            if !end.wait_timeout(PID_POLL) {
                debug!("exit watch pids thread by request");
                return;
            }
            for pid in pidwatch::prune_exited(&mut pids, Path::new("/proc")) {
                info!("watched pid {} exited", pid);
            }
        }
        info!("ending session because all watched processes have exited");
        self.end_session();
        debug!("exit watch pids thread");
    }

    fn warn_unclaimed(&self, counters: &[CounterConfig]) {
        for counter in counters {
            let single = std::slice::from_ref(counter);
            let claimed = self.drivers.cpu.claims(counter)
                || self.drivers.polled.iter().any(|d| d.wants(single))
                || self
                    .drivers
                    .gpu
                    .as_ref()
                    .map(|g| g.counters_enabled(single))
                    .unwrap_or(false);
            if !claimed {
                warn!("no driver claims counter '{}'", counter.name);
            }
        }
    }

    fn fatal(&self, message: &str) -> ! {
        error!("{}", message);
        self.handle_fatal(message)
    }

    /// Exactly-once fault cleanup, then `_exit`. Unwinding is off the
    /// table while worker threads are live.
    fn handle_fatal(&self, last_error: &str) -> ! {
        if self.fault_count.fetch_add(1, Ordering::AcqRel) > 0 {
            debug!("second fault during cleanup, terminating");
            unsafe { libc::_exit(EXIT_SECOND_FAULT) };
        }

        let command = self.state.lock().unwrap().command.clone();
        if let Some(command) = command {
            command.cancel();
        }

        if self.sink.is_remote() {
            // the analyzer learns why the capture died, whatever command
            // it was waiting on
            let _ = self
                .sink
                .write_frame(FrameKind::Error, last_error.as_bytes(), true);
            if self.analyzer_waiting.load(Ordering::Acquire) {
                if let Some(mut socket) = self.socket.as_ref() {
                    let mut discard = [0u8; 1];
                    let _ = socket.read_exact(&mut discard);
                }
            }
            let _ = self.sink.shutdown();
        }

        if let CaptureTarget::Local(dir) = &self.config.target {
            info!("cleaning incomplete capture directory");
            if let Err(e) = local_capture::remove_capture_directory(dir) {
                error!("could not remove incomplete capture directory: {}", e);
            }
        }

        unsafe { libc::_exit(EXIT_FAULT) };
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        event::release_session_slot(self.end_event.fd());
    }
}
