use std::sync::Arc;

use anyhow::Result;
use crossbeam::channel::Sender;
use log::warn;
use opcap_protocol::FrameSink;

use crate::event::EndEvent;

/// A capture data producer.
///
/// The orchestrator owns one *primary* source whose [`Source::run`] drives
/// the main thread, plus any number of *auxiliary* sources that acquire
/// from threads of their own started by [`Source::start`]. All sources
/// share one tick channel: after buffering a batch they post it through
/// their [`SessionNotifier`], and the sender thread drains every source
/// into the sink.
pub trait Source: Send + Sync {
    /// Get ready to produce. Side effects such as opening kernel file
    /// descriptors are allowed. Returns false when the source cannot run.
    fn prepare(&self) -> bool;

    /// Begin background acquisition. Non-blocking.
    fn start(&self);

    /// Block until the session is over or [`Source::interrupt`] is called.
    /// Invoked on the primary source only. A primary that finishes on its
    /// own must request session end through its notifier before returning,
    /// otherwise the stop thread never wakes.
    fn run(&self);

    /// Move all currently buffered data into the sink. Must not block on
    /// acquisition, only on the sink.
    fn write(&self, sink: &FrameSink) -> Result<()>;

    /// Monotonic: once true, stays true. The sender drains until every
    /// source is done. Data buffered between `interrupt` and the final
    /// done observation is still drained.
    fn is_done(&self) -> bool;

    /// Unblock acquisition-side waits. Idempotent, callable from any
    /// thread.
    fn interrupt(&self);

    /// Wait for the source's internal threads to finish.
    fn join(&self);
}

/// Back-reference handed to each source instead of the orchestrator
/// itself: post the producer rendezvous, or ask for session end.
#[derive(Clone)]
pub struct SessionNotifier {
    tick: Sender<()>,
    end_event: Arc<EndEvent>,
}

impl SessionNotifier {
    pub fn new(tick: Sender<()>, end_event: Arc<EndEvent>) -> SessionNotifier {
        SessionNotifier { tick, end_event }
    }

    /// A batch is buffered; wake the sender thread.
    pub fn data_ready(&self) {
        let _ = self.tick.send(());
    }

    /// Request a graceful end of the session.
    pub fn end_session(&self) {
        if !self.end_event.signal() {
            warn!("end-session event write failed");
        }
    }
}
