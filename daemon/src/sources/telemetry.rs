use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Result;
use log::debug;
use log::warn;
use opcap_protocol::FrameKind;
use opcap_protocol::FrameSink;

use crate::source::SessionNotifier;
use crate::source::Source;
use crate::telemetry::CounterConsumer;
use crate::telemetry::CounterKeyAndCore;
use crate::telemetry::GlobalState;
use crate::telemetry::SessionPacketSender;
use crate::telemetry::SessionStateTracker;
use crate::telemetry::TelemetryConnection;
use crate::telemetry::TelemetryPacket;

/// Record tags inside a telemetry DATA frame.
const TAG_SELECTED: u8 = 0x01;
const TAG_PERIODIC: u8 = 0x02;
const TAG_PER_JOB: u8 = 0x03;

/// Wire encoding of "all cores".
const CORE_ANY: u32 = u32::MAX;

/// Translated counter records buffered for the sender thread.
struct FrameBuffer {
    notifier: SessionNotifier,
    buffer: Mutex<Vec<u8>>,
}

impl FrameBuffer {
    fn push(&self, record: &[u8]) {
        self.buffer.lock().unwrap().extend_from_slice(record);
        self.notifier.data_ready();
    }

    fn encode_key_core(record: &mut Vec<u8>, key_core: CounterKeyAndCore) {
        record.extend_from_slice(&key_core.key.to_le_bytes());
        record.extend_from_slice(&key_core.core.unwrap_or(CORE_ANY).to_le_bytes());
    }
}

impl CounterConsumer for FrameBuffer {
    fn counter_selected(&self, key_core: CounterKeyAndCore) -> bool {
        let mut record = vec![TAG_SELECTED];
        Self::encode_key_core(&mut record, key_core);
        self.push(&record);
        true
    }

    fn periodic_value(&self, timestamp: u64, key_core: CounterKeyAndCore, value: u32) -> bool {
        let mut record = vec![TAG_PERIODIC];
        record.extend_from_slice(&timestamp.to_le_bytes());
        Self::encode_key_core(&mut record, key_core);
        record.extend_from_slice(&value.to_le_bytes());
        self.push(&record);
        true
    }

    fn per_job_value(
        &self,
        is_pre: bool,
        timestamp: u64,
        object_ref: u64,
        key_core: CounterKeyAndCore,
        value: u32,
    ) -> bool {
        let mut record = vec![TAG_PER_JOB, is_pre as u8];
        record.extend_from_slice(&timestamp.to_le_bytes());
        record.extend_from_slice(&object_ref.to_le_bytes());
        Self::encode_key_core(&mut record, key_core);
        record.extend_from_slice(&value.to_le_bytes());
        self.push(&record);
        true
    }
}

/// Selection commands go straight back over the device link.
struct DeviceQueue {
    connection: Arc<dyn TelemetryConnection>,
}

impl SessionPacketSender for DeviceQueue {
    fn send_periodic_selection(&self, period: u32, uids: &std::collections::BTreeSet<u16>) -> bool {
        self.connection.send_periodic_selection(period, uids)
    }

    fn send_per_job_selection(&self, object_id: u64, uids: &std::collections::BTreeSet<u16>) -> bool {
        self.connection.send_per_job_selection(object_id, uids)
    }
}

struct Shared {
    tracker: SessionStateTracker,
    connection: Arc<dyn TelemetryConnection>,
    buffer: Arc<FrameBuffer>,
    interrupted: AtomicBool,
    done: AtomicBool,
    notifier: SessionNotifier,
}

/// Accelerator telemetry source: drives the session-state tracker from
/// the device packet stream.
pub struct TelemetrySource {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetrySource {
    pub fn new(
        notifier: SessionNotifier,
        connection: Arc<dyn TelemetryConnection>,
        global: Arc<dyn GlobalState>,
    ) -> Arc<TelemetrySource> {
        let buffer = Arc::new(FrameBuffer {
            notifier: notifier.clone(),
            buffer: Mutex::new(Vec::new()),
        });
        let tracker = SessionStateTracker::new(
            global,
            buffer.clone(),
            Box::new(DeviceQueue {
                connection: connection.clone(),
            }),
        );
        Arc::new(TelemetrySource {
            shared: Arc::new(Shared {
                tracker,
                connection,
                buffer,
                interrupted: AtomicBool::new(false),
                done: AtomicBool::new(false),
                notifier,
            }),
            reader: Mutex::new(None),
        })
    }
}

impl Shared {
    fn reader_loop(&self) {
        if !self.tracker.do_enable_capture() {
            // selection-failed is not fatal; the device may still offer a
            // directory after which enabling is retried
            warn!("initial telemetry selection failed");
        }

        loop {
            match self.connection.recv() {
                Ok(Some(packet)) => {
                    if !self.dispatch(packet) {
                        warn!("telemetry protocol violation, packet dropped");
                    }
                }
                Ok(None) => {
                    debug!("telemetry link closed");
                    break;
                }
                Err(e) => {
                    warn!("telemetry receive failed: {}", e);
                    break;
                }
            }
        }

        if self.interrupted.load(Ordering::Acquire) {
            self.tracker.do_disable_capture();
        }
        self.done.store(true, Ordering::Release);
        self.notifier.data_ready();
    }

    fn dispatch(&self, packet: TelemetryPacket) -> bool {
        match packet {
            TelemetryPacket::CounterDirectory {
                devices,
                counter_sets,
                categories,
            } => self.tracker.on_counter_directory(devices, counter_sets, categories),
            TelemetryPacket::PeriodicSelection { period, uids } => {
                self.tracker.on_periodic_counter_selection(period, uids)
            }
            TelemetryPacket::PerJobSelection { object_id, uids } => {
                self.tracker.on_per_job_counter_selection(object_id, uids)
            }
            TelemetryPacket::PeriodicCapture { timestamp, values } => {
                self.tracker.on_periodic_counter_capture(timestamp, values)
            }
            TelemetryPacket::PerJobCapture {
                is_pre,
                timestamp,
                object_ref,
                values,
            } => self
                .tracker
                .on_per_job_counter_capture(is_pre, timestamp, object_ref, values),
        }
    }
}

impl Source for TelemetrySource {
    fn prepare(&self) -> bool {
        // the link was established by the driver layer; nothing to probe
        true
    }

    fn start(&self) {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("opcapd-telemetry".into())
            .spawn(move || shared.reader_loop())
            .expect("failed to spawn telemetry reader");
        *self.reader.lock().unwrap() = Some(handle);
    }

    fn run(&self) {
        unreachable!("telemetry source is never the primary");
    }

    fn write(&self, sink: &FrameSink) -> Result<()> {
        let batch = std::mem::take(&mut *self.shared.buffer.buffer.lock().unwrap());
        if batch.is_empty() {
            return Ok(());
        }
        sink.write_frame(FrameKind::Data, &batch, false)
    }

    fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::Release);
        self.shared.connection.interrupt();
    }

    fn join(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EndEvent;
    use crate::telemetry::CategoryRecord;
    use crate::telemetry::EventId;
    use crate::telemetry::EventProperties;
    use crate::telemetry::EventRecord;
    use crate::telemetry::TelemetryRequests;
    use crossbeam::channel::unbounded;
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;
    use std::collections::VecDeque;
    use std::sync::Condvar;
    use std::time::Duration;

    /// Replays a fixed packet script, then blocks until interrupted.
    struct ScriptedConnection {
        script: Mutex<VecDeque<TelemetryPacket>>,
        closed: Mutex<bool>,
        cond: Condvar,
        selections: Mutex<Vec<(u32, BTreeSet<u16>)>>,
    }

    impl ScriptedConnection {
        fn new(script: Vec<TelemetryPacket>) -> Arc<ScriptedConnection> {
            Arc::new(ScriptedConnection {
                script: Mutex::new(script.into()),
                closed: Mutex::new(false),
                cond: Condvar::new(),
                selections: Mutex::new(Vec::new()),
            })
        }
    }

    impl TelemetryConnection for ScriptedConnection {
        fn recv(&self) -> Result<Option<TelemetryPacket>> {
            if let Some(packet) = self.script.lock().unwrap().pop_front() {
                return Ok(Some(packet));
            }
            let mut closed = self.closed.lock().unwrap();
            while !*closed {
                closed = self.cond.wait(closed).unwrap();
            }
            Ok(None)
        }

        fn interrupt(&self) {
            *self.closed.lock().unwrap() = true;
            self.cond.notify_all();
        }

        fn send_periodic_selection(&self, period: u32, uids: &BTreeSet<u16>) -> bool {
            self.selections.lock().unwrap().push((period, uids.clone()));
            true
        }

        fn send_per_job_selection(&self, _object_id: u64, _uids: &BTreeSet<u16>) -> bool {
            true
        }
    }

    #[test]
    fn directory_and_captures_flow_into_frames() {
        let ev = EventId::global("npu", "macs");
        let requested: BTreeMap<EventId, i32> = [(ev, 900)].into_iter().collect();
        let global = Arc::new(TelemetryRequests::new(requested, 1000));

        let directory = TelemetryPacket::CounterDirectory {
            devices: BTreeMap::new(),
            counter_sets: BTreeMap::new(),
            categories: vec![CategoryRecord {
                name: "npu".into(),
                device_uid: None,
                counter_set_uid: None,
                events: vec![EventRecord {
                    uid: 3,
                    name: "macs".into(),
                    properties: EventProperties::default(),
                }],
            }],
        };
        let capture = TelemetryPacket::PeriodicCapture {
            timestamp: 555,
            values: [(3u16, 1234u32)].into_iter().collect(),
        };
        let connection = ScriptedConnection::new(vec![directory, capture]);

        let (tick_tx, tick_rx) = unbounded();
        let event = Arc::new(EndEvent::new().unwrap());
        let source = TelemetrySource::new(
            SessionNotifier::new(tick_tx, event),
            connection.clone(),
            global,
        );

        assert!(source.prepare());
        source.start();

        // the translated capture shows up as buffered data
        tick_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        source.interrupt();
        source.join();
        assert!(source.is_done());

        // enable-time selection (empty: no directory yet), then the
        // re-selection after the directory (uid 3), then the disable
        let selections = connection.selections.lock().unwrap();
        assert!(selections.len() >= 3);
        assert_eq!(selections[1].1, [3u16].into_iter().collect());
        assert!(selections.last().unwrap().1.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::local(dir.path());
        sink.create_data_file().unwrap();
        source.write(&sink).unwrap();
        let raw = std::fs::read(dir.path().join(opcap_protocol::DATA_FILE_NAME)).unwrap();
        // frame header + at least the periodic record
        assert!(raw.len() > 5);
        assert_eq!(raw[5], TAG_PERIODIC);
    }
}
