use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use log::debug;
use log::error;
use opcap_protocol::FrameKind;
use opcap_protocol::FrameSink;

use crate::config::CounterConfig;
use crate::latch::Latch;
use crate::source::SessionNotifier;
use crate::source::Source;

/// Stream keys of the aggregate CPU time counters.
const KEY_CPU_USER: u32 = 0x0000;
const KEY_CPU_SYSTEM: u32 = 0x0001;
const KEY_CPU_IDLE: u32 = 0x0002;
const KEY_CPU_IOWAIT: u32 = 0x0003;

/// Columns of the aggregate `cpu` row in /proc/stat.
const COLUMNS: [(&str, u32, usize); 4] = [
    ("cpu.user", KEY_CPU_USER, 0),
    ("cpu.system", KEY_CPU_SYSTEM, 2),
    ("cpu.idle", KEY_CPU_IDLE, 3),
    ("cpu.iowait", KEY_CPU_IOWAIT, 4),
];

/// The primary source: interval deltas of the kernel CPU time counters.
///
/// `run()` owns the orchestrator thread for the whole session and fires
/// the started callback once sampling begins, which is the point where a
/// paused target command is released.
pub struct CpuSource {
    notifier: SessionNotifier,
    on_started: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    interval: Duration,
    stat_path: PathBuf,
    /// (stream key, /proc/stat column) for each claimed counter.
    tracked: Vec<(u32, usize)>,
    stop: Latch,
    done: AtomicBool,
    buffer: Mutex<Vec<u8>>,
}

impl CpuSource {
    pub fn new(
        notifier: SessionNotifier,
        counters: &[CounterConfig],
        interval: Duration,
        on_started: Box<dyn FnOnce() + Send>,
    ) -> Arc<CpuSource> {
        let tracked = COLUMNS
            .iter()
            .filter(|(name, _, _)| counters.iter().any(|c| c.name == *name))
            .map(|(_, key, column)| (*key, *column))
            .collect();
        Arc::new(CpuSource {
            notifier,
            on_started: Mutex::new(Some(on_started)),
            interval,
            stat_path: PathBuf::from("/proc/stat"),
            tracked,
            stop: Latch::new(),
            done: AtomicBool::new(false),
            buffer: Mutex::new(Vec::new()),
        })
    }

    fn read_cpu_times(&self) -> Option<Vec<u64>> {
        let text = std::fs::read_to_string(&self.stat_path).ok()?;
        let line = text.lines().find(|l| l.starts_with("cpu "))?;
        Some(
            line.split_whitespace()
                .skip(1)
                .filter_map(|field| field.parse::<u64>().ok())
                .collect(),
        )
    }

    fn record_sample(&self, prev: &[u64], cur: &[u64]) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend_from_slice(&timestamp.to_le_bytes());
        buffer.extend_from_slice(&(self.tracked.len() as u32).to_le_bytes());
        for (key, column) in &self.tracked {
            let delta = match (cur.get(*column), prev.get(*column)) {
                (Some(c), Some(p)) => c.saturating_sub(*p),
                _ => 0,
            };
            buffer.extend_from_slice(&key.to_le_bytes());
            buffer.extend_from_slice(&delta.to_le_bytes());
        }
    }
}

impl Source for CpuSource {
    fn prepare(&self) -> bool {
        if self.tracked.is_empty() {
            error!("no CPU counters claimed, nothing to sample");
            return false;
        }
        if self.read_cpu_times().is_none() {
            error!("cannot read {}", self.stat_path.display());
            return false;
        }
        true
    }

    fn start(&self) {
        // the primary runs on the orchestrator thread; nothing to spawn
    }

    fn run(&self) {
        if let Some(started) = self.on_started.lock().unwrap().take() {
            started();
        }

        let Some(mut prev) = self.read_cpu_times() else {
            error!("lost access to {}", self.stat_path.display());
            self.done.store(true, Ordering::Release);
            self.notifier.end_session();
            return;
        };

        // wait_timeout returns false once interrupted
        while self.stop.wait_timeout(self.interval) {
            let Some(cur) = self.read_cpu_times() else {
                continue;
            };
            self.record_sample(&prev, &cur);
            prev = cur;
            self.notifier.data_ready();
        }

        debug!("primary source finished sampling");
        self.done.store(true, Ordering::Release);
        // wake the sender so it observes completion
        self.notifier.data_ready();
    }

    fn write(&self, sink: &FrameSink) -> Result<()> {
        let batch = std::mem::take(&mut *self.buffer.lock().unwrap());
        if batch.is_empty() {
            return Ok(());
        }
        sink.write_frame(FrameKind::Data, &batch, false)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn interrupt(&self) {
        self.stop.trip();
    }

    fn join(&self) {
        // no internal thread
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use crate::event::EndEvent;
    use std::thread;

    fn notifier() -> (SessionNotifier, crossbeam::channel::Receiver<()>) {
        let (tick_tx, tick_rx) = unbounded();
        let event = Arc::new(EndEvent::new().unwrap());
        (SessionNotifier::new(tick_tx, event), tick_rx)
    }

    #[test]
    fn samples_until_interrupted() {
        let (notifier, ticks) = notifier();
        let started = Arc::new(AtomicBool::new(false));
        let started_clone = started.clone();
        let source = CpuSource::new(
            notifier,
            &[CounterConfig::named("cpu.user"), CounterConfig::named("cpu.idle")],
            Duration::from_millis(10),
            Box::new(move || started_clone.store(true, Ordering::Release)),
        );

        assert!(source.prepare());
        source.start();

        let runner = {
            let source = source.clone();
            thread::spawn(move || source.run())
        };

        // at least one tick arrives while running
        ticks.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(started.load(Ordering::Acquire));
        assert!(!source.is_done());

        source.interrupt();
        runner.join().unwrap();
        assert!(source.is_done());

        // buffered samples survive the interrupt and drain through write
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::local(dir.path());
        sink.create_data_file().unwrap();
        source.write(&sink).unwrap();
    }

    #[test]
    fn prepare_requires_claimed_counters() {
        let (notifier, _ticks) = notifier();
        let source = CpuSource::new(
            notifier,
            &[CounterConfig::named("mem.free")],
            Duration::from_millis(10),
            Box::new(|| {}),
        );
        assert!(!source.prepare());
    }
}
