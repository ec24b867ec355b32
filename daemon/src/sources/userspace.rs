use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use log::debug;
use log::warn;
use opcap_protocol::FrameKind;
use opcap_protocol::FrameSink;

use crate::config::CounterConfig;
use crate::drivers::PolledDriver;
use crate::latch::Latch;
use crate::source::SessionNotifier;
use crate::source::Source;

struct Shared {
    notifier: SessionNotifier,
    drivers: Vec<Arc<dyn PolledDriver>>,
    interval: Duration,
    stop: Latch,
    done: AtomicBool,
    buffer: Mutex<Vec<u8>>,
}

/// Userspace polled counters: one thread walking every eligible polled
/// driver at the sample interval.
pub struct UserspaceSource {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl UserspaceSource {
    /// The source only exists when at least one driver has counters in
    /// the session's request.
    pub fn should_start(drivers: &[Arc<dyn PolledDriver>], counters: &[CounterConfig]) -> bool {
        drivers.iter().any(|driver| driver.wants(counters))
    }

    pub fn new(
        notifier: SessionNotifier,
        drivers: &[Arc<dyn PolledDriver>],
        counters: &[CounterConfig],
        interval: Duration,
    ) -> Arc<UserspaceSource> {
        let eligible = drivers
            .iter()
            .filter(|driver| driver.wants(counters))
            .cloned()
            .collect();
        Arc::new(UserspaceSource {
            shared: Arc::new(Shared {
                notifier,
                drivers: eligible,
                interval,
                stop: Latch::new(),
                done: AtomicBool::new(false),
                buffer: Mutex::new(Vec::new()),
            }),
            poller: Mutex::new(None),
        })
    }
}

impl Shared {
    fn poll_loop(&self) {
        while self.stop.wait_timeout(self.interval) {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;

            let mut samples = Vec::new();
            for driver in &self.drivers {
                match driver.sample() {
                    Ok(mut values) => samples.append(&mut values),
                    // a transient read failure skips the tick for that
                    // driver only
                    Err(e) => warn!("polled driver {} read failed: {}", driver.name(), e),
                }
            }
            if samples.is_empty() {
                continue;
            }

            let mut buffer = self.buffer.lock().unwrap();
            buffer.extend_from_slice(&timestamp.to_le_bytes());
            buffer.extend_from_slice(&(samples.len() as u32).to_le_bytes());
            for sample in samples {
                buffer.extend_from_slice(&sample.key.to_le_bytes());
                buffer.extend_from_slice(&sample.value.to_le_bytes());
            }
            drop(buffer);
            self.notifier.data_ready();
        }
        debug!("userspace source finished");
        self.done.store(true, Ordering::Release);
        self.notifier.data_ready();
    }
}

impl Source for UserspaceSource {
    fn prepare(&self) -> bool {
        for driver in &self.shared.drivers {
            if let Err(e) = driver.sample() {
                warn!("polled driver {} unavailable: {}", driver.name(), e);
                return false;
            }
        }
        true
    }

    fn start(&self) {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("opcapd-userspace".into())
            .spawn(move || shared.poll_loop())
            .expect("failed to spawn userspace poller");
        *self.poller.lock().unwrap() = Some(handle);
    }

    fn run(&self) {
        unreachable!("userspace source is never the primary");
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
        self.shared.stop.trip();
    }

    fn join(&self) {
        if let Some(handle) = self.poller.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::CounterSample;
    use crate::event::EndEvent;
    use crossbeam::channel::unbounded;

    struct FixedPolled;

    impl PolledDriver for FixedPolled {
        fn name(&self) -> &str {
            "fixed"
        }

        fn wants(&self, counters: &[CounterConfig]) -> bool {
            counters.iter().any(|c| c.name.starts_with("fixed."))
        }

        fn sample(&self) -> Result<Vec<CounterSample>> {
            Ok(vec![CounterSample { key: 0x400, value: 7 }])
        }
    }

    #[test]
    fn eligibility_follows_requested_counters() {
        let drivers: Vec<Arc<dyn PolledDriver>> = vec![Arc::new(FixedPolled)];
        assert!(UserspaceSource::should_start(
            &drivers,
            &[CounterConfig::named("fixed.thing")]
        ));
        assert!(!UserspaceSource::should_start(
            &drivers,
            &[CounterConfig::named("cpu.user")]
        ));
    }

    #[test]
    fn polls_and_drains() {
        let (tick_tx, tick_rx) = unbounded();
        let event = Arc::new(EndEvent::new().unwrap());
        let drivers: Vec<Arc<dyn PolledDriver>> = vec![Arc::new(FixedPolled)];
        let source = UserspaceSource::new(
            SessionNotifier::new(tick_tx, event),
            &drivers,
            &[CounterConfig::named("fixed.thing")],
            Duration::from_millis(5),
        );

        assert!(source.prepare());
        source.start();
        tick_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        source.interrupt();
        source.join();
        assert!(source.is_done());

        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::local(dir.path());
        sink.create_data_file().unwrap();
        source.write(&sink).unwrap();
        let raw = std::fs::read(dir.path().join(opcap_protocol::DATA_FILE_NAME)).unwrap();
        assert!(!raw.is_empty());
    }
}
