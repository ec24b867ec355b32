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
use log::error;
use log::warn;
use opcap_protocol::FrameKind;
use opcap_protocol::FrameSink;

use crate::drivers::GpuCounterDriver;
use crate::latch::Latch;
use crate::source::SessionNotifier;
use crate::source::Source;

/// Consecutive failed reads after which the GPU source gives up. The GPU
/// going away mid-session (driver unload, device sleep) ends this source,
/// not the session.
const MAX_READ_FAILURES: u32 = 5;

struct Shared {
    notifier: SessionNotifier,
    driver: Arc<dyn GpuCounterDriver>,
    interval: Duration,
    stop: Latch,
    done: AtomicBool,
    buffer: Mutex<Vec<u8>>,
}

/// GPU hardware counter poller.
pub struct GpuSource {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl GpuSource {
    pub fn new(
        notifier: SessionNotifier,
        driver: Arc<dyn GpuCounterDriver>,
        interval: Duration,
    ) -> Arc<GpuSource> {
        Arc::new(GpuSource {
            shared: Arc::new(Shared {
                notifier,
                driver,
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
        let mut failures = 0u32;
        while self.stop.wait_timeout(self.interval) {
            match self.driver.sample() {
                Ok(samples) => {
                    failures = 0;
                    if samples.is_empty() {
                        continue;
                    }
                    let timestamp = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_nanos() as u64;
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
                Err(e) => {
                    failures += 1;
                    warn!("GPU counter read failed ({}): {}", failures, e);
                    if failures >= MAX_READ_FAILURES {
                        error!("GPU counters unavailable, stopping GPU source");
                        break;
                    }
                }
            }
        }
        debug!("GPU source finished");
        self.done.store(true, Ordering::Release);
        self.notifier.data_ready();
    }
}

impl Source for GpuSource {
    fn prepare(&self) -> bool {
        match self.shared.driver.sample() {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "GPU driver {} refused first read: {}",
                    self.shared.driver.name(),
                    e
                );
                false
            }
        }
    }

    fn start(&self) {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("opcapd-gpu".into())
            .spawn(move || shared.poll_loop())
            .expect("failed to spawn GPU poller");
        *self.poller.lock().unwrap() = Some(handle);
    }

    fn run(&self) {
        unreachable!("GPU source is never the primary");
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

    struct FixedGpu;

    impl GpuCounterDriver for FixedGpu {
        fn name(&self) -> &str {
            "fixed"
        }

        fn counters_enabled(&self, _counters: &[crate::config::CounterConfig]) -> bool {
            true
        }

        fn sample(&self) -> Result<Vec<CounterSample>> {
            Ok(vec![CounterSample {
                key: 0x300,
                value: 42,
            }])
        }
    }

    #[test]
    fn polls_driver_until_interrupted() {
        let (tick_tx, tick_rx) = unbounded();
        let event = Arc::new(EndEvent::new().unwrap());
        let source = GpuSource::new(
            SessionNotifier::new(tick_tx, event),
            Arc::new(FixedGpu),
            Duration::from_millis(5),
        );

        assert!(source.prepare());
        source.start();
        tick_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        source.interrupt();
        source.join();
        assert!(source.is_done());
    }
}
