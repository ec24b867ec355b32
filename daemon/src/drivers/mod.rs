//! Counter drivers behind the capture sources.
//!
//! The driver layer answers three questions during setup: which counters
//! does the session sample when the user requested none, which driver
//! claims each requested counter, and which driver captures each SPE
//! configuration.

mod diskstats;
mod meminfo;

pub use diskstats::DiskstatsDriver;
pub use meminfo::MeminfoDriver;

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::warn;

use crate::config::CapturedSpe;
use crate::config::CounterConfig;
use crate::config::SpeConfig;
use crate::source::SessionNotifier;
use crate::source::Source;
use crate::sources::CpuSource;
use crate::telemetry::GlobalState;
use crate::telemetry::TelemetryConnection;

/// One sampled counter value, keyed the way it appears in the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterSample {
    pub key: u32,
    pub value: u64,
}

/// A driver whose counters are read by polling from userspace.
pub trait PolledDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Does any requested counter belong to this driver?
    fn wants(&self, counters: &[CounterConfig]) -> bool;

    fn sample(&self) -> Result<Vec<CounterSample>>;
}

/// GPU hardware counter access. Present only on targets with a supported
/// GPU; the orchestrator skips the GPU source otherwise.
pub trait GpuCounterDriver: Send + Sync {
    fn name(&self) -> &str;

    fn counters_enabled(&self, counters: &[CounterConfig]) -> bool;

    fn sample(&self) -> Result<Vec<CounterSample>>;
}

/// The CPU counter driver backing the primary source.
pub struct CpuDriver {
    next_spe_key: AtomicI32,
}

impl Default for CpuDriver {
    fn default() -> Self {
        CpuDriver::new()
    }
}

impl CpuDriver {
    pub fn new() -> CpuDriver {
        CpuDriver {
            next_spe_key: AtomicI32::new(1),
        }
    }

    /// Counters sampled when the session requests none.
    pub fn default_counters(&self) -> Vec<CounterConfig> {
        ["cpu.user", "cpu.system", "cpu.idle", "cpu.iowait"]
            .iter()
            .map(|name| CounterConfig::named(name))
            .collect()
    }

    pub fn claims(&self, counter: &CounterConfig) -> bool {
        counter.name.starts_with("cpu.")
    }

    /// Claim an SPE configuration. Only SPE ids are meaningful to the CPU
    /// driver; everything else is left for other drivers.
    pub fn claim_spe(&self, spe: &SpeConfig) -> Option<CapturedSpe> {
        if !spe.id.starts_with("spe") {
            return None;
        }
        Some(CapturedSpe {
            id: spe.id.clone(),
            key: self.next_spe_key.fetch_add(1, Ordering::Relaxed),
        })
    }
}

/// Builds the primary source for a session. The seam exists so the
/// orchestrator does not care which counter backend drives the capture.
pub trait PrimarySourceProvider: Send + Sync {
    fn create_primary_source(
        &self,
        notifier: SessionNotifier,
        counters: &[CounterConfig],
        interval: Duration,
        on_started: Box<dyn FnOnce() + Send>,
    ) -> Option<Arc<dyn Source>>;
}

/// Default provider: the /proc-backed CPU sampler.
pub struct CpuPrimaryProvider;

impl PrimarySourceProvider for CpuPrimaryProvider {
    fn create_primary_source(
        &self,
        notifier: SessionNotifier,
        counters: &[CounterConfig],
        interval: Duration,
        on_started: Box<dyn FnOnce() + Send>,
    ) -> Option<Arc<dyn Source>> {
        Some(CpuSource::new(notifier, counters, interval, on_started))
    }
}

/// An attached accelerator: the packet link plus the session's requested
/// event state.
pub struct TelemetryDevice {
    pub connection: Arc<dyn TelemetryConnection>,
    pub global: Arc<dyn GlobalState>,
}

/// Everything the orchestrator captures with, resolved before the session
/// starts.
pub struct Drivers {
    pub cpu: CpuDriver,
    pub primary: Box<dyn PrimarySourceProvider>,
    pub polled: Vec<Arc<dyn PolledDriver>>,
    pub gpu: Option<Arc<dyn GpuCounterDriver>>,
    pub telemetry: Option<TelemetryDevice>,
}

impl Drivers {
    /// The standard on-target set: CPU plus the /proc-polled drivers. GPU
    /// and accelerator telemetry attach only when the platform provides
    /// them.
    pub fn detect() -> Drivers {
        Drivers {
            cpu: CpuDriver::new(),
            primary: Box::new(CpuPrimaryProvider),
            polled: vec![
                Arc::new(MeminfoDriver::new()),
                Arc::new(DiskstatsDriver::new()),
            ],
            gpu: None,
            telemetry: None,
        }
    }
}

/// Requested counters win outright; the defaults only apply to a session
/// that requested nothing.
pub fn merge_counters(
    requested: &[CounterConfig],
    defaults: Vec<CounterConfig>,
) -> Vec<CounterConfig> {
    if requested.is_empty() {
        defaults
    } else {
        requested.to_vec()
    }
}

/// Hand each SPE configuration to the drivers in order; first claim wins.
pub fn resolve_spes(drivers: &Drivers, spes: &[SpeConfig]) -> Vec<CapturedSpe> {
    let mut captured = Vec::new();
    for spe in spes {
        match drivers.cpu.claim_spe(spe) {
            Some(c) => captured.push(c),
            None => warn!("no driver claimed {}", spe.id),
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_counters_override_defaults() {
        let cpu = CpuDriver::new();
        let requested = vec![CounterConfig::named("cpu.user")];
        let merged = merge_counters(&requested, cpu.default_counters());
        assert_eq!(merged, requested);

        let merged = merge_counters(&[], cpu.default_counters());
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn spe_claims_assign_distinct_keys() {
        let drivers = Drivers::detect();
        let spes = vec![
            SpeConfig {
                id: "spe_v1".into(),
                min_latency: 0,
            },
            SpeConfig {
                id: "spe_v1_second".into(),
                min_latency: 50,
            },
            SpeConfig {
                id: "unknown".into(),
                min_latency: 0,
            },
        ];
        let captured = resolve_spes(&drivers, &spes);
        assert_eq!(captured.len(), 2);
        assert_ne!(captured[0].key, captured[1].key);
    }
}
