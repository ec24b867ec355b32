//! Accelerator telemetry consumption.
//!
//! An attached neural-network accelerator streams self-describing counter
//! packets: a counter directory describing what the device can sample,
//! selection acknowledgements, and the counter captures themselves. The
//! [`SessionStateTracker`] reconciles that directory with the counters the
//! user requested and tells the device which event UIDs to sample.

mod ids;
pub use ids::CategoryRecord;
pub use ids::CounterClass;
pub use ids::CounterKeyAndCore;
pub use ids::CounterSetRecord;
pub use ids::DeviceRecord;
pub use ids::EventId;
pub use ids::EventProperties;
pub use ids::EventRecord;

mod tracker;
pub use tracker::SessionStateTracker;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::Result;

/// Global profiling state the tracker consults: which accelerator events
/// the user asked for and at what period, plus the sink for the events the
/// device turns out to offer.
pub trait GlobalState: Send + Sync {
    /// Requested event ids mapped to their stream counter keys.
    fn requested_counters(&self) -> BTreeMap<EventId, i32>;

    fn sample_period(&self) -> u32;

    /// Publish the full (id, properties) list of a freshly received
    /// counter directory.
    fn add_events(&self, events: Vec<(EventId, EventProperties)>);
}

/// Downstream consumer of translated counter data.
pub trait CounterConsumer: Send + Sync {
    /// A counter became part of the active selection.
    fn counter_selected(&self, key_core: CounterKeyAndCore) -> bool;

    fn periodic_value(&self, timestamp: u64, key_core: CounterKeyAndCore, value: u32) -> bool;

    fn per_job_value(
        &self,
        is_pre: bool,
        timestamp: u64,
        object_ref: u64,
        key_core: CounterKeyAndCore,
        value: u32,
    ) -> bool;
}

/// Commands the tracker sends back to the device.
pub trait SessionPacketSender: Send + Sync {
    fn send_periodic_selection(&self, period: u32, uids: &BTreeSet<u16>) -> bool;

    fn send_per_job_selection(&self, object_id: u64, uids: &BTreeSet<u16>) -> bool;
}

/// One decoded packet from the device link.
#[derive(Clone, Debug)]
pub enum TelemetryPacket {
    CounterDirectory {
        devices: BTreeMap<u16, DeviceRecord>,
        counter_sets: BTreeMap<u16, CounterSetRecord>,
        categories: Vec<CategoryRecord>,
    },
    PeriodicSelection {
        period: u32,
        uids: BTreeSet<u16>,
    },
    PerJobSelection {
        object_id: u64,
        uids: BTreeSet<u16>,
    },
    PeriodicCapture {
        timestamp: u64,
        values: BTreeMap<u16, u32>,
    },
    PerJobCapture {
        is_pre: bool,
        timestamp: u64,
        object_ref: u64,
        values: BTreeMap<u16, u32>,
    },
}

/// The device link itself. Decoding the accelerator's wire format happens
/// behind this trait; the capture child only sees packets.
pub trait TelemetryConnection: Send + Sync {
    /// Block for the next packet. `None` means the device closed the link.
    fn recv(&self) -> Result<Option<TelemetryPacket>>;

    /// Unblock a pending `recv`; every later `recv` returns `None`.
    fn interrupt(&self);

    fn send_periodic_selection(&self, period: u32, uids: &BTreeSet<u16>) -> bool;

    fn send_per_job_selection(&self, object_id: u64, uids: &BTreeSet<u16>) -> bool;
}

/// Session-owned [`GlobalState`]: the requested accelerator counters fixed
/// at configuration time plus the directory contents the device reported.
pub struct TelemetryRequests {
    requested: BTreeMap<EventId, i32>,
    sample_period: u32,
    available: Mutex<Vec<(EventId, EventProperties)>>,
}

impl TelemetryRequests {
    pub fn new(requested: BTreeMap<EventId, i32>, sample_period: u32) -> TelemetryRequests {
        TelemetryRequests {
            requested,
            sample_period,
            available: Mutex::new(Vec::new()),
        }
    }

    /// Events announced by the device since the session began.
    pub fn available_events(&self) -> Vec<(EventId, EventProperties)> {
        self.available.lock().unwrap().clone()
    }
}

impl GlobalState for TelemetryRequests {
    fn requested_counters(&self) -> BTreeMap<EventId, i32> {
        self.requested.clone()
    }

    fn sample_period(&self) -> u32 {
        self.sample_period
    }

    fn add_events(&self, events: Vec<(EventId, EventProperties)>) {
        *self.available.lock().unwrap() = events;
    }
}
