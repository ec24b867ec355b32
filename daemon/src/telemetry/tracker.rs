use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use log::debug;
use log::warn;

use crate::telemetry::CategoryRecord;
use crate::telemetry::CounterConsumer;
use crate::telemetry::CounterKeyAndCore;
use crate::telemetry::CounterSetRecord;
use crate::telemetry::DeviceRecord;
use crate::telemetry::EventId;
use crate::telemetry::GlobalState;
use crate::telemetry::SessionPacketSender;

/// Position of an event inside the current directory: category index and
/// the event's uid within that category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CategoryEvent {
    category: usize,
    uid: u16,
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<u16, DeviceRecord>,
    counter_sets: BTreeMap<u16, CounterSetRecord>,
    categories: Vec<CategoryRecord>,
    id_to_category_event: BTreeMap<EventId, CategoryEvent>,
    requested_uids: BTreeMap<u16, CounterKeyAndCore>,
    active_periodic: BTreeSet<u16>,
    active_per_job: BTreeSet<u16>,
    capture_active: bool,
}

/// Per-session accelerator state.
///
/// Consumes the device's telemetry packets, reconciles each counter
/// directory against the globally requested counters, and emits selection
/// commands so the device samples exactly what the session asked for.
pub struct SessionStateTracker {
    global: Arc<dyn GlobalState>,
    consumer: Arc<dyn CounterConsumer>,
    send_queue: Box<dyn SessionPacketSender>,
    inner: Mutex<Inner>,
}

impl SessionStateTracker {
    pub fn new(
        global: Arc<dyn GlobalState>,
        consumer: Arc<dyn CounterConsumer>,
        send_queue: Box<dyn SessionPacketSender>,
    ) -> SessionStateTracker {
        SessionStateTracker {
            global,
            consumer,
            send_queue,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Replace the available catalog with a freshly announced directory.
    /// Returns false on a protocol violation (duplicate event identity,
    /// dangling device or counter-set reference) or when a required
    /// re-selection could not be sent.
    pub fn on_counter_directory(
        &self,
        devices: BTreeMap<u16, DeviceRecord>,
        counter_sets: BTreeMap<u16, CounterSetRecord>,
        categories: Vec<CategoryRecord>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let mut id_map = BTreeMap::new();
        let mut published = Vec::new();
        for (index, category) in categories.iter().enumerate() {
            let device = match category.device_uid {
                Some(uid) => match devices.get(&uid) {
                    Some(record) => Some(record.name.clone()),
                    None => {
                        warn!("category {} references unknown device {}", category.name, uid);
                        return false;
                    }
                },
                None => None,
            };
            let counter_set = match category.counter_set_uid {
                Some(uid) => match counter_sets.get(&uid) {
                    Some(record) => Some(record.name.clone()),
                    None => {
                        warn!(
                            "category {} references unknown counter set {}",
                            category.name, uid
                        );
                        return false;
                    }
                },
                None => None,
            };

            let mut category_uids = std::collections::BTreeSet::new();
            for event in &category.events {
                if !category_uids.insert(event.uid) {
                    warn!(
                        "duplicate event uid {} in category {}",
                        event.uid, category.name
                    );
                    return false;
                }
                let id = EventId {
                    category: category.name.clone(),
                    device: device.clone(),
                    counter_set: counter_set.clone(),
                    name: event.name.clone(),
                };
                let slot = CategoryEvent {
                    category: index,
                    uid: event.uid,
                };
                if id_map.insert(id.clone(), slot).is_some() {
                    warn!("duplicate event {:?} in counter directory", id);
                    return false;
                }
                published.push((id, event.properties.clone()));
            }
        }

        self.global.add_events(published);

        inner.requested_uids = form_requested_uids(
            &self.global.requested_counters(),
            &id_map,
            &categories,
            &devices,
        );
        inner.devices = devices;
        inner.counter_sets = counter_sets;
        inner.categories = categories;
        inner.id_to_category_event = id_map;

        if inner.capture_active && !self.send_selection(&inner) {
            warn!("failed to re-emit selection after directory change");
            return false;
        }
        true
    }

    /// The device acknowledged a periodic selection.
    pub fn on_periodic_counter_selection(&self, period: u32, uids: BTreeSet<u16>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        debug!("device sampling {} events at period {}", uids.len(), period);
        inner.active_periodic = uids;
        self.emit_selected(&inner, &inner.active_periodic)
    }

    /// The device acknowledged a per-job selection.
    pub fn on_per_job_counter_selection(&self, object_id: u64, uids: BTreeSet<u16>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        debug!("device sampling {} events for object {:#x}", uids.len(), object_id);
        inner.active_per_job = uids;
        self.emit_selected(&inner, &inner.active_per_job)
    }

    pub fn on_periodic_counter_capture(
        &self,
        timestamp: u64,
        values: BTreeMap<u16, u32>,
    ) -> bool {
        let inner = self.inner.lock().unwrap();
        for (uid, value) in values {
            match inner.requested_uids.get(&uid) {
                Some(key_core) => {
                    if !self.consumer.periodic_value(timestamp, *key_core, value) {
                        return false;
                    }
                }
                None => debug!("dropping value for unrequested uid {}", uid),
            }
        }
        true
    }

    pub fn on_per_job_counter_capture(
        &self,
        is_pre: bool,
        timestamp: u64,
        object_ref: u64,
        values: BTreeMap<u16, u32>,
    ) -> bool {
        let inner = self.inner.lock().unwrap();
        for (uid, value) in values {
            match inner.requested_uids.get(&uid) {
                Some(key_core) => {
                    if !self
                        .consumer
                        .per_job_value(is_pre, timestamp, object_ref, *key_core, value)
                    {
                        return false;
                    }
                }
                None => debug!("dropping value for unrequested uid {}", uid),
            }
        }
        true
    }

    /// Start capturing: mark active and tell the device what to sample.
    /// The requested set is re-derived from the stored directory so an
    /// enable after a directory change selects the freshest intersection.
    /// A refused send aborts the enable.
    pub fn do_enable_capture(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.requested_uids = form_requested_uids(
            &self.global.requested_counters(),
            &inner.id_to_category_event,
            &inner.categories,
            &inner.devices,
        );
        inner.capture_active = true;
        if !self.send_selection(&inner) {
            inner.capture_active = false;
            warn!("selection send failed, capture not enabled");
            return false;
        }
        true
    }

    /// Stop capturing: the empty selection stops the device sampling.
    pub fn do_disable_capture(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.capture_active = false;
        if !self.send_selection(&inner) {
            warn!("selection send failed while disabling capture");
            return false;
        }
        true
    }

    /// Event uids the device currently samples.
    pub fn active_event_uids(&self) -> BTreeSet<u16> {
        let inner = self.inner.lock().unwrap();
        inner
            .active_periodic
            .union(&inner.active_per_job)
            .copied()
            .collect()
    }

    /// (devices, counter sets, categories) in the current directory.
    pub fn directory_counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        (
            inner.devices.len(),
            inner.counter_sets.len(),
            inner.categories.len(),
        )
    }

    fn send_selection(&self, inner: &MutexGuard<'_, Inner>) -> bool {
        let uids: BTreeSet<u16> = if inner.capture_active {
            inner.requested_uids.keys().copied().collect()
        } else {
            BTreeSet::new()
        };
        self.send_queue
            .send_periodic_selection(self.global.sample_period(), &uids)
    }

    /// Announce the newly selected counters downstream; uids the user did
    /// not request are silently dropped.
    fn emit_selected(&self, inner: &MutexGuard<'_, Inner>, uids: &BTreeSet<u16>) -> bool {
        for uid in uids {
            if let Some(key_core) = inner.requested_uids.get(uid) {
                if !self.consumer.counter_selected(*key_core) {
                    return false;
                }
            }
        }
        true
    }
}

/// Intersect the globally requested event ids with a directory's catalog,
/// producing the uid -> (key, core) translation used for every capture
/// packet.
///
/// Core resolution: a category bound to a device with a fixed core
/// reports on that core, anything else reports for all cores. When two
/// categories produce the same uid, the device-bound category wins; among
/// equals the lexicographically earlier `EventId` stands.
fn form_requested_uids(
    requested: &BTreeMap<EventId, i32>,
    catalog: &BTreeMap<EventId, CategoryEvent>,
    categories: &[CategoryRecord],
    devices: &BTreeMap<u16, DeviceRecord>,
) -> BTreeMap<u16, CounterKeyAndCore> {
    let mut chosen: BTreeMap<u16, (CounterKeyAndCore, bool)> = BTreeMap::new();

    // BTreeMap iteration is ascending EventId order, so the first entry
    // for a uid is already the lexicographically earliest.
    for (id, slot) in catalog {
        let Some(&key) = requested.get(id) else {
            continue;
        };
        let device = categories[slot.category]
            .device_uid
            .and_then(|uid| devices.get(&uid));
        let has_device = device.is_some();
        let core = device.and_then(|record| record.core);
        let candidate = (CounterKeyAndCore { key, core }, has_device);

        match chosen.get(&slot.uid) {
            None => {
                chosen.insert(slot.uid, candidate);
            }
            Some((_, existing_has_device)) => {
                if has_device && !existing_has_device {
                    chosen.insert(slot.uid, candidate);
                }
            }
        }
    }

    chosen
        .into_iter()
        .map(|(uid, (key_core, _))| (uid, key_core))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::EventProperties;
    use crate::telemetry::EventRecord;
    use std::sync::Mutex as StdMutex;

    struct FixedGlobal {
        requested: BTreeMap<EventId, i32>,
        published: StdMutex<Vec<(EventId, EventProperties)>>,
    }

    impl FixedGlobal {
        fn new(requested: &[(EventId, i32)]) -> Arc<FixedGlobal> {
            Arc::new(FixedGlobal {
                requested: requested.iter().cloned().collect(),
                published: StdMutex::new(Vec::new()),
            })
        }
    }

    impl GlobalState for FixedGlobal {
        fn requested_counters(&self) -> BTreeMap<EventId, i32> {
            self.requested.clone()
        }

        fn sample_period(&self) -> u32 {
            1000
        }

        fn add_events(&self, events: Vec<(EventId, EventProperties)>) {
            *self.published.lock().unwrap() = events;
        }
    }

    #[derive(Default)]
    struct RecordingConsumer {
        selected: StdMutex<Vec<CounterKeyAndCore>>,
        values: StdMutex<Vec<(u64, CounterKeyAndCore, u32)>>,
    }

    impl CounterConsumer for RecordingConsumer {
        fn counter_selected(&self, key_core: CounterKeyAndCore) -> bool {
            self.selected.lock().unwrap().push(key_core);
            true
        }

        fn periodic_value(&self, timestamp: u64, key_core: CounterKeyAndCore, value: u32) -> bool {
            self.values.lock().unwrap().push((timestamp, key_core, value));
            true
        }

        fn per_job_value(
            &self,
            _is_pre: bool,
            timestamp: u64,
            _object_ref: u64,
            key_core: CounterKeyAndCore,
            value: u32,
        ) -> bool {
            self.values.lock().unwrap().push((timestamp, key_core, value));
            true
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        selections: StdMutex<Vec<(u32, BTreeSet<u16>)>>,
        refuse: std::sync::atomic::AtomicBool,
    }

    impl SessionPacketSender for &'static RecordingSender {
        fn send_periodic_selection(&self, period: u32, uids: &BTreeSet<u16>) -> bool {
            if self.refuse.load(std::sync::atomic::Ordering::Relaxed) {
                return false;
            }
            self.selections.lock().unwrap().push((period, uids.clone()));
            true
        }

        fn send_per_job_selection(&self, _object_id: u64, _uids: &BTreeSet<u16>) -> bool {
            true
        }
    }

    fn category(name: &str, device_uid: Option<u16>, events: &[(u16, &str)]) -> CategoryRecord {
        CategoryRecord {
            name: name.to_string(),
            device_uid,
            counter_set_uid: None,
            events: events
                .iter()
                .map(|(uid, event_name)| EventRecord {
                    uid: *uid,
                    name: event_name.to_string(),
                    properties: EventProperties::default(),
                })
                .collect(),
        }
    }

    fn leak_sender() -> &'static RecordingSender {
        Box::leak(Box::new(RecordingSender::default()))
    }

    #[test]
    fn directory_replacement_narrows_requested_uids() {
        let ev1 = EventId::global("catA", "ev1");
        let ev2 = EventId::global("catA", "ev2");
        let global = FixedGlobal::new(&[(ev1, 101), (ev2, 102)]);
        let consumer = Arc::new(RecordingConsumer::default());
        let sender = leak_sender();
        let tracker = SessionStateTracker::new(global, consumer, Box::new(sender));

        let d1 = vec![category("catA", None, &[(1, "ev1"), (2, "ev2")])];
        assert!(tracker.on_counter_directory(BTreeMap::new(), BTreeMap::new(), d1));
        assert_eq!(tracker.directory_counts(), (0, 0, 1));
        assert!(tracker.do_enable_capture());
        assert_eq!(
            sender.selections.lock().unwrap().last().unwrap().1,
            [1u16, 2].into_iter().collect()
        );

        // the replacement directory only offers ev1
        let d2 = vec![category("catA", None, &[(1, "ev1")])];
        assert!(tracker.on_counter_directory(BTreeMap::new(), BTreeMap::new(), d2));
        let (period, uids) = sender.selections.lock().unwrap().last().unwrap().clone();
        assert_eq!(period, 1000);
        assert_eq!(uids, [1u16].into_iter().collect());
    }

    #[test]
    fn duplicate_event_identity_is_a_protocol_violation() {
        let global = FixedGlobal::new(&[]);
        let tracker = SessionStateTracker::new(
            global,
            Arc::new(RecordingConsumer::default()),
            Box::new(leak_sender()),
        );

        let dup = vec![category("catA", None, &[(1, "ev"), (2, "ev")])];
        assert!(!tracker.on_counter_directory(BTreeMap::new(), BTreeMap::new(), dup));

        // a uid reused within one category breaks the uid <-> id bijection
        let dup_uid = vec![category("catA", None, &[(1, "a"), (1, "b")])];
        assert!(!tracker.on_counter_directory(BTreeMap::new(), BTreeMap::new(), dup_uid));
    }

    #[test]
    fn dangling_device_reference_is_rejected() {
        let global = FixedGlobal::new(&[]);
        let tracker = SessionStateTracker::new(
            global,
            Arc::new(RecordingConsumer::default()),
            Box::new(leak_sender()),
        );

        let categories = vec![category("catA", Some(7), &[(1, "ev")])];
        assert!(!tracker.on_counter_directory(BTreeMap::new(), BTreeMap::new(), categories));
    }

    #[test]
    fn requested_uid_formation_is_idempotent_and_prefers_devices() {
        let bare = EventId::global("catA", "ev");
        let bound = EventId {
            category: "catB".into(),
            device: Some("npu0".into()),
            counter_set: None,
            name: "ev".into(),
        };
        let requested: BTreeMap<EventId, i32> =
            [(bare.clone(), 11), (bound.clone(), 22)].into_iter().collect();

        let devices: BTreeMap<u16, DeviceRecord> = [(
            1u16,
            DeviceRecord {
                name: "npu0".into(),
                core: Some(3),
            },
        )]
        .into_iter()
        .collect();
        let categories = vec![
            category("catA", None, &[(5, "ev")]),
            category("catB", Some(1), &[(5, "ev")]),
        ];
        let catalog: BTreeMap<EventId, CategoryEvent> = [
            (bare, CategoryEvent { category: 0, uid: 5 }),
            (bound, CategoryEvent { category: 1, uid: 5 }),
        ]
        .into_iter()
        .collect();

        let first = form_requested_uids(&requested, &catalog, &categories, &devices);
        let second = form_requested_uids(&requested, &catalog, &categories, &devices);
        assert_eq!(first, second);

        // the device-bound category wins the uid and carries its core
        assert_eq!(
            first.get(&5),
            Some(&CounterKeyAndCore {
                key: 22,
                core: Some(3)
            })
        );
    }

    #[test]
    fn captures_translate_known_uids_and_drop_the_rest() {
        let ev = EventId::global("catA", "ev");
        let global = FixedGlobal::new(&[(ev, 77)]);
        let consumer = Arc::new(RecordingConsumer::default());
        let tracker = SessionStateTracker::new(
            global,
            consumer.clone(),
            Box::new(leak_sender()),
        );

        let categories = vec![category("catA", None, &[(9, "ev")])];
        assert!(tracker.on_counter_directory(BTreeMap::new(), BTreeMap::new(), categories));

        let values: BTreeMap<u16, u32> = [(9u16, 400u32), (10, 500)].into_iter().collect();
        assert!(tracker.on_periodic_counter_capture(123, values));

        let seen = consumer.values.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 123);
        assert_eq!(seen[0].1.key, 77);
        assert_eq!(seen[0].2, 400);
    }

    #[test]
    fn selection_ack_announces_requested_counters_only() {
        let ev = EventId::global("catA", "ev");
        let global = FixedGlobal::new(&[(ev, 31)]);
        let consumer = Arc::new(RecordingConsumer::default());
        let tracker = SessionStateTracker::new(
            global,
            consumer.clone(),
            Box::new(leak_sender()),
        );

        let categories = vec![category("catA", None, &[(4, "ev"), (5, "other")])];
        assert!(tracker.on_counter_directory(BTreeMap::new(), BTreeMap::new(), categories));
        assert!(tracker.on_periodic_counter_selection(1000, [4u16, 5].into_iter().collect()));

        let selected = consumer.selected.lock().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].key, 31);
        assert_eq!(
            tracker.active_event_uids(),
            [4u16, 5].into_iter().collect()
        );
    }

    #[test]
    fn refused_selection_aborts_enable() {
        let ev = EventId::global("catA", "ev");
        let global = FixedGlobal::new(&[(ev, 1)]);
        let sender = leak_sender();
        let tracker = SessionStateTracker::new(
            global,
            Arc::new(RecordingConsumer::default()),
            Box::new(sender),
        );

        sender.refuse.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(!tracker.do_enable_capture());

        // the session continues; a later enable with a working queue works
        sender.refuse.store(false, std::sync::atomic::Ordering::Relaxed);
        assert!(tracker.do_enable_capture());
    }
}
