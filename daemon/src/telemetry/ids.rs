/// Global identity of an accelerator event.
///
/// The derived ordering is the lexicographic tuple order; `Option`'s
/// ordering puts an absent device or counter set before any present one,
/// which is the tie-break the tracker relies on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventId {
    pub category: String,
    pub device: Option<String>,
    pub counter_set: Option<String>,
    pub name: String,
}

impl EventId {
    pub fn global(category: &str, name: &str) -> EventId {
        EventId {
            category: category.to_string(),
            device: None,
            counter_set: None,
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterClass {
    Absolute,
    Delta,
}

/// Descriptive attributes of an event, forwarded verbatim to the global
/// catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct EventProperties {
    pub class: CounterClass,
    pub multiplier: f64,
    pub description: String,
    pub units: String,
}

impl Default for EventProperties {
    fn default() -> Self {
        EventProperties {
            class: CounterClass::Delta,
            multiplier: 1.0,
            description: String::new(),
            units: String::new(),
        }
    }
}

/// A device advertised by the counter directory. A device may be bound to
/// one core; unbound devices report for all cores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub core: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterSetRecord {
    pub name: String,
    pub count: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub uid: u16,
    pub name: String,
    pub properties: EventProperties,
}

/// One directory category: a named group of events, optionally associated
/// with a device and a counter set.
#[derive(Clone, Debug, PartialEq)]
pub struct CategoryRecord {
    pub name: String,
    pub device_uid: Option<u16>,
    pub counter_set_uid: Option<u16>,
    pub events: Vec<EventRecord>,
}

/// Where a translated counter value lands in the capture stream: the APC
/// counter key and the core it is attributed to (`None` = all cores).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterKeyAndCore {
    pub key: i32,
    pub core: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_optionals_sort_first() {
        let bare = EventId::global("cat", "ev");
        let with_device = EventId {
            device: Some("npu0".into()),
            ..bare.clone()
        };
        let with_set = EventId {
            counter_set: Some("setA".into()),
            ..bare.clone()
        };
        assert!(bare < with_device);
        assert!(bare < with_set);
        // device compares before counter_set in the tuple
        assert!(with_set < with_device);
    }
}
