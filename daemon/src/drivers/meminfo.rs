use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::config::CounterConfig;
use crate::drivers::CounterSample;
use crate::drivers::PolledDriver;

/// Stream keys for the memory counters. The key space is partitioned per
/// driver so values from different drivers never collide.
const KEY_MEM_FREE: u32 = 0x0100;
const KEY_MEM_AVAILABLE: u32 = 0x0101;
const KEY_MEM_CACHED: u32 = 0x0102;

/// Memory occupancy counters read from /proc/meminfo.
pub struct MeminfoDriver {
    path: PathBuf,
}

impl Default for MeminfoDriver {
    fn default() -> Self {
        MeminfoDriver::new()
    }
}

impl MeminfoDriver {
    pub fn new() -> MeminfoDriver {
        MeminfoDriver {
            path: PathBuf::from("/proc/meminfo"),
        }
    }

    #[cfg(test)]
    fn with_path(path: PathBuf) -> MeminfoDriver {
        MeminfoDriver { path }
    }
}

impl PolledDriver for MeminfoDriver {
    fn name(&self) -> &str {
        "meminfo"
    }

    fn wants(&self, counters: &[CounterConfig]) -> bool {
        counters.iter().any(|c| c.name.starts_with("mem."))
    }

    fn sample(&self) -> Result<Vec<CounterSample>> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let mut samples = Vec::with_capacity(3);
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let Some(label) = fields.next() else { continue };
            let key = match label {
                "MemFree:" => KEY_MEM_FREE,
                "MemAvailable:" => KEY_MEM_AVAILABLE,
                "Cached:" => KEY_MEM_CACHED,
                _ => continue,
            };
            if let Some(value) = fields.next().and_then(|v| v.parse::<u64>().ok()) {
                // /proc/meminfo reports kB
                samples.push(CounterSample {
                    key,
                    value: value * 1024,
                });
            }
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_tracked_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meminfo");
        std::fs::write(
            &path,
            "MemTotal:       16307408 kB\n\
             MemFree:         1089008 kB\n\
             MemAvailable:    9134716 kB\n\
             Buffers:          312016 kB\n\
             Cached:          7570564 kB\n",
        )
        .unwrap();

        let driver = MeminfoDriver::with_path(path);
        let samples = driver.sample().unwrap();
        assert_eq!(
            samples,
            vec![
                CounterSample {
                    key: KEY_MEM_FREE,
                    value: 1089008 * 1024
                },
                CounterSample {
                    key: KEY_MEM_AVAILABLE,
                    value: 9134716 * 1024
                },
                CounterSample {
                    key: KEY_MEM_CACHED,
                    value: 7570564 * 1024
                },
            ]
        );
    }

    #[test]
    fn wants_only_memory_counters() {
        let driver = MeminfoDriver::new();
        assert!(driver.wants(&[CounterConfig::named("mem.free")]));
        assert!(!driver.wants(&[CounterConfig::named("cpu.user")]));
    }
}
