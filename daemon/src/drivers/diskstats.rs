use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::config::CounterConfig;
use crate::drivers::CounterSample;
use crate::drivers::PolledDriver;

const KEY_DISK_SECTORS_READ: u32 = 0x0200;
const KEY_DISK_SECTORS_WRITTEN: u32 = 0x0201;

/// Aggregate block I/O counters from /proc/diskstats. Partitions are
/// skipped so sectors are not counted twice.
pub struct DiskstatsDriver {
    path: PathBuf,
}

impl Default for DiskstatsDriver {
    fn default() -> Self {
        DiskstatsDriver::new()
    }
}

impl DiskstatsDriver {
    pub fn new() -> DiskstatsDriver {
        DiskstatsDriver {
            path: PathBuf::from("/proc/diskstats"),
        }
    }

    #[cfg(test)]
    fn with_path(path: PathBuf) -> DiskstatsDriver {
        DiskstatsDriver { path }
    }
}

impl PolledDriver for DiskstatsDriver {
    fn name(&self) -> &str {
        "diskstats"
    }

    fn wants(&self, counters: &[CounterConfig]) -> bool {
        counters.iter().any(|c| c.name.starts_with("disk."))
    }

    fn sample(&self) -> Result<Vec<CounterSample>> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let mut sectors_read = 0u64;
        let mut sectors_written = 0u64;
        for line in text.lines() {
            // major minor name reads _ sectors_read _ writes _ sectors_written ...
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let name = fields[2];
            if name.ends_with(|c: char| c.is_ascii_digit()) && !name.starts_with("nvme") {
                // partition of a scsi-style device
                continue;
            }
            if let (Ok(read), Ok(written)) = (fields[5].parse::<u64>(), fields[9].parse::<u64>()) {
                sectors_read += read;
                sectors_written += written;
            }
        }

        Ok(vec![
            CounterSample {
                key: KEY_DISK_SECTORS_READ,
                value: sectors_read,
            },
            CounterSample {
                key: KEY_DISK_SECTORS_WRITTEN,
                value: sectors_written,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_whole_devices_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diskstats");
        std::fs::write(
            &path,
            "8 0 sda 1000 0 8000 0 2000 0 16000 0 0 0 0\n\
             8 1 sda1 900 0 7000 0 1900 0 15000 0 0 0 0\n\
             8 16 sdb 10 0 80 0 20 0 160 0 0 0 0\n",
        )
        .unwrap();

        let driver = DiskstatsDriver::with_path(path);
        let samples = driver.sample().unwrap();
        assert_eq!(samples[0].value, 8080);
        assert_eq!(samples[1].value, 16160);
    }

    #[test]
    fn wants_only_disk_counters() {
        let driver = DiskstatsDriver::new();
        assert!(driver.wants(&[CounterConfig::named("disk.read")]));
        assert!(!driver.wants(&[CounterConfig::named("mem.free")]));
    }
}
