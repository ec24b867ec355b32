//! /proc-based process observation.
//!
//! Polling /proc is deliberate: the daemon runs on targets whose kernels
//! predate pidfd, so directory scans are the portable way to notice that a
//! watched process has gone away or that a named process has appeared.

use std::collections::BTreeSet;
use std::path::Path;

use log::debug;

/// Every numeric entry under /proc, i.e. the live pids.
pub fn alive_pids(proc_root: &Path) -> BTreeSet<i32> {
    let mut pids = BTreeSet::new();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return pids;
    };
    for entry in entries.flatten() {
        if let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            pids.insert(pid);
        }
    }
    pids
}

/// Drop every pid from `pids` that is no longer alive. Returns the pids
/// removed by this tick.
pub fn prune_exited(pids: &mut BTreeSet<i32>, proc_root: &Path) -> Vec<i32> {
    let alive = alive_pids(proc_root);
    let gone: Vec<i32> = pids
        .iter()
        .copied()
        .filter(|pid| !alive.contains(pid))
        .collect();
    for pid in &gone {
        debug!("pid {} exited", pid);
        pids.remove(pid);
    }
    gone
}

/// Poller that resolves a process name to the set of pids running it.
pub struct WaitForProcessPoller {
    name: String,
}

impl WaitForProcessPoller {
    pub fn new(name: &str) -> WaitForProcessPoller {
        WaitForProcessPoller {
            name: name.to_string(),
        }
    }

    /// One scan. Inserts every matching pid into `out` and reports whether
    /// anything matched.
    pub fn poll(&self, proc_root: &Path, out: &mut BTreeSet<i32>) -> bool {
        let mut found = false;
        for pid in alive_pids(proc_root) {
            if self.matches(proc_root, pid) {
                out.insert(pid);
                found = true;
            }
        }
        found
    }

    fn matches(&self, proc_root: &Path, pid: i32) -> bool {
        let proc_dir = proc_root.join(pid.to_string());

        if let Ok(comm) = std::fs::read_to_string(proc_dir.join("comm")) {
            if comm.trim_end() == self.name {
                return true;
            }
        }

        // fall back to the executable path in cmdline, matched on basename
        if let Ok(cmdline) = std::fs::read(proc_dir.join("cmdline")) {
            if let Some(argv0) = cmdline.split(|b| *b == 0).next() {
                let argv0 = String::from_utf8_lossy(argv0);
                if Path::new(argv0.as_ref())
                    .file_name()
                    .map(|base| base == std::ffi::OsStr::new(&self.name))
                    .unwrap_or(false)
                {
                    return true;
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        let me = std::process::id() as i32;
        assert!(alive_pids(Path::new("/proc")).contains(&me));
    }

    #[test]
    fn prune_drops_only_dead_pids() {
        let me = std::process::id() as i32;
        // pid 0 never appears in /proc
        let mut pids: BTreeSet<i32> = [me, 0].into_iter().collect();
        let gone = prune_exited(&mut pids, Path::new("/proc"));
        assert_eq!(gone, vec![0]);
        assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![me]);
    }

    #[test]
    fn poller_finds_named_process() {
        // a fake /proc with one entry shaped like a real one
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("4242");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("comm"), "workload\n").unwrap();
        std::fs::write(dir.join("cmdline"), b"/usr/bin/workload\0--flag\0").unwrap();

        let mut out = BTreeSet::new();
        assert!(WaitForProcessPoller::new("workload").poll(root.path(), &mut out));
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![4242]);

        let mut out = BTreeSet::new();
        assert!(!WaitForProcessPoller::new("other").poll(root.path(), &mut out));
        assert!(out.is_empty());
    }
}
