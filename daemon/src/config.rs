use std::collections::BTreeSet;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

/// Where the ordered capture stream goes.
pub enum CaptureTarget {
    /// Connected analyzer socket handed over by the parent process.
    Remote(UnixStream),
    /// Local capture directory, produced when no analyzer is attached.
    Local(PathBuf),
}

/// One requested performance counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterConfig {
    pub name: String,
    /// Raw event code when the counter does not resolve by name alone.
    pub event: Option<u64>,
}

impl CounterConfig {
    pub fn named(name: &str) -> CounterConfig {
        CounterConfig {
            name: name.to_string(),
            event: None,
        }
    }
}

/// A requested statistical-profiling-extension configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpeConfig {
    pub id: String,
    pub min_latency: u32,
}

/// An SPE configuration a driver agreed to capture, with the key its
/// records carry in the stream.
#[derive(Clone, Debug)]
pub struct CapturedSpe {
    pub id: String,
    pub key: i32,
}

/// Immutable per-session configuration. Built once before the orchestrator
/// constructs; nothing here changes mid-session.
pub struct CaptureConfig {
    pub target: CaptureTarget,
    pub counters: Vec<CounterConfig>,
    pub spes: Vec<SpeConfig>,
    /// None = capture until stopped.
    pub duration: Option<Duration>,
    pub one_shot: bool,
    pub stop_on_exit: bool,
    /// Target program argv, launched paused at session start.
    pub command: Option<Vec<String>>,
    /// Explicitly watched pids.
    pub pids: BTreeSet<i32>,
    /// Wait for a process of this name to appear before capturing.
    pub wait_for_process: Option<String>,
    /// Artifacts copied into a local capture directory.
    pub images: Vec<PathBuf>,
    /// Poll interval of the sampled sources.
    pub sample_interval: Duration,
    /// Kernel trace pipe tailed by the external trace source.
    pub trace_pipe: Option<PathBuf>,
}

impl CaptureConfig {
    pub fn new(target: CaptureTarget) -> CaptureConfig {
        CaptureConfig {
            target,
            counters: Vec::new(),
            spes: Vec::new(),
            duration: None,
            one_shot: false,
            stop_on_exit: false,
            command: None,
            pids: BTreeSet::new(),
            wait_for_process: None,
            images: Vec::new(),
            sample_interval: Duration::from_millis(100),
            trace_pipe: None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, CaptureTarget::Local(_))
    }
}
