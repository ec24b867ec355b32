// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeSet;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;

use opcapd::child::Child;
use opcapd::config::CaptureConfig;
use opcapd::config::CaptureTarget;
use opcapd::config::CounterConfig;
use opcapd::config::SpeConfig;
use opcapd::drivers::Drivers;

/// opcapd: on-target profiling capture child
///
/// Orchestrates a single capture session: CPU counters, optional GPU and
/// accelerator telemetry, userspace polled counters and kernel trace are
/// multiplexed into one framed stream, written either to a connected
/// analyzer socket or into a local capture directory.
#[derive(Debug, Parser)]
struct Opts {
    /// Write the capture into this directory (local capture mode).
    #[clap(short, long, conflicts_with = "connect")]
    output: Option<PathBuf>,

    /// Connect to the analyzer on this unix socket instead of capturing
    /// locally.
    #[clap(short = 's', long)]
    connect: Option<PathBuf>,

    /// Counter to capture, `name` or `name:event`. Repeatable; the
    /// driver defaults apply when none are given.
    #[clap(short = 'C', long = "counter")]
    counters: Vec<String>,

    /// SPE configuration to capture, `id` or `id:min_latency`.
    #[clap(long = "spe")]
    spes: Vec<String>,

    /// Capture duration in seconds, 0 = until stopped.
    #[clap(short, long, default_value = "0")]
    duration: u64,

    /// Stop after the first buffer of capture data.
    #[clap(long)]
    one_shot: bool,

    /// End the session when the launched command or the watched pids
    /// exit.
    #[clap(short = 'x', long)]
    stop_on_exit: bool,

    /// Watch this pid; repeatable.
    #[clap(short, long = "pid")]
    pids: Vec<i32>,

    /// Wait for a process of this name before capturing.
    #[clap(long)]
    wait_process: Option<String>,

    /// Copy this image artifact into the capture directory; repeatable.
    #[clap(long = "image")]
    images: Vec<PathBuf>,

    /// Sample interval of the polled sources, in milliseconds.
    #[clap(long, default_value = "100")]
    sample_interval_ms: u64,

    /// Kernel trace pipe to forward into the capture.
    #[clap(long)]
    trace_pipe: Option<PathBuf>,

    /// Command to profile; everything after `--` is the target argv.
    #[clap(last = true)]
    command: Vec<String>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_counter(spec: &str) -> Result<CounterConfig> {
    match spec.split_once(':') {
        None => Ok(CounterConfig::named(spec)),
        Some((name, event)) => {
            let event = u64::from_str_radix(event.trim_start_matches("0x"), 16)
                .with_context(|| format!("bad event code in counter '{}'", spec))?;
            Ok(CounterConfig {
                name: name.to_string(),
                event: Some(event),
            })
        }
    }
}

fn parse_spe(spec: &str) -> Result<SpeConfig> {
    match spec.split_once(':') {
        None => Ok(SpeConfig {
            id: spec.to_string(),
            min_latency: 0,
        }),
        Some((id, latency)) => Ok(SpeConfig {
            id: id.to_string(),
            min_latency: latency
                .parse()
                .with_context(|| format!("bad min latency in spe '{}'", spec))?,
        }),
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let target = match (&opts.output, &opts.connect) {
        (Some(dir), None) => CaptureTarget::Local(dir.clone()),
        (None, Some(path)) => {
            let stream = UnixStream::connect(path)
                .with_context(|| format!("failed to connect to analyzer at {}", path.display()))?;
            CaptureTarget::Remote(stream)
        }
        (None, None) => bail!("either --output or --connect is required"),
        (Some(_), Some(_)) => unreachable!("clap rejects the combination"),
    };

    let mut config = CaptureConfig::new(target);
    config.counters = opts
        .counters
        .iter()
        .map(|spec| parse_counter(spec))
        .collect::<Result<_>>()?;
    config.spes = opts
        .spes
        .iter()
        .map(|spec| parse_spe(spec))
        .collect::<Result<_>>()?;
    if opts.duration > 0 {
        config.duration = Some(Duration::from_secs(opts.duration));
    }
    config.one_shot = opts.one_shot;
    config.stop_on_exit = opts.stop_on_exit;
    config.pids = opts.pids.iter().copied().collect::<BTreeSet<i32>>();
    config.wait_for_process = opts.wait_process.clone();
    config.images = opts.images.clone();
    config.sample_interval = Duration::from_millis(opts.sample_interval_ms.max(1));
    config.trace_pipe = opts.trace_pipe.clone();
    if !opts.command.is_empty() {
        config.command = Some(opts.command.clone());
    }

    let child = Child::new(config, Drivers::detect())?;
    info!("opcapd capture session ready");
    child.run()?;

    Ok(())
}
