//! The capture sources.
//!
//! One primary source (CPU counters) drives the session from the
//! orchestrator's thread; the auxiliaries acquire from threads of their
//! own. All of them buffer locally and hand batches to the sender thread
//! through the shared tick channel.

mod cpu;
pub use cpu::CpuSource;

mod external;
pub use external::ExternalTraceSource;

mod gpu;
pub use gpu::GpuSource;

mod userspace;
pub use userspace::UserspaceSource;

mod telemetry;
pub use telemetry::TelemetrySource;
