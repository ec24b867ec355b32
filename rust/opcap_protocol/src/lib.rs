// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Capture-stream protocol for opcap
//!
//! The opcap capture child multiplexes every data source into one framed
//! stream. A frame is `(kind: u8, length: u32 little-endian, payload)`. The
//! same layout carries the two control commands the analyzer may send to a
//! live session, so both directions share this crate.
//!
//! [`FrameSink`] is the single steady-state emitter: it writes frames either
//! to the connected analyzer socket or to the data file of a local capture
//! directory.

mod frame;
pub use frame::ControlHeader;
pub use frame::ControlOp;
pub use frame::FrameKind;
pub use frame::CONTROL_HEADER_LEN;

mod sink;
pub use sink::FrameSink;
pub use sink::DATA_FILE_NAME;
