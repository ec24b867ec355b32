// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # opcapd: the opcap capture child
//!
//! One process, one profiling session. The orchestrator in [`child`] owns a
//! primary CPU counter source plus a set of auxiliary sources, drains them
//! through a single sender thread into a framed sink, and supervises the
//! shutdown protocol: analyzer stop commands, POSIX signals, capture
//! duration, watched-process exit, and launched-command exit.

pub mod child;
pub mod command;
pub mod config;
pub mod drivers;
pub mod event;
pub mod latch;
pub mod local_capture;
pub mod pidwatch;
pub mod source;
pub mod sources;
pub mod telemetry;
