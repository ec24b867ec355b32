use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;

use crate::FrameKind;

/// File the capture payload lands in inside a local capture directory.
pub const DATA_FILE_NAME: &str = "capture.bin";

enum Target {
    /// Connected analyzer socket. Every frame kind is written.
    Socket(UnixStream),
    /// Local capture directory. Only `Data` frames are persisted, control
    /// kinds have no meaning without an analyzer and are dropped.
    Directory {
        dir: PathBuf,
        data: Option<BufWriter<File>>,
    },
}

/// Framed emitter for a capture session.
///
/// Steady-state writes come from a single sender thread by protocol; the
/// internal mutex exists for the stop thread's ACK replies and for the
/// fault path, which are allowed to interleave whole frames.
pub struct FrameSink {
    target: Mutex<Target>,
}

impl FrameSink {
    pub fn remote(socket: UnixStream) -> FrameSink {
        FrameSink {
            target: Mutex::new(Target::Socket(socket)),
        }
    }

    pub fn local(dir: &Path) -> FrameSink {
        FrameSink {
            target: Mutex::new(Target::Directory {
                dir: dir.to_path_buf(),
                data: None,
            }),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(*self.target.lock().unwrap(), Target::Socket(_))
    }

    /// Create the data file inside the capture directory. Idempotent; fails
    /// with an invalid-target error when the sink writes to a socket.
    pub fn create_data_file(&self) -> Result<()> {
        let mut target = self.target.lock().unwrap();
        match &mut *target {
            Target::Socket(_) => bail!("invalid target: remote sink has no data file"),
            Target::Directory { data: Some(_), .. } => Ok(()),
            Target::Directory { dir, data } => {
                let path = dir.join(DATA_FILE_NAME);
                let file = File::create(&path)
                    .with_context(|| format!("failed to create data file {}", path.display()))?;
                debug!("created capture data file {}", path.display());
                *data = Some(BufWriter::new(file));
                Ok(())
            }
        }
    }

    /// Write one frame. `flush` forces the payload out immediately, used
    /// for control frames and the final drain.
    pub fn write_frame(&self, kind: FrameKind, payload: &[u8], flush: bool) -> Result<()> {
        let mut target = self.target.lock().unwrap();
        match &mut *target {
            Target::Socket(sock) => {
                sock.write_all(&kind.header(payload.len() as u32))?;
                sock.write_all(payload)?;
                if flush {
                    sock.flush()?;
                }
            }
            Target::Directory { data, .. } => {
                if kind != FrameKind::Data {
                    return Ok(());
                }
                let Some(file) = data else {
                    bail!("capture data file was not created");
                };
                file.write_all(&kind.header(payload.len() as u32))?;
                file.write_all(payload)?;
                if flush {
                    file.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Flush buffered output and, on a socket target, half-close the write
    /// side so the analyzer observes end-of-stream.
    pub fn shutdown(&self) -> Result<()> {
        let mut target = self.target.lock().unwrap();
        match &mut *target {
            Target::Socket(sock) => {
                sock.flush()?;
                sock.shutdown(Shutdown::Write)?;
            }
            Target::Directory { data, .. } => {
                if let Some(file) = data {
                    file.flush()?;
                }
            }
        }
        Ok(())
    }
}
