use anyhow::bail;
use anyhow::Result;

/// Size of the on-wire header shared by frames and control commands.
pub const CONTROL_HEADER_LEN: usize = 5;

/// Kind byte of a frame written by the capture child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Capture payload produced by a source.
    Data = 1,
    /// Zero-length reply to a PING command.
    Ack = 4,
    /// End-of-capture marker, last frame on a remote target.
    ApcEnd = 5,
    /// Fatal error text, written once on the fault path.
    Error = 0xff,
}

impl FrameKind {
    pub fn header(self, length: u32) -> [u8; CONTROL_HEADER_LEN] {
        let len = length.to_le_bytes();
        [self as u8, len[0], len[1], len[2], len[3]]
    }
}

/// Command opcodes the analyzer may send to a running session. Anything
/// else read from the socket is logged and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOp {
    ApcStop = 0x01,
    Ping = 0x03,
}

impl ControlOp {
    pub fn from_u8(v: u8) -> Option<ControlOp> {
        match v {
            0x01 => Some(ControlOp::ApcStop),
            0x03 => Some(ControlOp::Ping),
            _ => None,
        }
    }
}

/// Parsed 5-byte control header `(type: u8, length: u32 LE)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlHeader {
    pub op: u8,
    pub length: u32,
}

impl ControlHeader {
    pub fn parse(buf: &[u8; CONTROL_HEADER_LEN]) -> ControlHeader {
        ControlHeader {
            op: buf[0],
            length: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
        }
    }

    /// The two accepted commands carry no payload; a nonzero length on a
    /// known opcode is a malformed command.
    pub fn decode(&self) -> Result<ControlOp> {
        let Some(op) = ControlOp::from_u8(self.op) else {
            bail!("unknown command type {}", self.op);
        };
        if self.length != 0 {
            bail!("command {:?} with nonzero length {}", op, self.length);
        }
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        assert_eq!(FrameKind::Data.header(0x0102_0304), [1, 4, 3, 2, 1]);
        assert_eq!(FrameKind::Ack.header(0), [4, 0, 0, 0, 0]);
    }

    #[test]
    fn control_header_round_trip() {
        let hdr = ControlHeader::parse(&[0x01, 0, 0, 0, 0]);
        assert_eq!(hdr.decode().unwrap(), ControlOp::ApcStop);

        let hdr = ControlHeader::parse(&[0x03, 0, 0, 0, 0]);
        assert_eq!(hdr.decode().unwrap(), ControlOp::Ping);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        // unknown opcode
        assert!(ControlHeader::parse(&[0x7f, 0, 0, 0, 0]).decode().is_err());
        // known opcode, nonzero length
        assert!(ControlHeader::parse(&[0x01, 1, 0, 0, 0]).decode().is_err());
        // length decoded before rejection, little-endian
        let hdr = ControlHeader::parse(&[0x03, 0x10, 0x20, 0, 0]);
        assert_eq!(hdr.length, 0x2010);
        assert!(hdr.decode().is_err());
    }
}
