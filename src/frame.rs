use crate::{
    command::Command,
    error::{Result, SmuxError},
};
use bytes::Bytes;

pub const HEADER_SIZE: usize = 8;

/// Payload size of an UPD frame: `consumed:u32, window:u32`.
pub const UPD_SIZE: usize = 8;

/// Send window assumed for a v2 peer until its first UPD arrives.
pub const INITIAL_PEER_WINDOW: u32 = 262_144;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Command,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(version: u8, cmd: Command, stream_id: u32, data: Bytes) -> Self {
        Self {
            version,
            cmd,
            stream_id,
            data,
        }
    }

    pub fn new_syn(version: u8, stream_id: u32) -> Self {
        Self::new(version, Command::Syn, stream_id, Bytes::new())
    }

    pub fn new_fin(version: u8, stream_id: u32) -> Self {
        Self::new(version, Command::Fin, stream_id, Bytes::new())
    }

    pub fn new_psh(version: u8, stream_id: u32, data: Bytes) -> Self {
        Self::new(version, Command::Psh, stream_id, data)
    }

    pub fn new_nop(version: u8) -> Self {
        Self::new(version, Command::Nop, 0, Bytes::new())
    }

    pub fn new_upd(version: u8, stream_id: u32, consumed: u32, window: u32) -> Self {
        Self::new(
            version,
            Command::Upd { consumed, window },
            stream_id,
            Bytes::new(),
        )
    }

    /// Number of bytes following the header on the wire.
    pub fn payload_len(&self) -> usize {
        match self.cmd {
            Command::Upd { .. } => UPD_SIZE,
            _ => self.data.len(),
        }
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Checks a locally built frame before it is encoded. The UPD payload is
    /// fixed-size and not subject to `max_frame_size`.
    pub fn validate(&self, max_frame_size: usize) -> Result<()> {
        if self.cmd.requires_v2() && self.version < 2 {
            return Err(SmuxError::ProtocolViolation(
                "UPD command requires protocol version 2".to_string(),
            ));
        }

        if self.data.len() > max_frame_size {
            return Err(SmuxError::FrameTooLarge {
                size: self.data.len(),
                max: max_frame_size,
            });
        }

        if self.cmd.is_control() && !self.data.is_empty() {
            return Err(SmuxError::ProtocolViolation(
                "Control frames cannot carry data".to_string(),
            ));
        }

        match self.cmd {
            Command::Nop if self.stream_id != 0 => {
                Err(SmuxError::InvalidStreamId(self.stream_id))
            }
            _ => Ok(()),
        }
    }
}
