use crate::codec::{FrameHeader, FrameType, MAX_CONTROL_PAYLOAD};
use crate::error::{FrameError, Result};

/// Metadata of a single frame.
///
/// Sink frame channels keep their descriptor mutable only until the first
/// payload byte is handed to the transport; see
/// [`SinkFrameChannel::set_rsv`](crate::SinkFrameChannel::set_rsv).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    frame_type: FrameType,
    rsv: u8,
    final_fragment: bool,
    payload_size: Option<u64>,
}

impl FrameDescriptor {
    /// A final fragment with no RSV bits. `payload_size` of `None` means the
    /// size is not known up front.
    pub fn new(frame_type: FrameType, payload_size: Option<u64>) -> Self {
        Self {
            frame_type,
            rsv: 0,
            final_fragment: true,
            payload_size,
        }
    }

    pub(crate) fn from_header(header: &FrameHeader) -> Self {
        Self {
            frame_type: header.frame_type,
            rsv: header.rsv,
            final_fragment: header.fin,
            payload_size: Some(header.payload_len),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// RSV bits used by extensions. Default is 0.
    pub fn rsv(&self) -> u8 {
        self.rsv
    }

    pub fn is_final_fragment(&self) -> bool {
        self.final_fragment
    }

    pub fn payload_size(&self) -> Option<u64> {
        self.payload_size
    }

    /// Reject descriptors that can never be put on the wire.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.frame_type.is_control() {
            if let Some(size) = self.payload_size {
                if size > MAX_CONTROL_PAYLOAD as u64 {
                    return Err(FrameError::ControlFrameTooLarge { size });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn set_rsv(&mut self, rsv: u8) -> Result<()> {
        if rsv > 0x7 {
            return Err(FrameError::InvalidRsv(rsv));
        }
        self.rsv = rsv;
        Ok(())
    }

    pub(crate) fn set_final_fragment(&mut self, final_fragment: bool) -> Result<()> {
        if !final_fragment && self.frame_type.is_control() {
            return Err(FrameError::InvalidState(
                "control frames cannot be fragmented",
            ));
        }
        self.final_fragment = final_fragment;
        Ok(())
    }

    /// Header for this descriptor carrying `payload_len` bytes.
    pub(crate) fn header(&self, payload_len: u64, mask: Option<[u8; 4]>) -> FrameHeader {
        FrameHeader {
            fin: self.final_fragment,
            rsv: self.rsv,
            frame_type: self.frame_type,
            mask,
            payload_len,
        }
    }
}
