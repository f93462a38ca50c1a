//! Encode-and-forward strategies for outbound frames.
//!
//! A sink frame channel picks one variant when it is created:
//! - [`Encoder::Streaming`] for data frames whose size is declared up front:
//!   the header goes out on the first write and payload bytes are forwarded
//!   straight to the transport.
//! - [`Encoder::Buffered`] for control frames and data frames of unknown
//!   size: payload accumulates locally and the whole frame is emitted once
//!   the channel is closed.
//!
//! Every method here runs with the frame's state lock held and only after
//! the activation gate has let the caller through.

use std::fs::File;
use std::io::IoSlice;

use bytes::{Buf, BytesMut};
use framux_transport::{read_at, StreamSink, StreamSource};

use crate::codec::{
    apply_mask, encode_header, validate_close_payload, FrameType, MAX_CONTROL_PAYLOAD,
};
use crate::descriptor::FrameDescriptor;
use crate::error::{FrameError, Result};

pub(crate) enum Encoder {
    Streaming(StreamingEncoder),
    Buffered(BufferedEncoder),
}

pub(crate) struct StreamingEncoder {
    declared: u64,
    sent: u64,
    header_staged: bool,
    pending: BytesMut,
    mask: Option<[u8; 4]>,
    scratch: BytesMut,
    chunk: usize,
}

pub(crate) struct BufferedEncoder {
    payload: BytesMut,
    limit: u64,
    sealed: bool,
    pending: BytesMut,
    mask: Option<[u8; 4]>,
    chunk: usize,
}

/// Push `pending` into the transport. `Ok(true)` once it is empty.
fn drain(pending: &mut BytesMut, transport: &dyn StreamSink) -> Result<bool> {
    while !pending.is_empty() {
        let n = transport.write(&pending[..])?;
        if n == 0 {
            return Ok(false);
        }
        pending.advance(n);
    }
    Ok(true)
}

impl Encoder {
    /// Choose the variant for `descriptor`.
    pub(crate) fn for_descriptor(
        descriptor: &FrameDescriptor,
        mask: Option<[u8; 4]>,
        max_payload: u64,
        chunk: usize,
    ) -> Result<Self> {
        descriptor.validate()?;
        let chunk = chunk.max(1);
        match (descriptor.frame_type().is_control(), descriptor.payload_size()) {
            (false, Some(declared)) => {
                if declared > max_payload {
                    return Err(FrameError::PayloadTooLarge {
                        size: declared,
                        max: max_payload,
                    });
                }
                Ok(Encoder::Streaming(StreamingEncoder {
                    declared,
                    sent: 0,
                    header_staged: false,
                    pending: BytesMut::new(),
                    mask,
                    scratch: BytesMut::new(),
                    chunk,
                }))
            }
            (control, declared) => {
                let limit = if control {
                    MAX_CONTROL_PAYLOAD as u64
                } else {
                    max_payload
                };
                let initial = declared.unwrap_or(0).min(limit) as usize;
                Ok(Encoder::Buffered(BufferedEncoder {
                    payload: BytesMut::with_capacity(initial),
                    limit,
                    sealed: false,
                    pending: BytesMut::new(),
                    mask,
                    chunk,
                }))
            }
        }
    }

    pub(crate) fn write(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        src: &[u8],
    ) -> Result<usize> {
        match self {
            Encoder::Streaming(enc) => enc.write(descriptor, transport, src),
            Encoder::Buffered(enc) => enc.write(descriptor, src),
        }
    }

    pub(crate) fn write_vectored(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        srcs: &[IoSlice<'_>],
    ) -> Result<usize> {
        if let Encoder::Streaming(enc) = self {
            if enc.mask.is_none() {
                return enc.write_vectored_direct(descriptor, transport, srcs);
            }
        }
        let mut total = 0usize;
        for src in srcs {
            if src.is_empty() {
                continue;
            }
            let n = self.write(descriptor, transport, src)?;
            total += n;
            if n < src.len() {
                break;
            }
        }
        Ok(total)
    }

    pub(crate) fn transfer_from_file(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        file: &File,
        position: u64,
        count: u64,
    ) -> Result<u64> {
        if let Encoder::Streaming(enc) = self {
            if let Some(budget) = enc.direct_budget(descriptor, transport, count)? {
                let n = transport.transfer_from_file(file, position, budget)?;
                enc.sent += n;
                return Ok(n);
            }
        }
        let len = count.min(self.chunk() as u64) as usize;
        if len == 0 {
            return Ok(0);
        }
        let mut buf = vec![0u8; len];
        let read = read_at(file, &mut buf, position)?;
        if read == 0 {
            return Ok(0);
        }
        Ok(self.write(descriptor, transport, &buf[..read])? as u64)
    }

    pub(crate) fn transfer_from_source(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        source: &dyn StreamSource,
        count: u64,
        through: &mut BytesMut,
    ) -> Result<u64> {
        if let Encoder::Streaming(enc) = self {
            if let Some(budget) = enc.direct_budget(descriptor, transport, count)? {
                let n = transport.transfer_from_source(source, budget, through)?;
                enc.sent += n;
                return Ok(n);
            }
        }
        through.clear();
        let want = count.min(self.budget().min(self.chunk() as u64)) as usize;
        if want == 0 {
            return Ok(0);
        }
        through.resize(want, 0);
        let read = match source.read(&mut through[..]) {
            Ok(read) => read,
            Err(err) => {
                through.clear();
                return Err(err.into());
            }
        };
        through.truncate(read);
        if read == 0 {
            return Ok(0);
        }
        let n = self.write(descriptor, transport, &through[..])?;
        through.advance(n);
        Ok(n as u64)
    }

    /// Push any staged bytes. Once `closed`, also stage whatever the frame
    /// still owes (a header for an empty frame, or the buffered frame).
    ///
    /// `Ok(true)` when nothing staged remains.
    pub(crate) fn flush_pending(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        closed: bool,
    ) -> Result<bool> {
        match self {
            Encoder::Streaming(enc) => {
                if closed && !enc.header_staged && enc.declared == 0 {
                    enc.stage_header(descriptor)?;
                }
                drain(&mut enc.pending, transport)
            }
            Encoder::Buffered(enc) => {
                if closed && !enc.sealed {
                    enc.seal(descriptor)?;
                }
                drain(&mut enc.pending, transport)
            }
        }
    }

    /// Completeness check run on close: has the whole frame reached the
    /// transport? A sized frame that never started is reported complete,
    /// since nothing of it is on the wire.
    pub(crate) fn is_complete(&self) -> Result<bool> {
        match self {
            Encoder::Streaming(enc) => {
                // nothing reached the wire: the frame can be dropped cleanly
                if !enc.header_staged && enc.sent == 0 && enc.declared > 0 {
                    return Ok(true);
                }
                if enc.sent < enc.declared {
                    return Err(FrameError::IncompleteFrame {
                        declared: enc.declared,
                        remaining: enc.declared - enc.sent,
                    });
                }
                Ok(enc.header_staged && enc.pending.is_empty())
            }
            Encoder::Buffered(enc) => Ok(enc.sealed && enc.pending.is_empty()),
        }
    }

    /// Whether the payload writes would be rejected regardless of activity.
    pub(crate) fn is_buffered(&self) -> bool {
        matches!(self, Encoder::Buffered(_))
    }

    fn chunk(&self) -> usize {
        match self {
            Encoder::Streaming(enc) => enc.chunk,
            Encoder::Buffered(enc) => enc.chunk,
        }
    }

    /// Payload bytes this frame can still take.
    fn budget(&self) -> u64 {
        match self {
            Encoder::Streaming(enc) => enc.declared - enc.sent,
            Encoder::Buffered(enc) => enc.limit - enc.payload.len() as u64,
        }
    }
}

impl StreamingEncoder {
    fn stage_header(&mut self, descriptor: &FrameDescriptor) -> Result<()> {
        let header = descriptor.header(self.declared, self.mask);
        encode_header(&header, &mut self.pending)?;
        self.header_staged = true;
        Ok(())
    }

    /// Make sure the header is out. `Ok(false)` while it is still pending.
    fn ready_for_payload(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
    ) -> Result<bool> {
        if !self.header_staged {
            self.stage_header(descriptor)?;
        }
        drain(&mut self.pending, transport)
    }

    fn check_budget(&self, wanted: usize) -> Result<u64> {
        let remaining = self.declared - self.sent;
        if remaining == 0 && wanted > 0 {
            return Err(FrameError::PayloadTooLarge {
                size: self.sent + wanted as u64,
                max: self.declared,
            });
        }
        Ok(remaining.min(wanted as u64))
    }

    fn write(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        src: &[u8],
    ) -> Result<usize> {
        if !self.ready_for_payload(descriptor, transport)? {
            return Ok(0);
        }
        let budget = self.check_budget(src.len())? as usize;
        if budget == 0 {
            return Ok(0);
        }
        let src = &src[..budget];
        let n = match self.mask {
            None => transport.write(src)?,
            Some(key) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(src);
                apply_mask(&mut self.scratch, key, self.sent);
                transport.write(&self.scratch[..])?
            }
        };
        self.sent += n as u64;
        Ok(n)
    }

    fn write_vectored_direct(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        srcs: &[IoSlice<'_>],
    ) -> Result<usize> {
        if !self.ready_for_payload(descriptor, transport)? {
            return Ok(0);
        }
        let wanted: usize = srcs.iter().map(|s| s.len()).sum();
        let mut budget = self.check_budget(wanted)? as usize;
        if budget == 0 {
            return Ok(0);
        }
        let mut limited = Vec::with_capacity(srcs.len());
        for src in srcs {
            if budget == 0 {
                break;
            }
            let take = src.len().min(budget);
            limited.push(IoSlice::new(&src[..take]));
            budget -= take;
        }
        let n = transport.write_vectored(&limited)?;
        self.sent += n as u64;
        Ok(n)
    }

    /// Budget for forwarding a transfer straight to the transport, or `None`
    /// when the bytes must pass through the masking path.
    fn direct_budget(
        &mut self,
        descriptor: &FrameDescriptor,
        transport: &dyn StreamSink,
        count: u64,
    ) -> Result<Option<u64>> {
        if self.mask.is_some() {
            return Ok(None);
        }
        if !self.ready_for_payload(descriptor, transport)? {
            return Ok(Some(0));
        }
        let remaining = self.declared - self.sent;
        if remaining == 0 && count > 0 {
            return Err(FrameError::PayloadTooLarge {
                size: self.sent + count,
                max: self.declared,
            });
        }
        Ok(Some(remaining.min(count)))
    }
}

impl BufferedEncoder {
    fn write(&mut self, descriptor: &FrameDescriptor, src: &[u8]) -> Result<usize> {
        if self.sealed {
            return Err(FrameError::InvalidState("frame already emitted"));
        }
        let size = self.payload.len() as u64 + src.len() as u64;
        if size > self.limit {
            return Err(if descriptor.frame_type().is_control() {
                FrameError::ControlFrameTooLarge { size }
            } else {
                FrameError::PayloadTooLarge {
                    size,
                    max: self.limit,
                }
            });
        }
        self.payload.extend_from_slice(src);
        Ok(src.len())
    }

    fn seal(&mut self, descriptor: &FrameDescriptor) -> Result<()> {
        if descriptor.frame_type() == FrameType::Close {
            validate_close_payload(&self.payload)?;
        }
        let header = descriptor.header(self.payload.len() as u64, self.mask);
        encode_header(&header, &mut self.pending)?;
        let mut payload = self.payload.split();
        if let Some(key) = self.mask {
            apply_mask(&mut payload, key, 0);
        }
        self.pending.unsplit(payload);
        self.sealed = true;
        Ok(())
    }
}
