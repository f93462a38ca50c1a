//! Read side of a single inbound frame.
//!
//! The header has already been consumed by the owner; a
//! [`SourceFrameChannel`] only hands out the frame's payload, unmasked, and
//! never reads past it.

use std::fmt;
use std::fs::File;
use std::io::IoSliceMut;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use framux_transport::{
    write_all_at, ChannelOption, Executor, ListenerSetter, OptionValue, StreamSink,
    StreamSource,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::{apply_mask, FrameConfig, FrameHeader, FrameType};
use crate::descriptor::FrameDescriptor;
use crate::error::{FrameError, Result};
use crate::gate::{Latch, SuspendCache, WaitGate};
use crate::owner::{FrameId, OwnerHandle};

struct ReadState {
    remaining: u64,
    offset: u64,
    scratch: BytesMut,
}

/// One inbound frame over a shared transport source.
pub struct SourceFrameChannel {
    transport: Arc<dyn StreamSource>,
    owner: OwnerHandle,
    descriptor: FrameDescriptor,
    mask: Option<[u8; 4]>,
    chunk: usize,
    activated: Latch,
    closed: Latch,
    reads_shutdown: Latch,
    completed: Latch,
    suspend: SuspendCache,
    gate: WaitGate,
    state: Mutex<ReadState>,
    read_setter: ListenerSetter<SourceFrameChannel>,
    close_setter: ListenerSetter<SourceFrameChannel>,
}

/// Owner-side handle used to activate and drain a [`SourceFrameChannel`].
#[derive(Clone)]
pub struct SourceActivator {
    frame: Arc<SourceFrameChannel>,
}

impl SourceFrameChannel {
    /// Create an inactive frame for the payload that follows `header`.
    pub fn new(
        transport: Arc<dyn StreamSource>,
        owner: OwnerHandle,
        header: &FrameHeader,
        config: &FrameConfig,
    ) -> (Arc<Self>, SourceActivator) {
        let frame = Arc::new(Self {
            transport,
            owner,
            descriptor: FrameDescriptor::from_header(header),
            mask: header.mask,
            chunk: config.transfer_chunk_size.max(1),
            activated: Latch::new(),
            closed: Latch::new(),
            reads_shutdown: Latch::new(),
            completed: Latch::new(),
            suspend: SuspendCache::default(),
            gate: WaitGate::new(),
            state: Mutex::new(ReadState {
                remaining: header.payload_len,
                offset: 0,
                scratch: BytesMut::new(),
            }),
            read_setter: ListenerSetter::new(),
            close_setter: ListenerSetter::new(),
        });
        let activator = SourceActivator {
            frame: Arc::clone(&frame),
        };
        (frame, activator)
    }

    pub fn id(&self) -> FrameId {
        self.owner.id()
    }

    pub fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    pub fn frame_type(&self) -> FrameType {
        self.descriptor.frame_type()
    }

    pub fn rsv(&self) -> u8 {
        self.descriptor.rsv()
    }

    pub fn is_final_fragment(&self) -> bool {
        self.descriptor.is_final_fragment()
    }

    /// Payload length announced by the header.
    pub fn payload_size(&self) -> u64 {
        self.descriptor.payload_size().unwrap_or(0)
    }

    /// Payload bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.state.lock().remaining
    }

    /// Whether the whole payload has been consumed.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_active(&self) -> bool {
        self.activated.is_set() && self.owner.is_active()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_set() && self.transport.is_open()
    }

    pub fn waiters(&self) -> usize {
        self.gate.waiters()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FrameError::Closed)
        }
    }

    fn begin_read(
        &self,
        op: &'static str,
    ) -> Result<Option<parking_lot::MutexGuard<'_, ReadState>>> {
        self.check_open()?;
        if !self.is_active() {
            trace!(frame = %self.id(), op, "frame not active");
            return Ok(None);
        }
        if self.reads_shutdown.is_set() {
            return Ok(None);
        }
        let state = self.state.lock();
        if self.closed.is_set() {
            return Err(FrameError::Closed);
        }
        Ok(Some(state))
    }

    fn read_locked(&self, state: &mut ReadState, dst: &mut [u8]) -> Result<usize> {
        let len = (dst.len() as u64).min(state.remaining) as usize;
        if len == 0 {
            return Ok(0);
        }
        let n = self.transport.read(&mut dst[..len])?;
        if let Some(key) = self.mask {
            apply_mask(&mut dst[..n], key, state.offset);
        }
        state.offset += n as u64;
        state.remaining -= n as u64;
        Ok(n)
    }

    /// Read payload bytes. `Ok(0)` while inactive, when no data is available
    /// yet, or once the payload is exhausted.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let Some(mut state) = self.begin_read("read")? else {
            return Ok(0);
        };
        self.read_locked(&mut state, dst)
    }

    pub fn read_vectored(&self, dsts: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let Some(mut state) = self.begin_read("read_vectored")? else {
            return Ok(0);
        };
        let mut total = 0usize;
        for dst in dsts.iter_mut() {
            if dst.is_empty() {
                continue;
            }
            let len = dst.len();
            let n = self.read_locked(&mut state, dst)?;
            total += n;
            if n < len {
                break;
            }
        }
        Ok(total)
    }

    /// Copy up to `count` payload bytes into `file` at `position`.
    pub fn transfer_to_file(&self, file: &File, position: u64, count: u64) -> Result<u64> {
        let Some(mut state) = self.begin_read("transfer_to_file")? else {
            return Ok(0);
        };
        let budget = count.min(state.remaining);
        if budget == 0 {
            return Ok(0);
        }
        if self.mask.is_none() {
            let n = self.transport.transfer_to_file(file, position, budget)?;
            state.offset += n;
            state.remaining -= n;
            return Ok(n);
        }
        let mut buf = std::mem::take(&mut state.scratch);
        buf.clear();
        buf.resize(budget.min(self.chunk as u64) as usize, 0);
        let result = self.read_locked(&mut state, &mut buf[..]);
        let outcome = match result {
            Ok(n) if n > 0 => write_all_at(file, &buf[..n], position)
                .map(|()| n as u64)
                .map_err(FrameError::from),
            other => other.map(|n| n as u64),
        };
        state.scratch = buf;
        outcome
    }

    /// Move up to `count` payload bytes into `sink` via `through`.
    ///
    /// Returns the bytes read from this frame; whatever `sink` did not
    /// accept stays in `through`.
    pub fn transfer_to_sink(
        &self,
        count: u64,
        through: &mut BytesMut,
        sink: &dyn StreamSink,
    ) -> Result<u64> {
        through.clear();
        let Some(mut state) = self.begin_read("transfer_to_sink")? else {
            return Ok(0);
        };
        let want = count.min(state.remaining).min(self.chunk as u64) as usize;
        if want == 0 {
            return Ok(0);
        }
        through.resize(want, 0);
        let read = match self.read_locked(&mut state, &mut through[..]) {
            Ok(read) => read,
            Err(err) => {
                through.clear();
                return Err(err);
            }
        };
        through.truncate(read);
        if read > 0 {
            let written = sink.write(&through[..])?;
            through.advance(written);
        }
        Ok(read as u64)
    }

    /// Discard unread payload. `Ok(true)` once nothing remains.
    fn discard(&self) -> Result<bool> {
        if !self.is_active() {
            return Ok(self.is_complete());
        }
        let mut state = self.state.lock();
        let mut buf = std::mem::take(&mut state.scratch);
        buf.resize(self.chunk, 0);
        let mut result = Ok(());
        while state.remaining > 0 {
            match self.read_locked(&mut state, &mut buf[..]) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        state.scratch = buf;
        result.map(|()| state.remaining == 0)
    }

    fn try_complete(&self) -> Result<bool> {
        if self.completed.is_set() {
            return Ok(true);
        }
        let ready = self.discard()?;
        if ready && self.completed.set() {
            debug!(frame = %self.id(), "inbound frame complete");
            self.owner.complete();
        }
        Ok(ready)
    }

    /// Close the frame, discarding whatever payload is still unread.
    pub fn close(&self) -> Result<()> {
        if !self.closed.set() {
            return Ok(());
        }
        debug!(frame = %self.id(), remaining = self.remaining(), "closing source frame");
        let result = self.try_complete();
        if let Err(err) = &result {
            warn!(frame = %self.id(), %err, "source frame closed with an error");
        }
        self.gate.release();
        self.close_setter.invoke(self);
        result.map(|_| ())
    }

    /// Stop reading this frame. Later reads return `Ok(0)`.
    pub fn shutdown_reads(&self) {
        if self.reads_shutdown.set() {
            trace!(frame = %self.id(), "reads shut down");
        }
    }

    pub fn suspend_reads(&self) {
        if self.is_active() {
            self.transport.suspend_reads();
        } else {
            self.suspend.suspend();
        }
    }

    pub fn resume_reads(&self) {
        if self.is_active() {
            self.transport.resume_reads();
        } else {
            self.suspend.resume();
        }
    }

    pub fn is_read_resumed(&self) -> bool {
        if self.is_active() {
            self.transport.is_read_resumed()
        } else {
            !self.suspend.is_suspended()
        }
    }

    pub fn wakeup_reads(&self) {
        if self.is_active() {
            self.transport.wakeup_reads();
        }
        self.read_setter.invoke(self);
    }

    pub fn await_readable(&self) -> Result<()> {
        if self.is_active() {
            return Ok(self.transport.await_readable()?);
        }
        self.gate.park(None);
        Ok(())
    }

    pub fn await_readable_timeout(&self, timeout: Duration) -> Result<()> {
        if self.is_active() {
            return Ok(self.transport.await_readable_timeout(timeout)?);
        }
        self.gate.park(Some(timeout));
        Ok(())
    }

    pub fn read_setter(&self) -> &ListenerSetter<SourceFrameChannel> {
        &self.read_setter
    }

    pub fn close_setter(&self) -> &ListenerSetter<SourceFrameChannel> {
        &self.close_setter
    }

    pub fn supports_option(&self, option: ChannelOption) -> bool {
        self.transport.supports_option(option)
    }

    pub fn get_option(&self, option: ChannelOption) -> Result<Option<OptionValue>> {
        Ok(self.transport.get_option(option)?)
    }

    pub fn set_option(
        &self,
        option: ChannelOption,
        value: OptionValue,
    ) -> Result<Option<OptionValue>> {
        Ok(self.transport.set_option(option, value)?)
    }

    pub fn worker(&self) -> Option<Arc<dyn Executor>> {
        self.transport.worker()
    }

    pub fn read_thread(&self) -> Option<Arc<dyn Executor>> {
        self.transport.read_thread()
    }
}

impl fmt::Debug for SourceFrameChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFrameChannel")
            .field("id", &self.id())
            .field("descriptor", &self.descriptor)
            .field("masked", &self.mask.is_some())
            .field("activated", &self.gate.is_open())
            .field("remaining", &self.remaining())
            .field("closed", &self.closed.is_set())
            .finish()
    }
}

impl SourceActivator {
    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    pub fn channel(&self) -> &Arc<SourceFrameChannel> {
        &self.frame
    }

    pub fn is_closed(&self) -> bool {
        self.frame.closed.is_set()
    }

    /// Grant the frame the transport. Only the first call has any effect.
    pub fn activate(&self) -> bool {
        let frame = &self.frame;
        if !frame.activated.set() {
            return false;
        }
        if frame.suspend.is_suspended() {
            frame.transport.suspend_reads();
        } else {
            frame.transport.resume_reads();
        }
        let woken = frame.gate.open().unwrap_or(0);
        debug!(frame = %frame.id(), woken, "source frame activated");
        true
    }

    /// Finish discarding a frame closed with payload left unread.
    pub fn drive(&self) -> Result<bool> {
        if !self.is_closed() {
            return Ok(false);
        }
        self.frame.try_complete()
    }

    pub fn fire_read_listener(&self) -> bool {
        self.frame.read_setter.invoke(&self.frame)
    }
}

impl fmt::Debug for SourceActivator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceActivator").field(&self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use framux_transport::{pipe, MemorySink};

    use super::*;
    use crate::owner::testing::ManualOwner;

    fn header(frame_type: FrameType, payload_len: u64, mask: Option<[u8; 4]>) -> FrameHeader {
        FrameHeader {
            fin: true,
            rsv: 0,
            frame_type,
            mask,
            payload_len,
        }
    }

    fn frame_over(
        header: &FrameHeader,
    ) -> (
        Arc<ManualOwner>,
        Arc<MemorySink>,
        Arc<SourceFrameChannel>,
        SourceActivator,
    ) {
        let owner = ManualOwner::new();
        let (sink, source) = pipe();
        let (frame, activator) =
            SourceFrameChannel::new(source, owner.handle(1), header, &FrameConfig::default());
        (owner, sink, frame, activator)
    }

    #[test]
    fn inactive_read_returns_zero() {
        let (_owner, sink, frame, _activator) = frame_over(&header(FrameType::Text, 3, None));
        sink.write(b"abc").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(frame.read(&mut buf).unwrap(), 0);
        assert_eq!(frame.remaining(), 3);
    }

    #[test]
    fn reads_stop_at_payload_boundary() {
        let (owner, sink, frame, activator) = frame_over(&header(FrameType::Binary, 4, None));
        sink.write(b"abcdNEXT").unwrap();
        owner.set_active(1);
        activator.activate();

        let mut buf = [0u8; 16];
        assert_eq!(frame.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
        assert!(frame.is_complete());
        assert_eq!(frame.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn masked_payload_is_unmasked_across_reads() {
        let key = [1, 2, 3, 4];
        let mut wire = *b"masked!";
        apply_mask(&mut wire, key, 0);

        let (owner, sink, frame, activator) =
            frame_over(&header(FrameType::Text, wire.len() as u64, Some(key)));
        sink.write(&wire).unwrap();
        owner.set_active(1);
        activator.activate();

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = frame.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"masked!");
    }

    #[test]
    fn close_discards_rest_and_completes() {
        let (owner, sink, frame, activator) = frame_over(&header(FrameType::Binary, 6, None));
        sink.write(b"abcdefXY").unwrap();
        owner.set_active(1);
        activator.activate();

        let mut buf = [0u8; 2];
        frame.read(&mut buf).unwrap();
        frame.close().unwrap();
        frame.close().unwrap();
        assert_eq!(owner.completed(), vec![FrameId::new(1)]);
        assert!(matches!(frame.read(&mut buf), Err(FrameError::Closed)));
    }

    #[test]
    fn read_racing_close_is_rejected() {
        let (owner, sink, frame, activator) = frame_over(&header(FrameType::Binary, 4, None));
        owner.set_active(1);
        activator.activate();
        let barrier = owner.stall_next_check();

        let reader = {
            let frame = Arc::clone(&frame);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                frame.read(&mut buf)
            })
        };
        barrier.wait();
        frame.close().unwrap();
        sink.write(b"late").unwrap();
        barrier.wait();

        assert!(matches!(reader.join().unwrap(), Err(FrameError::Closed)));
        assert_eq!(frame.remaining(), 4);
    }

    #[test]
    fn close_waits_for_missing_payload() {
        let (owner, sink, frame, activator) = frame_over(&header(FrameType::Binary, 6, None));
        sink.write(b"abc").unwrap();
        owner.set_active(1);
        activator.activate();

        frame.close().unwrap();
        assert!(owner.completed().is_empty());
        assert_eq!(frame.remaining(), 3);

        sink.write(b"def").unwrap();
        assert!(activator.drive().unwrap());
        assert_eq!(owner.completed(), vec![FrameId::new(1)]);
    }

    #[test]
    fn await_readable_released_by_activation() {
        let (owner, _sink, frame, activator) = frame_over(&header(FrameType::Text, 1, None));
        let parked = {
            let frame = Arc::clone(&frame);
            thread::spawn(move || frame.await_readable())
        };
        while frame.waiters() < 1 {
            thread::yield_now();
        }
        owner.set_active(1);
        activator.activate();
        parked.join().unwrap().unwrap();
    }

    #[test]
    fn suspend_cache_applies_on_activation() {
        let (owner, _sink, frame, activator) = frame_over(&header(FrameType::Text, 1, None));
        frame.suspend_reads();
        assert!(!frame.is_read_resumed());
        owner.set_active(1);
        activator.activate();
        assert!(!frame.is_read_resumed());
        frame.resume_reads();
        assert!(frame.is_read_resumed());
    }

    #[test]
    fn shutdown_reads_stops_delivery() {
        let (owner, sink, frame, activator) = frame_over(&header(FrameType::Binary, 4, None));
        sink.write(b"abcd").unwrap();
        owner.set_active(1);
        activator.activate();
        frame.shutdown_reads();
        let mut buf = [0u8; 4];
        assert_eq!(frame.read(&mut buf).unwrap(), 0);
        assert_eq!(frame.remaining(), 4);
    }

    #[test]
    fn transfer_to_sink_keeps_unaccepted_bytes() {
        let (owner, sink, frame, activator) = frame_over(&header(FrameType::Binary, 5, None));
        sink.write(b"hello").unwrap();
        owner.set_active(1);
        activator.activate();

        let (out, out_source) = framux_transport::pipe_with_config(framux_transport::PipeConfig {
            capacity: 2,
            ..Default::default()
        });
        let mut through = BytesMut::new();
        assert_eq!(frame.transfer_to_sink(10, &mut through, &*out).unwrap(), 5);
        assert_eq!(&through[..], b"llo");
        assert_eq!(out_source.take_all(), b"he");
    }

    #[test]
    fn premature_end_of_stream_surfaces() {
        let (owner, sink, frame, activator) = frame_over(&header(FrameType::Binary, 4, None));
        sink.write(b"ab").unwrap();
        sink.shutdown_writes().unwrap();
        owner.set_active(1);
        activator.activate();

        let mut buf = [0u8; 4];
        assert_eq!(frame.read(&mut buf).unwrap(), 2);
        assert!(matches!(
            frame.read(&mut buf),
            Err(FrameError::Transport(
                framux_transport::TransportError::EndOfStream
            ))
        ));
    }
}
