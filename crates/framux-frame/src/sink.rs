//! Write side of a single outbound frame.
//!
//! A [`SinkFrameChannel`] looks like a transport sink to application code
//! but only touches the shared transport while its owner has activated it.
//! Until then writes return `Ok(0)`, suspend/resume requests are cached, and
//! blocking waits park on the frame's own gate.

use std::fmt;
use std::fs::File;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use framux_transport::{
    Channel, ChannelOption, Executor, ListenerSetter, OptionValue, StreamSink, StreamSource,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::{FrameConfig, FrameType};
use crate::descriptor::FrameDescriptor;
use crate::encoder::Encoder;
use crate::error::{FrameError, Result};
use crate::gate::{Latch, SuspendCache, WaitGate};
use crate::owner::{FrameId, OwnerHandle};

struct FrameState {
    descriptor: FrameDescriptor,
    encoder: Encoder,
}

/// One outbound frame over a shared transport sink.
pub struct SinkFrameChannel {
    transport: Arc<dyn StreamSink>,
    owner: OwnerHandle,
    activated: Latch,
    closed: Latch,
    writes_shutdown: Latch,
    written: Latch,
    completed: Latch,
    suspend: SuspendCache,
    gate: WaitGate,
    state: Mutex<FrameState>,
    write_setter: ListenerSetter<SinkFrameChannel>,
    close_setter: ListenerSetter<SinkFrameChannel>,
}

/// Owner-side handle used to activate and drive a [`SinkFrameChannel`].
///
/// Only the component that created the frame should hold one.
#[derive(Clone)]
pub struct SinkActivator {
    frame: Arc<SinkFrameChannel>,
}

impl SinkFrameChannel {
    /// Create an inactive frame described by `descriptor`.
    ///
    /// In the client role a fresh masking key is drawn for the frame.
    pub fn new(
        transport: Arc<dyn StreamSink>,
        owner: OwnerHandle,
        descriptor: FrameDescriptor,
        config: &FrameConfig,
    ) -> Result<(Arc<Self>, SinkActivator)> {
        let mask = config
            .role
            .masks_outbound()
            .then(rand::random::<[u8; 4]>);
        let encoder = Encoder::for_descriptor(
            &descriptor,
            mask,
            config.max_payload_size,
            config.transfer_chunk_size,
        )?;
        let frame = Arc::new(Self {
            transport,
            owner,
            activated: Latch::new(),
            closed: Latch::new(),
            writes_shutdown: Latch::new(),
            written: Latch::new(),
            completed: Latch::new(),
            suspend: SuspendCache::default(),
            gate: WaitGate::new(),
            state: Mutex::new(FrameState {
                descriptor,
                encoder,
            }),
            write_setter: ListenerSetter::new(),
            close_setter: ListenerSetter::new(),
        });
        let activator = SinkActivator {
            frame: Arc::clone(&frame),
        };
        Ok((frame, activator))
    }

    pub fn id(&self) -> FrameId {
        self.owner.id()
    }

    /// Snapshot of the frame metadata.
    pub fn descriptor(&self) -> FrameDescriptor {
        self.state.lock().descriptor
    }

    pub fn frame_type(&self) -> FrameType {
        self.descriptor().frame_type()
    }

    pub fn rsv(&self) -> u8 {
        self.descriptor().rsv()
    }

    pub fn is_final_fragment(&self) -> bool {
        self.descriptor().is_final_fragment()
    }

    pub fn payload_size(&self) -> Option<u64> {
        self.descriptor().payload_size()
    }

    /// Whether this frame currently holds the transport.
    pub fn is_active(&self) -> bool {
        self.activated.is_set() && self.owner.is_active()
    }

    /// Whether any payload byte has been handed to the encoder.
    pub fn is_written(&self) -> bool {
        self.written.is_set()
    }

    /// Whether the owner has been told this frame is finished.
    pub fn is_completed(&self) -> bool {
        self.completed.is_set()
    }

    /// Open only while neither this frame nor the transport has been closed.
    pub fn is_open(&self) -> bool {
        !self.closed.is_set() && self.transport.is_open()
    }

    /// Threads currently parked in [`await_writable`](Self::await_writable).
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

    /// Set the FIN flag. Fails once writing has started.
    pub fn set_final_fragment(&self, final_fragment: bool) -> Result<()> {
        let mut state = self.lock_metadata()?;
        state.descriptor.set_final_fragment(final_fragment)
    }

    /// Set the RSV bits. Fails once writing has started.
    pub fn set_rsv(&self, rsv: u8) -> Result<()> {
        let mut state = self.lock_metadata()?;
        state.descriptor.set_rsv(rsv)
    }

    fn lock_metadata(&self) -> Result<parking_lot::MutexGuard<'_, FrameState>> {
        let state = self.state.lock();
        if self.closed.is_set() {
            return Err(FrameError::Closed);
        }
        if self.written.is_set() {
            return Err(FrameError::InvalidState(
                "frame metadata cannot change after the first write",
            ));
        }
        Ok(state)
    }

    /// Lock the frame state for a payload operation, or `None` while
    /// inactive. Marks the frame written.
    fn begin_write(
        &self,
        op: &'static str,
    ) -> Result<Option<parking_lot::MutexGuard<'_, FrameState>>> {
        self.check_open()?;
        if !self.is_active() {
            trace!(frame = %self.id(), op, "frame not active");
            return Ok(None);
        }
        let state = self.state.lock();
        // close may have completed the frame while we waited on the lock
        if self.closed.is_set() {
            return Err(FrameError::Closed);
        }
        if self.written.set() {
            trace!(frame = %self.id(), "first payload write, metadata frozen");
        }
        Ok(Some(state))
    }

    /// Write payload bytes. `Ok(0)` while the frame is inactive or the
    /// transport is full.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        let Some(mut state) = self.begin_write("write")? else {
            return Ok(0);
        };
        let FrameState {
            descriptor,
            encoder,
        } = &mut *state;
        encoder.write(descriptor, &*self.transport, src)
    }

    pub fn write_vectored(&self, srcs: &[IoSlice<'_>]) -> Result<usize> {
        let Some(mut state) = self.begin_write("write_vectored")? else {
            return Ok(0);
        };
        let FrameState {
            descriptor,
            encoder,
        } = &mut *state;
        encoder.write_vectored(descriptor, &*self.transport, srcs)
    }

    /// Gathering write over `srcs[offset..offset + len]`.
    pub fn write_vectored_range(
        &self,
        srcs: &[IoSlice<'_>],
        offset: usize,
        len: usize,
    ) -> Result<usize> {
        let range = offset
            .checked_add(len)
            .and_then(|end| srcs.get(offset..end))
            .ok_or_else(|| {
                FrameError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "buffer range out of bounds",
                ))
            })?;
        self.write_vectored(range)
    }

    /// Copy up to `count` bytes of `file` from `position` into the frame.
    pub fn transfer_from_file(&self, file: &File, position: u64, count: u64) -> Result<u64> {
        let Some(mut state) = self.begin_write("transfer_from_file")? else {
            return Ok(0);
        };
        let FrameState {
            descriptor,
            encoder,
        } = &mut *state;
        encoder.transfer_from_file(descriptor, &*self.transport, file, position, count)
    }

    /// Move up to `count` bytes from `source` into the frame via `through`.
    ///
    /// Bytes read but not accepted stay in `through`.
    pub fn transfer_from_source(
        &self,
        source: &dyn StreamSource,
        count: u64,
        through: &mut BytesMut,
    ) -> Result<u64> {
        let Some(mut state) = self.begin_write("transfer_from_source")? else {
            return Ok(0);
        };
        let FrameState {
            descriptor,
            encoder,
        } = &mut *state;
        encoder.transfer_from_source(descriptor, &*self.transport, source, count, through)
    }

    /// Write all of `src`, blocking on writability between partial writes.
    pub fn write_all(&self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let n = self.write(src)?;
            if n == 0 {
                self.await_writable()?;
                continue;
            }
            src = &src[n..];
        }
        Ok(())
    }

    /// Push staged bytes and flush the transport.
    ///
    /// `Ok(false)` while inactive or while bytes are still pending.
    pub fn flush(&self) -> Result<bool> {
        self.check_open()?;
        self.flush_inner()
    }

    fn flush_inner(&self) -> Result<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        let drained = {
            let mut state = self.state.lock();
            if self.completed.is_set() {
                return Ok(false);
            }
            let FrameState {
                descriptor,
                encoder,
            } = &mut *state;
            encoder.flush_pending(descriptor, &*self.transport, self.closed.is_set())?
        };
        if !drained {
            return Ok(false);
        }
        Ok(self.transport.flush()?)
    }

    /// Flush, run the completeness check, and notify the owner once ready.
    fn try_complete(&self) -> Result<bool> {
        if self.completed.is_set() {
            return Ok(true);
        }
        let flushed = self.flush_inner()?;
        let ready = self.state.lock().encoder.is_complete()?;
        trace!(frame = %self.id(), flushed, ready, "completion check");
        if ready && self.completed.set() {
            debug!(frame = %self.id(), "frame complete");
            self.owner.complete();
        }
        Ok(ready)
    }

    /// Close the frame. Repeated calls are no-ops.
    ///
    /// Blocked waiters are released and the close listener fires even if the
    /// final flush fails.
    pub fn close(&self) -> Result<()> {
        if !self.closed.set() {
            return Ok(());
        }
        debug!(frame = %self.id(), active = self.is_active(), "closing sink frame");
        let result = self.try_complete();
        if let Err(err) = &result {
            warn!(frame = %self.id(), %err, "sink frame closed with an error");
        }
        self.gate.release();
        self.close_setter.invoke(self);
        result.map(|_| ())
    }

    /// Signal end of this frame's output. Only the first call flushes.
    pub fn shutdown_writes(&self) -> Result<()> {
        if !self.writes_shutdown.set() {
            return Ok(());
        }
        self.flush().map(|_| ())
    }

    pub fn suspend_writes(&self) {
        if self.is_active() {
            self.transport.suspend_writes();
        } else {
            self.suspend.suspend();
        }
    }

    pub fn resume_writes(&self) {
        if self.is_active() {
            self.transport.resume_writes();
        } else {
            self.suspend.resume();
        }
    }

    pub fn is_write_resumed(&self) -> bool {
        if self.is_active() {
            self.transport.is_write_resumed()
        } else {
            !self.suspend.is_suspended()
        }
    }

    /// Fire this frame's write listener, waking the transport first when
    /// active. Never releases threads parked on an inactive frame.
    pub fn wakeup_writes(&self) {
        if self.is_active() {
            self.transport.wakeup_writes();
        }
        self.write_setter.invoke(self);
    }

    /// Block until writable. While inactive, blocks until the frame is
    /// activated or closed.
    pub fn await_writable(&self) -> Result<()> {
        if self.is_active() {
            return Ok(self.transport.await_writable()?);
        }
        self.gate.park(None);
        Ok(())
    }

    /// Like [`await_writable`](Self::await_writable), returning normally once
    /// `timeout` elapses.
    pub fn await_writable_timeout(&self, timeout: Duration) -> Result<()> {
        if self.is_active() {
            return Ok(self.transport.await_writable_timeout(timeout)?);
        }
        if !self.gate.park(Some(timeout)) {
            trace!(frame = %self.id(), ?timeout, "await_writable timed out");
        }
        Ok(())
    }

    /// Listener fired when this frame may write.
    pub fn write_setter(&self) -> &ListenerSetter<SinkFrameChannel> {
        &self.write_setter
    }

    /// Listener fired once when this frame closes.
    pub fn close_setter(&self) -> &ListenerSetter<SinkFrameChannel> {
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

    pub fn write_thread(&self) -> Option<Arc<dyn Executor>> {
        self.transport.write_thread()
    }
}

impl fmt::Debug for SinkFrameChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SinkFrameChannel")
            .field("id", &self.id())
            .field("descriptor", &state.descriptor)
            .field("buffered", &state.encoder.is_buffered())
            .field("activated", &self.activated.is_set())
            .field("closed", &self.closed.is_set())
            .field("written", &self.written.is_set())
            .finish()
    }
}

impl SinkActivator {
    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    pub fn channel(&self) -> &Arc<SinkFrameChannel> {
        &self.frame
    }

    pub fn is_closed(&self) -> bool {
        self.frame.closed.is_set()
    }

    /// Grant the frame the transport: apply the cached suspend preference,
    /// then wake every parked waiter. Only the first call has any effect.
    pub fn activate(&self) -> bool {
        let frame = &self.frame;
        if !frame.activated.set() {
            return false;
        }
        if frame.suspend.is_suspended() {
            frame.transport.suspend_writes();
        } else {
            frame.transport.resume_writes();
        }
        let woken = frame.gate.open().unwrap_or(0);
        debug!(frame = %frame.id(), woken, "sink frame activated");
        true
    }

    /// Push out a frame that was closed before it could finish.
    ///
    /// `Ok(true)` once the owner has been notified.
    pub fn drive(&self) -> Result<bool> {
        if !self.is_closed() {
            return Ok(false);
        }
        self.frame.try_complete()
    }

    /// Forward transport writability to the frame's listener.
    pub fn fire_write_listener(&self) -> bool {
        self.frame.write_setter.invoke(&self.frame)
    }
}

impl fmt::Debug for SinkActivator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SinkActivator").field(&self.id()).finish()
    }
}
