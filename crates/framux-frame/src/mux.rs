//! Multiplexing owner: serialises frame activation over one connection.
//!
//! Outbound frames are activated strictly in creation order, one at a time.
//! Inbound frames are decoded one header at a time; the next header is not
//! read until the previous payload has been consumed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use framux_transport::{StreamSink, StreamSource};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::{decode_header, header_len, FrameConfig, FrameType};
use crate::descriptor::FrameDescriptor;
use crate::error::{FrameError, Result};
use crate::owner::{FrameId, FrameOwner, OwnerHandle};
use crate::sink::{SinkActivator, SinkFrameChannel};
use crate::source::{SourceActivator, SourceFrameChannel};

const NO_FRAME: u64 = 0;

#[derive(Default)]
struct MuxTable {
    current_sink: Option<SinkActivator>,
    queued: VecDeque<SinkActivator>,
    current_source: Option<SourceActivator>,
    expecting_continuation: bool,
}

/// Owns one transport connection and hands it to frames in turn.
///
/// # Example
///
/// ```no_run
/// use framux_frame::{FrameConfig, FrameMultiplexer, FrameType};
/// use framux_transport::SocketChannel;
///
/// let (local, _remote) = SocketChannel::pair()?;
/// let mux = FrameMultiplexer::from_duplex(local, FrameConfig::server());
///
/// let frame = mux.send(FrameType::Text, Some(5))?;
/// frame.write_all(b"hello")?;
/// frame.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct FrameMultiplexer {
    sink: Arc<dyn StreamSink>,
    source: Arc<dyn StreamSource>,
    config: FrameConfig,
    self_ref: Weak<FrameMultiplexer>,
    next_id: AtomicU64,
    active_sink: AtomicU64,
    active_source: AtomicU64,
    table: Mutex<MuxTable>,
    inbound: Mutex<BytesMut>,
}

impl FrameMultiplexer {
    /// Multiplex frames over separate sink and source halves.
    ///
    /// Registers itself as the sink's write listener.
    pub fn new(
        sink: Arc<dyn StreamSink>,
        source: Arc<dyn StreamSource>,
        config: FrameConfig,
    ) -> Arc<Self> {
        let mux = Arc::new_cyclic(|self_ref| Self {
            sink,
            source,
            config,
            self_ref: self_ref.clone(),
            next_id: AtomicU64::new(1),
            active_sink: AtomicU64::new(NO_FRAME),
            active_source: AtomicU64::new(NO_FRAME),
            table: Mutex::new(MuxTable::default()),
            inbound: Mutex::new(BytesMut::new()),
        });
        let weak = Arc::downgrade(&mux);
        mux.sink.write_setter().set(move |_| {
            if let Some(mux) = weak.upgrade() {
                mux.on_writable();
            }
        });
        debug!(role = ?mux.config.role, "frame multiplexer created");
        mux
    }

    /// Multiplex frames over a channel that is both sink and source.
    pub fn from_duplex<T>(channel: Arc<T>, config: FrameConfig) -> Arc<Self>
    where
        T: StreamSink + StreamSource + 'static,
    {
        let sink: Arc<dyn StreamSink> = channel.clone();
        let source: Arc<dyn StreamSource> = channel;
        Self::new(sink, source, config)
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn handle(&self) -> OwnerHandle {
        let id = FrameId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let owner: Weak<dyn FrameOwner> = self.self_ref.clone();
        OwnerHandle::new(owner, id)
    }

    /// Start a new outbound frame.
    ///
    /// The frame is active right away when no other outbound frame is;
    /// otherwise it waits its turn behind the frames created before it.
    pub fn send(
        &self,
        frame_type: FrameType,
        payload_size: Option<u64>,
    ) -> Result<Arc<SinkFrameChannel>> {
        let handle = self.handle();
        let id = handle.id();
        let (frame, activator) = SinkFrameChannel::new(
            Arc::clone(&self.sink),
            handle,
            FrameDescriptor::new(frame_type, payload_size),
            &self.config,
        )?;

        let start = {
            let mut table = self.table.lock();
            if table.current_sink.is_none() {
                table.current_sink = Some(activator.clone());
                self.active_sink.store(id.get(), Ordering::SeqCst);
                true
            } else {
                table.queued.push_back(activator.clone());
                false
            }
        };
        debug!(
            frame = %id,
            %frame_type,
            ?payload_size,
            queued = !start,
            "outbound frame created"
        );
        if start {
            self.start_sink(&activator);
        }
        Ok(frame)
    }

    fn start_sink(&self, activator: &SinkActivator) {
        activator.activate();
        if activator.is_closed() {
            if let Err(err) = activator.drive() {
                warn!(
                    frame = %activator.id(),
                    %err,
                    "failed to emit frame closed before activation"
                );
            }
        }
    }

    /// Decode the next inbound frame header.
    ///
    /// `Ok(None)` while the previous inbound frame still has unread payload
    /// or the header has not fully arrived. Never reads past the header.
    pub fn receive(&self) -> Result<Option<Arc<SourceFrameChannel>>> {
        {
            let mut table = self.table.lock();
            if let Some(current) = &table.current_source {
                if !current.channel().is_complete() {
                    return Ok(None);
                }
                trace!(frame = %current.id(), "inbound payload consumed");
                table.current_source = None;
                self.active_source.store(NO_FRAME, Ordering::SeqCst);
            }
        }

        let header = {
            let mut buf = self.inbound.lock();
            loop {
                let needed = if buf.len() < 2 {
                    2
                } else {
                    header_len([buf[0], buf[1]])
                };
                if buf.len() >= needed {
                    break;
                }
                let start = buf.len();
                buf.resize(needed, 0);
                let n = match self.source.read(&mut buf[start..]) {
                    Ok(n) => n,
                    Err(err) => {
                        buf.truncate(start);
                        return Err(err.into());
                    }
                };
                buf.truncate(start + n);
                if n == 0 {
                    return Ok(None);
                }
            }
            match decode_header(&mut buf, self.config.max_payload_size)? {
                Some(header) => header,
                None => return Ok(None),
            }
        };

        let expects_mask = !self.config.role.masks_outbound();
        if header.mask.is_some() != expects_mask {
            return Err(FrameError::Protocol(if expects_mask {
                "unmasked frame from client".to_string()
            } else {
                "masked frame from server".to_string()
            }));
        }

        let handle = self.handle();
        let id = handle.id();
        let (frame, activator) =
            SourceFrameChannel::new(Arc::clone(&self.source), handle, &header, &self.config);
        {
            let mut table = self.table.lock();
            if !header.frame_type.is_control() {
                match (header.frame_type, table.expecting_continuation) {
                    (FrameType::Continuation, false) => {
                        return Err(FrameError::Protocol(
                            "continuation frame without a fragmented message".to_string(),
                        ))
                    }
                    (FrameType::Text | FrameType::Binary, true) => {
                        return Err(FrameError::Protocol(
                            "new message before the fragmented one finished".to_string(),
                        ))
                    }
                    _ => {}
                }
                table.expecting_continuation = !header.fin;
            }
            table.current_source = Some(activator.clone());
            self.active_source.store(id.get(), Ordering::SeqCst);
        }
        debug!(
            frame = %id,
            frame_type = %header.frame_type,
            len = header.payload_len,
            fin = header.fin,
            "inbound frame"
        );
        activator.activate();
        Ok(Some(frame))
    }

    /// Drive closed frames that still owe bytes to the transport.
    ///
    /// Returns `Ok(true)` when no closed frame is left waiting.
    pub fn pump(&self) -> Result<bool> {
        loop {
            let current = self.table.lock().current_sink.clone();
            match current {
                Some(activator) if activator.is_closed() => {
                    if !activator.drive()? {
                        return Ok(false);
                    }
                }
                _ => break,
            }
        }
        let current = self.table.lock().current_source.clone();
        if let Some(activator) = current {
            if activator.is_closed() && !activator.drive()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Transport write readiness: finish a closed frame, or tell the active
    /// frame it may write.
    fn on_writable(&self) {
        let current = self.table.lock().current_sink.clone();
        match current {
            Some(activator) if activator.is_closed() => {
                if let Err(err) = activator.drive() {
                    warn!(frame = %activator.id(), %err, "failed to drive closed frame");
                }
            }
            Some(activator) => {
                activator.fire_write_listener();
            }
            None => trace!("transport writable with no outbound frame"),
        }
    }

    /// Outbound frames not yet completed, the active one included.
    pub fn pending(&self) -> usize {
        let table = self.table.lock();
        table.queued.len() + usize::from(table.current_sink.is_some())
    }

    pub fn active_sink(&self) -> Option<FrameId> {
        match self.active_sink.load(Ordering::SeqCst) {
            NO_FRAME => None,
            id => Some(FrameId::new(id)),
        }
    }

    pub fn active_source(&self) -> Option<FrameId> {
        match self.active_source.load(Ordering::SeqCst) {
            NO_FRAME => None,
            id => Some(FrameId::new(id)),
        }
    }
}

impl FrameOwner for FrameMultiplexer {
    fn is_active(&self, id: FrameId) -> bool {
        let id = id.get();
        self.active_sink.load(Ordering::SeqCst) == id
            || self.active_source.load(Ordering::SeqCst) == id
    }

    fn complete(&self, id: FrameId) {
        if self.active_source.load(Ordering::SeqCst) == id.get() {
            let mut table = self.table.lock();
            table.current_source = None;
            self.active_source.store(NO_FRAME, Ordering::SeqCst);
            return;
        }

        let next = {
            let mut table = self.table.lock();
            if table.current_sink.as_ref().map(SinkActivator::id) == Some(id) {
                table.current_sink = table.queued.pop_front();
                let next_id = table
                    .current_sink
                    .as_ref()
                    .map_or(NO_FRAME, |next| next.id().get());
                self.active_sink.store(next_id, Ordering::SeqCst);
                table.current_sink.clone()
            } else {
                let before = table.queued.len();
                table.queued.retain(|queued| queued.id() != id);
                if table.queued.len() != before {
                    debug!(frame = %id, "dropped outbound frame before activation");
                }
                return;
            }
        };
        match next {
            Some(next) => {
                debug!(finished = %id, next = %next.id(), "handing transport to next frame");
                self.start_sink(&next);
            }
            None => trace!(finished = %id, "outbound queue empty"),
        }
    }
}

impl fmt::Debug for FrameMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameMultiplexer")
            .field("role", &self.config.role)
            .field("active_sink", &self.active_sink())
            .field("active_source", &self.active_source())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::BufMut;
    use framux_transport::{pipe, pipe_with_config, MemorySink, MemorySource, PipeConfig};

    use super::*;
    use crate::codec::{apply_mask, encode_header, FrameHeader, DEFAULT_MAX_PAYLOAD};

    struct Link {
        mux: Arc<FrameMultiplexer>,
        outbound: Arc<MemorySource>,
        inbound: Arc<MemorySink>,
    }

    fn link(config: FrameConfig, capacity: usize) -> Link {
        let (sink, outbound) = pipe_with_config(PipeConfig {
            capacity,
            ..PipeConfig::default()
        });
        let (inbound, source) = pipe();
        let mux = FrameMultiplexer::new(sink, source, config);
        Link {
            mux,
            outbound,
            inbound,
        }
    }

    fn wire_frame(
        frame_type: FrameType,
        fin: bool,
        payload: &[u8],
        mask: Option<[u8; 4]>,
    ) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_header(
            &FrameHeader {
                fin,
                rsv: 0,
                frame_type,
                mask,
                payload_len: payload.len() as u64,
            },
            &mut buf,
        )
        .unwrap();
        let mut body = payload.to_vec();
        if let Some(key) = mask {
            apply_mask(&mut body, key, 0);
        }
        buf.put_slice(&body);
        buf.to_vec()
    }

    fn decode_all(mut wire: BytesMut) -> Vec<(FrameType, Vec<u8>)> {
        let mut frames = Vec::new();
        while let Some(header) = decode_header(&mut wire, DEFAULT_MAX_PAYLOAD).unwrap() {
            let mut payload = wire.split_to(header.payload_len as usize).to_vec();
            if let Some(key) = header.mask {
                apply_mask(&mut payload, key, 0);
            }
            frames.push((header.frame_type, payload));
        }
        frames
    }

    #[test]
    fn frames_activate_in_creation_order() {
        let l = link(FrameConfig::server(), 1024);
        let first = l.mux.send(FrameType::Text, Some(5)).unwrap();
        let second = l.mux.send(FrameType::Binary, Some(3)).unwrap();
        assert!(first.is_active());
        assert!(!second.is_active());
        assert_eq!(l.mux.pending(), 2);

        assert_eq!(second.write(b"two").unwrap(), 0);
        first.write_all(b"first").unwrap();
        first.close().unwrap();

        assert!(second.is_active());
        assert_eq!(l.mux.active_sink(), Some(second.id()));
        second.write_all(b"two").unwrap();
        second.close().unwrap();
        assert_eq!(l.mux.pending(), 0);
        assert_eq!(l.mux.active_sink(), None);

        let frames = decode_all(BytesMut::from(&l.outbound.take_all()[..]));
        assert_eq!(
            frames,
            vec![
                (FrameType::Text, b"first".to_vec()),
                (FrameType::Binary, b"two".to_vec())
            ]
        );
    }

    #[test]
    fn queued_frame_closed_early_is_emitted_on_activation() {
        let l = link(FrameConfig::server(), 1024);
        let first = l.mux.send(FrameType::Text, None).unwrap();
        let ping = l.mux.send(FrameType::Ping, None).unwrap();
        let empty = l.mux.send(FrameType::Binary, Some(0)).unwrap();
        ping.close().unwrap();
        empty.close().unwrap();
        assert_eq!(l.mux.pending(), 3);

        first.write(b"hi").unwrap();
        first.close().unwrap();
        assert!(l.mux.pump().unwrap());
        assert_eq!(l.mux.pending(), 0);

        let frames = decode_all(BytesMut::from(&l.outbound.take_all()[..]));
        assert_eq!(
            frames,
            vec![
                (FrameType::Text, b"hi".to_vec()),
                (FrameType::Ping, Vec::new()),
                (FrameType::Binary, Vec::new())
            ]
        );
    }

    #[test]
    fn unstarted_sized_frame_leaves_the_queue() {
        let l = link(FrameConfig::server(), 1024);
        let first = l.mux.send(FrameType::Text, None).unwrap();
        let abandoned = l.mux.send(FrameType::Binary, Some(100)).unwrap();
        abandoned.close().unwrap();
        assert_eq!(l.mux.pending(), 1);
        first.close().unwrap();
        assert_eq!(l.mux.pending(), 0);
    }

    #[test]
    fn writable_transport_drives_closed_frame() {
        let l = link(FrameConfig::server(), 4);
        let frame = l.mux.send(FrameType::Text, None).unwrap();
        frame.write(b"buffered").unwrap();
        frame.close().unwrap();
        assert_eq!(l.mux.pending(), 1, "only 4 bytes fit");

        let mut wire = Vec::new();
        while l.mux.pending() > 0 {
            // consuming fires the transport write listener, which drives the frame
            wire.extend(l.outbound.take_all());
        }
        wire.extend(l.outbound.take_all());
        let frames = decode_all(BytesMut::from(&wire[..]));
        assert_eq!(frames, vec![(FrameType::Text, b"buffered".to_vec())]);
    }

    #[test]
    fn writability_reaches_active_frame_listener() {
        let l = link(FrameConfig::server(), 2);
        let frame = l.mux.send(FrameType::Binary, Some(10)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        frame.write_setter().set(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        frame.write(b"0123456789").unwrap();
        l.outbound.take_all();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn receive_reads_header_then_payload() {
        let l = link(FrameConfig::client(), 1024);
        let mut wire = wire_frame(FrameType::Text, true, b"hello", None);
        wire.extend(wire_frame(FrameType::Binary, true, b"next", None));
        l.inbound.write(&wire).unwrap();

        let frame = l.mux.receive().unwrap().unwrap();
        assert_eq!(frame.frame_type(), FrameType::Text);
        assert_eq!(frame.payload_size(), 5);
        assert_eq!(l.mux.active_source(), Some(frame.id()));
        assert!(l.mux.receive().unwrap().is_none(), "payload still unread");

        let mut buf = [0u8; 64];
        assert_eq!(frame.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        let next = l.mux.receive().unwrap().unwrap();
        assert_eq!(next.frame_type(), FrameType::Binary);
        assert_eq!(next.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"next");
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let l = link(FrameConfig::client(), 1024);
        let wire = wire_frame(FrameType::Binary, true, &[7u8; 200], None);
        l.inbound.write(&wire[..3]).unwrap();
        assert!(l.mux.receive().unwrap().is_none());

        l.inbound.write(&wire[3..]).unwrap();
        let frame = l.mux.receive().unwrap().unwrap();
        assert_eq!(frame.payload_size(), 200);
        assert_eq!(frame.remaining(), 200);
    }

    #[test]
    fn close_skips_unread_inbound_payload() {
        let l = link(FrameConfig::client(), 1024);
        let mut wire = wire_frame(FrameType::Binary, true, b"skip me", None);
        wire.extend(wire_frame(FrameType::Pong, true, b"", None));
        l.inbound.write(&wire).unwrap();

        let frame = l.mux.receive().unwrap().unwrap();
        frame.close().unwrap();
        assert_eq!(l.mux.active_source(), None);
        let pong = l.mux.receive().unwrap().unwrap();
        assert_eq!(pong.frame_type(), FrameType::Pong);
        assert!(pong.is_complete());
    }

    #[test]
    fn server_rejects_unmasked_frames() {
        let l = link(FrameConfig::server(), 1024);
        l.inbound
            .write(&wire_frame(FrameType::Text, true, b"x", None))
            .unwrap();
        assert!(matches!(l.mux.receive(), Err(FrameError::Protocol(_))));
    }

    #[test]
    fn server_unmasks_client_frames() {
        let l = link(FrameConfig::server(), 1024);
        l.inbound
            .write(&wire_frame(FrameType::Text, true, b"masked", Some([5, 6, 7, 8])))
            .unwrap();
        let frame = l.mux.receive().unwrap().unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(frame.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"masked");
    }

    #[test]
    fn fragment_ordering_is_enforced() {
        let l = link(FrameConfig::client(), 1024);
        l.inbound
            .write(&wire_frame(FrameType::Continuation, true, b"", None))
            .unwrap();
        assert!(matches!(l.mux.receive(), Err(FrameError::Protocol(_))));

        let l = link(FrameConfig::client(), 1024);
        let mut wire = wire_frame(FrameType::Text, false, b"", None);
        wire.extend(wire_frame(FrameType::Ping, true, b"", None));
        wire.extend(wire_frame(FrameType::Text, true, b"", None));
        l.inbound.write(&wire).unwrap();
        assert!(!l.mux.receive().unwrap().unwrap().is_final_fragment());
        assert_eq!(l.mux.receive().unwrap().unwrap().frame_type(), FrameType::Ping);
        assert!(matches!(l.mux.receive(), Err(FrameError::Protocol(_))));
    }

    #[test]
    fn inbound_control_frame_rules() {
        let l = link(FrameConfig::client(), 1024);
        let mut wire = BytesMut::new();
        wire.put_u8(0x09); // ping, FIN clear
        wire.put_u8(0x00);
        l.inbound.write(&wire).unwrap();
        assert!(matches!(l.mux.receive(), Err(FrameError::Protocol(_))));

        let l = link(FrameConfig::client(), 1024);
        let mut wire = BytesMut::new();
        wire.put_u8(0x89);
        wire.put_u8(126);
        wire.put_u16(200);
        l.inbound.write(&wire).unwrap();
        assert!(matches!(
            l.mux.receive(),
            Err(FrameError::ControlFrameTooLarge { size: 200 })
        ));
    }

    #[test]
    fn dropped_mux_deactivates_frames() {
        let l = link(FrameConfig::server(), 1024);
        let frame = l.mux.send(FrameType::Text, Some(3)).unwrap();
        assert!(frame.is_active());
        drop(l.mux);
        assert!(!frame.is_active());
        assert_eq!(frame.write(b"abc").unwrap(), 0);
    }
}
