use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use framux::frame::{
    decode_header, FrameConfig, FrameDescriptor, FrameError, FrameId, FrameMultiplexer,
    FrameOwner, FrameType, OwnerHandle, SinkActivator, SinkFrameChannel, DEFAULT_MAX_PAYLOAD,
};
use framux::transport::{pipe, Channel, MemorySink, MemorySource, StreamSink};

/// Owner that lets the test decide activation and counts completions.
#[derive(Default)]
struct CountingOwner {
    active: AtomicBool,
    completions: AtomicUsize,
}

impl FrameOwner for CountingOwner {
    fn is_active(&self, _id: FrameId) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn complete(&self, _id: FrameId) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
    }
}

struct Single {
    owner: Arc<CountingOwner>,
    sink: Arc<MemorySink>,
    source: Arc<MemorySource>,
    frame: Arc<SinkFrameChannel>,
    activator: SinkActivator,
}

fn single(frame_type: FrameType, size: Option<u64>) -> Single {
    let owner = Arc::new(CountingOwner::default());
    let (sink, source) = pipe();
    let weak: Weak<dyn FrameOwner> = Arc::downgrade(&owner) as Weak<dyn FrameOwner>;
    let (frame, activator) = SinkFrameChannel::new(
        sink.clone(),
        OwnerHandle::new(weak, FrameId::new(1)),
        FrameDescriptor::new(frame_type, size),
        &FrameConfig::server(),
    )
    .unwrap();
    Single {
        owner,
        sink,
        source,
        frame,
        activator,
    }
}

impl Single {
    fn activate(&self) {
        self.owner.active.store(true, Ordering::SeqCst);
        assert!(self.activator.activate());
    }
}

fn mux_over_pipe() -> (Arc<FrameMultiplexer>, Arc<MemorySink>, Arc<MemorySource>) {
    let (sink, outbound) = pipe();
    let (_peer, source) = pipe();
    let mux = FrameMultiplexer::new(sink.clone(), source, FrameConfig::server());
    (mux, sink, outbound)
}

#[test]
fn write_before_activation_returns_zero_without_io() {
    let (mux, sink, _outbound) = mux_over_pipe();
    let first = mux.send(FrameType::Text, None).unwrap();
    let queued = mux.send(FrameType::Binary, Some(4)).unwrap();
    let before = sink.stats();

    assert_eq!(queued.write(b"data").unwrap(), 0);
    assert_eq!(queued.write(b"").unwrap(), 0);
    assert_eq!(sink.stats(), before);
    assert!(first.is_active());
}

#[test]
fn metadata_is_settable_until_first_byte() {
    let s = single(FrameType::Binary, Some(4));
    s.frame.set_final_fragment(false).unwrap();
    s.frame.set_rsv(0b010).unwrap();
    s.frame.set_final_fragment(true).unwrap();
    s.frame.set_rsv(0b001).unwrap();

    s.activate();
    s.frame.write(b"ab").unwrap();
    assert!(matches!(
        s.frame.set_final_fragment(false),
        Err(FrameError::InvalidState(_))
    ));
    assert!(matches!(s.frame.set_rsv(0), Err(FrameError::InvalidState(_))));
    assert_eq!(s.frame.rsv(), 0b001);
}

#[test]
fn transfer_also_freezes_metadata() {
    let s = single(FrameType::Binary, Some(3));
    s.activate();
    let (upstream, upstream_source) = pipe();
    upstream.write(b"xyz").unwrap();
    let mut through = BytesMut::new();
    assert_eq!(
        s.frame
            .transfer_from_source(&*upstream_source, 3, &mut through)
            .unwrap(),
        3
    );
    assert!(matches!(s.frame.set_rsv(1), Err(FrameError::InvalidState(_))));
}

#[test]
fn double_close_notifies_owner_once() {
    let s = single(FrameType::Binary, Some(2));
    s.activate();
    s.frame.write_all(b"ok").unwrap();
    s.frame.close().unwrap();
    s.frame.close().unwrap();
    assert_eq!(s.owner.completions.load(Ordering::SeqCst), 1);
}

#[test]
fn closed_frame_is_not_open_while_transport_is() {
    let s = single(FrameType::Text, Some(3));
    s.activate();
    s.frame.write_all(b"abc").unwrap();
    s.frame.close().unwrap();

    assert!(s.sink.is_open());
    assert!(!s.frame.is_open());
    assert!(matches!(s.frame.write(b"x"), Err(FrameError::Closed)));
    let file = File::open("/dev/null").unwrap();
    assert!(matches!(
        s.frame.transfer_from_file(&file, 0, 1),
        Err(FrameError::Closed)
    ));
}

#[test]
fn blocked_writer_is_released_by_activation() {
    let (mux, _sink, outbound) = mux_over_pipe();
    let first = mux.send(FrameType::Text, None).unwrap();
    let second = mux.send(FrameType::Binary, Some(5)).unwrap();

    let activated_at = Mutex::new(None);
    let returned = {
        let second = Arc::clone(&second);
        thread::spawn(move || {
            second.await_writable().unwrap();
            let at = Instant::now();
            second.write_all(b"after").unwrap();
            second.close().unwrap();
            at
        })
    };

    while second.waiters() < 1 {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(30));
    assert!(!returned.is_finished(), "released before activation");

    first.write(b"first").unwrap();
    *activated_at.lock().unwrap() = Some(Instant::now());
    first.close().unwrap();

    let released = returned.join().unwrap();
    let activated_at = activated_at.lock().unwrap().unwrap();
    assert!(released >= activated_at);
    assert_eq!(mux.pending(), 0);

    let mut wire = BytesMut::from(&outbound.take_all()[..]);
    let a = decode_header(&mut wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
    assert_eq!(a.frame_type, FrameType::Text);
    let _ = wire.split_to(a.payload_len as usize);
    let b = decode_header(&mut wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
    assert_eq!(b.frame_type, FrameType::Binary);
    assert_eq!(&wire[..], b"after");
}

#[test]
fn suspend_then_resume_while_inactive_leaves_transport_resumed() {
    let s = single(FrameType::Text, Some(1));
    s.frame.suspend_writes();
    s.frame.resume_writes();
    assert!(s.frame.is_write_resumed());
    assert!(!s.sink.is_write_resumed());

    s.activate();
    assert!(s.sink.is_write_resumed());
    let stats = s.sink.stats();
    assert_eq!(stats.suspend_calls, 0);
    assert_eq!(stats.resume_calls, 1);
}

#[test]
fn sized_text_frame_accepts_partial_payload() {
    let s = single(FrameType::Text, Some(100));
    assert_eq!(s.frame.write(&[]).unwrap(), 0);

    s.activate();
    let n = s.frame.write(&[b'a'; 40]).unwrap();
    assert!(n <= 40);
    assert_eq!(s.frame.payload_size(), Some(100));
}

#[test]
fn closing_never_activated_frame_skips_transport() {
    let s = single(FrameType::Text, Some(100));
    assert!(!s.frame.flush().unwrap());
    s.frame.close().unwrap();

    assert_eq!(s.sink.stats().write_calls, 0);
    assert_eq!(s.sink.stats().flush_calls, 0);
    assert_eq!(s.source.available(), 0);
    assert_eq!(s.owner.completions.load(Ordering::SeqCst), 1);
}

#[cfg(unix)]
mod socket {
    use std::sync::Arc;
    use std::time::Duration;

    use framux::frame::{FrameMultiplexer, SourceFrameChannel};
    use framux::transport::{SocketChannel, StreamSource};

    pub fn next(mux: &FrameMultiplexer, end: &SocketChannel) -> Arc<SourceFrameChannel> {
        loop {
            if let Some(frame) = mux.receive().unwrap() {
                return frame;
            }
            end.await_readable_timeout(Duration::from_millis(50)).unwrap();
        }
    }

    pub fn payload(frame: &SourceFrameChannel) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while !frame.is_complete() {
            let n = frame.read(&mut buf).unwrap();
            if n == 0 {
                frame.await_readable().unwrap();
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }
}

#[cfg(unix)]
#[test]
fn frames_cross_a_socket_pair() {
    use framux::transport::SocketChannel;
    use socket::{next, payload};

    let (client_end, server_end) = SocketChannel::pair().unwrap();
    let client = FrameMultiplexer::from_duplex(Arc::clone(&client_end), FrameConfig::client());
    let server = FrameMultiplexer::from_duplex(Arc::clone(&server_end), FrameConfig::server());

    let head = client.send(FrameType::Text, Some(3)).unwrap();
    head.set_final_fragment(false).unwrap();
    let tail = client.send(FrameType::Continuation, None).unwrap();
    let ping = client.send(FrameType::Ping, None).unwrap();
    tail.close().unwrap();
    ping.close().unwrap();

    head.write_all(b"abc").unwrap();
    head.close().unwrap();
    assert!(client.pump().unwrap());

    let first = next(&server, &server_end);
    assert_eq!(first.frame_type(), FrameType::Text);
    assert!(!first.is_final_fragment());
    assert_eq!(payload(&first), b"abc");
    first.close().unwrap();

    let second = next(&server, &server_end);
    assert_eq!(second.frame_type(), FrameType::Continuation);
    assert!(second.is_final_fragment());
    assert!(second.is_complete());
    second.close().unwrap();

    let third = next(&server, &server_end);
    assert_eq!(third.frame_type(), FrameType::Ping);
}
