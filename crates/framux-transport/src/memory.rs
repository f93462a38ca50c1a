//! Bounded in-memory transport.
//!
//! [`pipe`] returns a connected sink/source pair sharing one byte queue of
//! fixed capacity. A full queue makes writes short (or zero), which gives
//! callers real non-blocking backpressure without a socket.
//!
//! Readiness is reported without an I/O thread: the sink's write listener
//! fires when the reader frees space while writes are resumed, and the
//! source's read listener fires when the writer adds bytes while reads are
//! resumed. Listeners run on the thread that caused the change.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::listener::ListenerSetter;
use crate::option::{ChannelOption, OptionValue};
use crate::traits::{Channel, Executor, StreamSink, StreamSource};

/// Default pipe capacity: 64 KiB.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Configuration for an in-memory pipe.
#[derive(Clone)]
pub struct PipeConfig {
    /// Maximum number of unread bytes held by the pipe.
    pub capacity: usize,
    /// Default bound for `await_writable`.
    pub write_timeout: Option<Duration>,
    /// Default bound for `await_readable`.
    pub read_timeout: Option<Duration>,
    /// Executor reported by `worker()` on both ends.
    pub worker: Option<Arc<dyn Executor>>,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_PIPE_CAPACITY,
            write_timeout: None,
            read_timeout: None,
            worker: None,
        }
    }
}

impl std::fmt::Debug for PipeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConfig")
            .field("capacity", &self.capacity)
            .field("write_timeout", &self.write_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

/// Counters describing the traffic a [`MemorySink`] has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Total bytes accepted by the sink.
    pub bytes_written: u64,
    /// Number of write calls that reached the queue (including zero-length results).
    pub write_calls: u64,
    /// Number of flush calls.
    pub flush_calls: u64,
    /// Number of `suspend_writes` calls.
    pub suspend_calls: u64,
    /// Number of `resume_writes` calls.
    pub resume_calls: u64,
}

struct PipeState {
    queue: VecDeque<u8>,
    capacity: usize,
    sink_closed: bool,
    writes_shutdown: bool,
    source_closed: bool,
    write_resumed: bool,
    read_resumed: bool,
    write_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    stats: PipeStats,
}

impl PipeState {
    fn space(&self) -> usize {
        self.capacity.saturating_sub(self.queue.len())
    }

    fn writable(&self) -> bool {
        self.space() > 0 || self.sink_closed || self.source_closed
    }

    fn readable(&self) -> bool {
        !self.queue.is_empty() || self.writes_shutdown || self.source_closed
    }
}

struct PipeShared {
    state: Mutex<PipeState>,
    writable: Condvar,
    readable: Condvar,
    sink: OnceLock<Weak<MemorySink>>,
    source: OnceLock<Weak<MemorySource>>,
    worker: Option<Arc<dyn Executor>>,
}

impl PipeShared {
    fn fire_write_listener(&self) {
        if let Some(sink) = self.sink.get().and_then(Weak::upgrade) {
            sink.write_setter.invoke(&*sink as &dyn StreamSink);
        }
    }

    fn fire_read_listener(&self) {
        if let Some(source) = self.source.get().and_then(Weak::upgrade) {
            source.read_setter.invoke(&*source as &dyn StreamSource);
        }
    }
}

/// Create a connected in-memory sink/source pair with default configuration.
pub fn pipe() -> (Arc<MemorySink>, Arc<MemorySource>) {
    pipe_with_config(PipeConfig::default())
}

/// Create a connected in-memory sink/source pair.
pub fn pipe_with_config(config: PipeConfig) -> (Arc<MemorySink>, Arc<MemorySource>) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            queue: VecDeque::with_capacity(config.capacity.min(DEFAULT_PIPE_CAPACITY)),
            capacity: config.capacity,
            sink_closed: false,
            writes_shutdown: false,
            source_closed: false,
            write_resumed: false,
            read_resumed: false,
            write_timeout: config.write_timeout,
            read_timeout: config.read_timeout,
            stats: PipeStats::default(),
        }),
        writable: Condvar::new(),
        readable: Condvar::new(),
        sink: OnceLock::new(),
        source: OnceLock::new(),
        worker: config.worker,
    });

    let sink = Arc::new(MemorySink {
        shared: Arc::clone(&shared),
        write_setter: ListenerSetter::new(),
        close_setter: ListenerSetter::new(),
    });
    let source = Arc::new(MemorySource {
        shared: Arc::clone(&shared),
        read_setter: ListenerSetter::new(),
        close_setter: ListenerSetter::new(),
    });
    let _ = shared.sink.set(Arc::downgrade(&sink));
    let _ = shared.source.set(Arc::downgrade(&source));
    (sink, source)
}

/// Write half of an in-memory pipe.
pub struct MemorySink {
    shared: Arc<PipeShared>,
    write_setter: ListenerSetter<dyn StreamSink>,
    close_setter: ListenerSetter<dyn Channel>,
}

/// Read half of an in-memory pipe.
pub struct MemorySource {
    shared: Arc<PipeShared>,
    read_setter: ListenerSetter<dyn StreamSource>,
    close_setter: ListenerSetter<dyn Channel>,
}

impl MemorySink {
    /// Traffic counters.
    pub fn stats(&self) -> PipeStats {
        self.shared.state.lock().stats
    }

    /// Free space in the pipe.
    pub fn space(&self) -> usize {
        self.shared.state.lock().space()
    }
}

impl MemorySource {
    /// Unread bytes currently queued.
    pub fn available(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Drain and return everything currently queued.
    pub fn take_all(&self) -> Vec<u8> {
        let drained: Vec<u8> = {
            let mut state = self.shared.state.lock();
            state.queue.drain(..).collect()
        };
        if !drained.is_empty() {
            self.after_consume();
        }
        drained
    }

    fn after_consume(&self) {
        self.shared.writable.notify_all();
        let resumed = self.shared.state.lock().write_resumed;
        if resumed {
            self.shared.fire_write_listener();
        }
    }
}

fn wait_until(
    condvar: &Condvar,
    state: &mut parking_lot::MutexGuard<'_, PipeState>,
    ready: fn(&PipeState) -> bool,
    timeout: Option<Duration>,
) {
    let deadline = timeout.map(|t| Instant::now() + t);
    while !ready(state) {
        match deadline {
            Some(deadline) => {
                if condvar.wait_until(state, deadline).timed_out() {
                    return;
                }
            }
            None => condvar.wait(state),
        }
    }
}

fn get_pipe_option(state: &PipeState, option: ChannelOption) -> Option<OptionValue> {
    match option {
        ChannelOption::SendBuffer | ChannelOption::ReceiveBuffer => {
            Some(OptionValue::Size(state.capacity))
        }
        ChannelOption::WriteTimeout => Some(OptionValue::Timeout(state.write_timeout)),
        ChannelOption::ReadTimeout => Some(OptionValue::Timeout(state.read_timeout)),
    }
}

fn set_pipe_option(
    shared: &PipeShared,
    option: ChannelOption,
    value: OptionValue,
) -> Result<Option<OptionValue>> {
    let value = option.check(value)?;
    let mut state = shared.state.lock();
    let previous = get_pipe_option(&state, option);
    match (option, value) {
        (ChannelOption::SendBuffer | ChannelOption::ReceiveBuffer, OptionValue::Size(size)) => {
            state.capacity = size;
            drop(state);
            shared.writable.notify_all();
        }
        (ChannelOption::WriteTimeout, OptionValue::Timeout(timeout)) => {
            state.write_timeout = timeout
        }
        (ChannelOption::ReadTimeout, OptionValue::Timeout(timeout)) => {
            state.read_timeout = timeout
        }
        _ => return Err(TransportError::InvalidOptionValue { option, value }),
    }
    Ok(previous)
}

impl Channel for MemorySink {
    fn is_open(&self) -> bool {
        !self.shared.state.lock().sink_closed
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.sink_closed {
                return Ok(());
            }
            state.sink_closed = true;
            state.writes_shutdown = true;
        }
        debug!("memory sink closed");
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
        self.close_setter.invoke(self as &dyn Channel);
        Ok(())
    }

    fn supports_option(&self, _option: ChannelOption) -> bool {
        true
    }

    fn get_option(&self, option: ChannelOption) -> Result<Option<OptionValue>> {
        Ok(get_pipe_option(&self.shared.state.lock(), option))
    }

    fn set_option(&self, option: ChannelOption, value: OptionValue) -> Result<Option<OptionValue>> {
        set_pipe_option(&self.shared, option, value)
    }

    fn close_setter(&self) -> &ListenerSetter<dyn Channel> {
        &self.close_setter
    }

    fn worker(&self) -> Option<Arc<dyn Executor>> {
        self.shared.worker.clone()
    }
}

impl StreamSink for MemorySink {
    fn write(&self, src: &[u8]) -> Result<usize> {
        let (n, read_resumed) = {
            let mut state = self.shared.state.lock();
            if state.sink_closed || state.source_closed {
                return Err(TransportError::Closed);
            }
            if state.writes_shutdown {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "writes shut down",
                )));
            }
            let n = state.space().min(src.len());
            state.queue.extend(&src[..n]);
            state.stats.write_calls += 1;
            state.stats.bytes_written += n as u64;
            (n, state.read_resumed)
        };
        if n > 0 {
            self.shared.readable.notify_all();
            if read_resumed {
                self.shared.fire_read_listener();
            }
        }
        Ok(n)
    }

    fn flush(&self) -> Result<bool> {
        let mut state = self.shared.state.lock();
        if state.sink_closed {
            return Err(TransportError::Closed);
        }
        state.stats.flush_calls += 1;
        Ok(true)
    }

    fn shutdown_writes(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.writes_shutdown {
                return Ok(());
            }
            state.writes_shutdown = true;
        }
        self.shared.readable.notify_all();
        let read_resumed = self.shared.state.lock().read_resumed;
        if read_resumed {
            self.shared.fire_read_listener();
        }
        Ok(())
    }

    fn suspend_writes(&self) {
        let mut state = self.shared.state.lock();
        state.write_resumed = false;
        state.stats.suspend_calls += 1;
    }

    fn resume_writes(&self) {
        let mut state = self.shared.state.lock();
        state.write_resumed = true;
        state.stats.resume_calls += 1;
    }

    fn is_write_resumed(&self) -> bool {
        self.shared.state.lock().write_resumed
    }

    fn wakeup_writes(&self) {
        self.shared.state.lock().write_resumed = true;
        self.write_setter.invoke(self as &dyn StreamSink);
    }

    fn await_writable(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let timeout = state.write_timeout;
        wait_until(&self.shared.writable, &mut state, PipeState::writable, timeout);
        Ok(())
    }

    fn await_writable_timeout(&self, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.lock();
        wait_until(
            &self.shared.writable,
            &mut state,
            PipeState::writable,
            Some(timeout),
        );
        Ok(())
    }

    fn write_setter(&self) -> &ListenerSetter<dyn StreamSink> {
        &self.write_setter
    }
}

impl Channel for MemorySource {
    fn is_open(&self) -> bool {
        !self.shared.state.lock().source_closed
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.source_closed {
                return Ok(());
            }
            state.source_closed = true;
            state.queue.clear();
        }
        debug!("memory source closed");
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
        self.close_setter.invoke(self as &dyn Channel);
        Ok(())
    }

    fn supports_option(&self, _option: ChannelOption) -> bool {
        true
    }

    fn get_option(&self, option: ChannelOption) -> Result<Option<OptionValue>> {
        Ok(get_pipe_option(&self.shared.state.lock(), option))
    }

    fn set_option(&self, option: ChannelOption, value: OptionValue) -> Result<Option<OptionValue>> {
        set_pipe_option(&self.shared, option, value)
    }

    fn close_setter(&self) -> &ListenerSetter<dyn Channel> {
        &self.close_setter
    }

    fn worker(&self) -> Option<Arc<dyn Executor>> {
        self.shared.worker.clone()
    }
}

impl StreamSource for MemorySource {
    fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let n = {
            let mut state = self.shared.state.lock();
            if state.source_closed {
                return Err(TransportError::Closed);
            }
            if state.queue.is_empty() {
                if state.writes_shutdown {
                    return Err(TransportError::EndOfStream);
                }
                return Ok(0);
            }
            let n = state.queue.len().min(dst.len());
            for (slot, byte) in dst.iter_mut().zip(state.queue.drain(..n)) {
                *slot = byte;
            }
            n
        };
        if n > 0 {
            self.after_consume();
        }
        Ok(n)
    }

    fn shutdown_reads(&self) -> Result<()> {
        self.close()
    }

    fn suspend_reads(&self) {
        self.shared.state.lock().read_resumed = false;
    }

    fn resume_reads(&self) {
        self.shared.state.lock().read_resumed = true;
    }

    fn is_read_resumed(&self) -> bool {
        self.shared.state.lock().read_resumed
    }

    fn wakeup_reads(&self) {
        self.shared.state.lock().read_resumed = true;
        self.read_setter.invoke(self as &dyn StreamSource);
    }

    fn await_readable(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let timeout = state.read_timeout;
        wait_until(&self.shared.readable, &mut state, PipeState::readable, timeout);
        Ok(())
    }

    fn await_readable_timeout(&self, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.lock();
        wait_until(
            &self.shared.readable,
            &mut state,
            PipeState::readable,
            Some(timeout),
        );
        Ok(())
    }

    fn read_setter(&self) -> &ListenerSetter<dyn StreamSource> {
        &self.read_setter
    }
}
