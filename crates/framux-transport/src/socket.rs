use std::io::{ErrorKind, IoSlice, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::listener::ListenerSetter;
use crate::option::{ChannelOption, OptionValue};
use crate::traits::{Channel, StreamSink, StreamSource};

/// Non-blocking Unix domain socket transport.
///
/// Implements both [`StreamSink`] and [`StreamSource`] over one connected
/// stream. Blocking waits use `poll(2)`. There is no I/O thread: readiness
/// listeners fire from [`SocketChannel::dispatch_ready`], which the owner of
/// the connection calls from its own loop.
pub struct SocketChannel {
    stream: UnixStream,
    closed: AtomicBool,
    writes_shutdown: AtomicBool,
    reads_shutdown: AtomicBool,
    write_resumed: AtomicBool,
    read_resumed: AtomicBool,
    timeouts: Mutex<Timeouts>,
    write_setter: ListenerSetter<dyn StreamSink>,
    read_setter: ListenerSetter<dyn StreamSource>,
    close_setter: ListenerSetter<dyn Channel>,
}

#[derive(Default, Clone, Copy)]
struct Timeouts {
    write: Option<Duration>,
    read: Option<Duration>,
}

impl SocketChannel {
    /// Wrap a connected stream, switching it to non-blocking mode.
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            closed: AtomicBool::new(false),
            writes_shutdown: AtomicBool::new(false),
            reads_shutdown: AtomicBool::new(false),
            write_resumed: AtomicBool::new(false),
            read_resumed: AtomicBool::new(false),
            timeouts: Mutex::new(Timeouts::default()),
            write_setter: ListenerSetter::new(),
            read_setter: ListenerSetter::new(),
            close_setter: ListenerSetter::new(),
        })
    }

    /// Connect to a listening Unix domain socket.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Self::from_stream(stream)
    }

    /// A connected pair of channels, mostly useful in tests.
    pub fn pair() -> Result<(Arc<Self>, Arc<Self>)> {
        let (left, right) = UnixStream::pair()?;
        Ok((
            Arc::new(Self::from_stream(left)?),
            Arc::new(Self::from_stream(right)?),
        ))
    }

    /// Wait up to `timeout` for the readiness the caller resumed, then fire
    /// the matching listeners.
    ///
    /// Returns the number of listeners invoked. With neither reads nor writes
    /// resumed this returns `Ok(0)` immediately.
    pub fn dispatch_ready(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut events: libc::c_short = 0;
        if self.write_resumed.load(Ordering::Acquire) {
            events |= libc::POLLOUT;
        }
        if self.read_resumed.load(Ordering::Acquire) {
            events |= libc::POLLIN;
        }
        if events == 0 || !self.is_open() {
            return Ok(0);
        }

        let revents = poll_fd(self.stream.as_raw_fd(), events, timeout)?;
        let mut fired = 0;
        if revents & (libc::POLLOUT | libc::POLLERR) != 0
            && self.write_resumed.load(Ordering::Acquire)
            && self.write_setter.invoke(self as &dyn StreamSink)
        {
            fired += 1;
        }
        if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
            && self.read_resumed.load(Ordering::Acquire)
            && self.read_setter.invoke(self as &dyn StreamSource)
        {
            fired += 1;
        }
        trace!(revents, fired, "dispatched socket readiness");
        Ok(fired)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn wait_for(&self, events: libc::c_short, timeout: Option<Duration>) -> Result<()> {
        self.check_open()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let revents = poll_fd(self.stream.as_raw_fd(), events, remaining)?;
            // EINTR or a timeout both surface as zero revents; only loop on EINTR
            // while time remains.
            if revents != 0 || remaining == Some(Duration::ZERO) {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(());
                }
            }
        }
    }
}

/// `poll(2)` a single descriptor. Returns the reported events; zero on timeout
/// or when interrupted by a signal.
fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> Result<libc::c_short> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms: libc::c_int = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    // SAFETY: `pfd` is a valid pollfd for the duration of the call and nfds is 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err.into());
    }
    Ok(pfd.revents)
}

fn sockopt_name(option: ChannelOption) -> Option<libc::c_int> {
    match option {
        ChannelOption::SendBuffer => Some(libc::SO_SNDBUF),
        ChannelOption::ReceiveBuffer => Some(libc::SO_RCVBUF),
        ChannelOption::WriteTimeout | ChannelOption::ReadTimeout => None,
    }
}

fn get_buffer_size(fd: RawFd, name: libc::c_int) -> Result<usize> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `len` are valid writable pointers sized for a c_int.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(value.max(0) as usize)
}

fn set_buffer_size(fd: RawFd, name: libc::c_int, size: usize) -> Result<()> {
    let value = size.min(libc::c_int::MAX as usize) as libc::c_int;
    // SAFETY: `value` is a valid c_int and the length matches its size.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            (&value as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

impl Channel for SocketChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotConnected => {}
            Err(err) => return Err(err.into()),
        }
        debug!("socket channel closed");
        self.close_setter.invoke(self as &dyn Channel);
        Ok(())
    }

    fn supports_option(&self, _option: ChannelOption) -> bool {
        true
    }

    fn get_option(&self, option: ChannelOption) -> Result<Option<OptionValue>> {
        if let Some(name) = sockopt_name(option) {
            let size = get_buffer_size(self.stream.as_raw_fd(), name)?;
            return Ok(Some(OptionValue::Size(size)));
        }
        let timeouts = *self.timeouts.lock();
        Ok(match option {
            ChannelOption::WriteTimeout => Some(OptionValue::Timeout(timeouts.write)),
            ChannelOption::ReadTimeout => Some(OptionValue::Timeout(timeouts.read)),
            ChannelOption::SendBuffer | ChannelOption::ReceiveBuffer => None,
        })
    }

    fn set_option(&self, option: ChannelOption, value: OptionValue) -> Result<Option<OptionValue>> {
        let value = option.check(value)?;
        let previous = self.get_option(option)?;
        match (sockopt_name(option), value) {
            (Some(name), OptionValue::Size(size)) => {
                set_buffer_size(self.stream.as_raw_fd(), name, size)?
            }
            (None, OptionValue::Timeout(timeout)) => {
                let mut timeouts = self.timeouts.lock();
                if option == ChannelOption::WriteTimeout {
                    timeouts.write = timeout;
                } else {
                    timeouts.read = timeout;
                }
            }
            _ => return Err(TransportError::InvalidOptionValue { option, value }),
        }
        Ok(previous)
    }

    fn close_setter(&self) -> &ListenerSetter<dyn Channel> {
        &self.close_setter
    }
}

impl StreamSink for SocketChannel {
    fn write(&self, src: &[u8]) -> Result<usize> {
        self.check_open()?;
        match (&self.stream).write(src) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write_vectored(&self, srcs: &[IoSlice<'_>]) -> Result<usize> {
        self.check_open()?;
        match (&self.stream).write_vectored(srcs) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&self) -> Result<bool> {
        self.check_open()?;
        Ok(true)
    }

    fn shutdown_writes(&self) -> Result<()> {
        if self.writes_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn suspend_writes(&self) {
        self.write_resumed.store(false, Ordering::Release);
    }

    fn resume_writes(&self) {
        self.write_resumed.store(true, Ordering::Release);
    }

    fn is_write_resumed(&self) -> bool {
        self.write_resumed.load(Ordering::Acquire)
    }

    fn wakeup_writes(&self) {
        self.resume_writes();
        self.write_setter.invoke(self as &dyn StreamSink);
    }

    fn await_writable(&self) -> Result<()> {
        let timeout = self.timeouts.lock().write;
        self.wait_for(libc::POLLOUT, timeout)
    }

    fn await_writable_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait_for(libc::POLLOUT, Some(timeout))
    }

    fn write_setter(&self) -> &ListenerSetter<dyn StreamSink> {
        &self.write_setter
    }
}

impl StreamSource for SocketChannel {
    fn read(&self, dst: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if dst.is_empty() {
            return Ok(0);
        }
        if self.reads_shutdown.load(Ordering::Acquire) {
            return Err(TransportError::EndOfStream);
        }
        match (&self.stream).read(dst) {
            Ok(0) => Err(TransportError::EndOfStream),
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn shutdown_reads(&self) -> Result<()> {
        if self.reads_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Read) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn suspend_reads(&self) {
        self.read_resumed.store(false, Ordering::Release);
    }

    fn resume_reads(&self) {
        self.read_resumed.store(true, Ordering::Release);
    }

    fn is_read_resumed(&self) -> bool {
        self.read_resumed.load(Ordering::Acquire)
    }

    fn wakeup_reads(&self) {
        self.resume_reads();
        self.read_setter.invoke(self as &dyn StreamSource);
    }

    fn await_readable(&self) -> Result<()> {
        let timeout = self.timeouts.lock().read;
        self.wait_for(libc::POLLIN, timeout)
    }

    fn await_readable_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait_for(libc::POLLIN, Some(timeout))
    }

    fn read_setter(&self) -> &ListenerSetter<dyn StreamSource> {
        &self.read_setter
    }
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("type", &"unix")
            .field("open", &self.is_open())
            .finish()
    }
}
