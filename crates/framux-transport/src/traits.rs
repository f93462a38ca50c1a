use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::error::Result;
use crate::listener::ListenerSetter;
use crate::option::{ChannelOption, OptionValue};

/// Chunk size used by the default transfer implementations.
pub const TRANSFER_CHUNK_SIZE: usize = 16 * 1024;

/// A boxed unit of work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs tasks: a worker pool or a channel's I/O thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Behaviour shared by both halves of a transport connection.
pub trait Channel: Send + Sync {
    /// `false` once the channel has been closed locally.
    fn is_open(&self) -> bool;

    /// Close the channel. Repeated calls are no-ops.
    fn close(&self) -> Result<()>;

    fn supports_option(&self, option: ChannelOption) -> bool;

    /// Current value of `option`, or `None` when unsupported.
    fn get_option(&self, option: ChannelOption) -> Result<Option<OptionValue>>;

    /// Set `option`, returning the previous value.
    fn set_option(&self, option: ChannelOption, value: OptionValue) -> Result<Option<OptionValue>>;

    /// Listener fired once when the channel closes.
    fn close_setter(&self) -> &ListenerSetter<dyn Channel>;

    /// Worker pool this channel belongs to, if any.
    fn worker(&self) -> Option<Arc<dyn Executor>> {
        None
    }
}

/// The write half of a non-blocking byte transport.
///
/// Writes never block: a short or zero-length result means "try again
/// later". Callers either register a write listener and resume writes, or
/// park on [`StreamSink::await_writable`].
pub trait StreamSink: Channel {
    /// Write as many bytes of `src` as the transport accepts right now.
    fn write(&self, src: &[u8]) -> Result<usize>;

    /// Gathering write. Stops at the first buffer the transport only
    /// partially accepts.
    fn write_vectored(&self, srcs: &[IoSlice<'_>]) -> Result<usize> {
        let mut total = 0usize;
        for src in srcs {
            if src.is_empty() {
                continue;
            }
            let n = self.write(src)?;
            total += n;
            if n < src.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Copy up to `count` bytes of `file`, starting at `position`, into this
    /// sink. The file's cursor is not moved. Returns the bytes written.
    fn transfer_from_file(&self, file: &File, position: u64, count: u64) -> Result<u64> {
        let len = count.min(TRANSFER_CHUNK_SIZE as u64) as usize;
        if len == 0 {
            return Ok(0);
        }
        let mut buf = vec![0u8; len];
        let read = read_at(file, &mut buf, position)?;
        if read == 0 {
            return Ok(0);
        }
        Ok(self.write(&buf[..read])? as u64)
    }

    /// Move up to `count` bytes from `source` into this sink via `through`.
    ///
    /// `through` is cleared on entry. Bytes read from `source` but not
    /// accepted by this sink are left in `through` for the caller to write
    /// later. Returns the bytes written to this sink.
    fn transfer_from_source(
        &self,
        source: &dyn StreamSource,
        count: u64,
        through: &mut BytesMut,
    ) -> Result<u64> {
        through.clear();
        let want = count.min(through.capacity().max(TRANSFER_CHUNK_SIZE) as u64) as usize;
        if want == 0 {
            return Ok(0);
        }
        through.resize(want, 0);
        let read = match source.read(&mut through[..]) {
            Ok(read) => read,
            Err(err) => {
                through.clear();
                return Err(err);
            }
        };
        through.truncate(read);
        if read == 0 {
            return Ok(0);
        }
        let written = self.write(&through[..])?;
        through.advance(written);
        Ok(written as u64)
    }

    /// Push buffered bytes to the peer. `Ok(true)` when nothing is left.
    fn flush(&self) -> Result<bool>;

    /// Signal end of output to the peer.
    fn shutdown_writes(&self) -> Result<()>;

    fn suspend_writes(&self);

    fn resume_writes(&self);

    fn is_write_resumed(&self) -> bool;

    /// Resume writes and fire the write listener right away.
    fn wakeup_writes(&self);

    /// Block until the sink is writable or closed.
    fn await_writable(&self) -> Result<()>;

    /// Block until the sink is writable, closed, or `timeout` elapses.
    fn await_writable_timeout(&self, timeout: Duration) -> Result<()>;

    /// Listener fired when the sink becomes writable while writes are resumed.
    fn write_setter(&self) -> &ListenerSetter<dyn StreamSink>;

    /// Executor bound to this sink's I/O thread, if any.
    fn write_thread(&self) -> Option<Arc<dyn Executor>> {
        None
    }
}

/// The read half of a non-blocking byte transport.
///
/// `read` returns `Ok(0)` when no data is available yet and
/// [`TransportError::EndOfStream`](crate::TransportError::EndOfStream) once
/// the peer has shut down its output and everything was consumed.
pub trait StreamSource: Channel {
    fn read(&self, dst: &mut [u8]) -> Result<usize>;

    /// Scattering read. Stops at the first buffer only partially filled.
    fn read_vectored(&self, dsts: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let mut total = 0usize;
        for dst in dsts.iter_mut() {
            if dst.is_empty() {
                continue;
            }
            let len = dst.len();
            let n = match self.read(dst) {
                Ok(n) => n,
                Err(err) if total > 0 => {
                    tracing::trace!(%err, "deferring read error after partial scatter");
                    break;
                }
                Err(err) => return Err(err),
            };
            total += n;
            if n < len {
                break;
            }
        }
        Ok(total)
    }

    /// Copy up to `count` bytes from this source into `file` at `position`.
    /// Returns the bytes read from this source.
    fn transfer_to_file(&self, file: &File, position: u64, count: u64) -> Result<u64> {
        let len = count.min(TRANSFER_CHUNK_SIZE as u64) as usize;
        if len == 0 {
            return Ok(0);
        }
        let mut buf = vec![0u8; len];
        let read = self.read(&mut buf)?;
        if read > 0 {
            write_all_at(file, &buf[..read], position)?;
        }
        Ok(read as u64)
    }

    /// Move up to `count` bytes from this source into `sink` via `through`.
    ///
    /// Returns the bytes read from this source; whatever `sink` did not
    /// accept stays in `through`.
    fn transfer_to_sink(
        &self,
        count: u64,
        through: &mut BytesMut,
        sink: &dyn StreamSink,
    ) -> Result<u64> {
        through.clear();
        let want = count.min(through.capacity().max(TRANSFER_CHUNK_SIZE) as u64) as usize;
        if want == 0 {
            return Ok(0);
        }
        through.resize(want, 0);
        let read = match self.read(&mut through[..]) {
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

    /// Stop accepting input. Further reads report end of stream.
    fn shutdown_reads(&self) -> Result<()>;

    fn suspend_reads(&self);

    fn resume_reads(&self);

    fn is_read_resumed(&self) -> bool;

    /// Resume reads and fire the read listener right away.
    fn wakeup_reads(&self);

    fn await_readable(&self) -> Result<()>;

    fn await_readable_timeout(&self, timeout: Duration) -> Result<()>;

    fn read_setter(&self) -> &ListenerSetter<dyn StreamSource>;

    fn read_thread(&self) -> Option<Arc<dyn Executor>> {
        None
    }
}

/// Positional read that leaves the file cursor alone on unix.
#[cfg(unix)]
pub fn read_at(file: &File, buf: &mut [u8], position: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    loop {
        match file.read_at(buf, position) {
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(not(unix))]
pub fn read_at(file: &File, buf: &mut [u8], position: u64) -> std::io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(position))?;
    file.read(buf)
}

#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], position: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, position)
}

#[cfg(not(unix))]
pub fn write_all_at(file: &File, buf: &[u8], position: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    file.seek(SeekFrom::Start(position))?;
    file.write_all(buf)
}
