//! Non-blocking transport channel abstraction.
//!
//! Defines the contract every framing layer in framux drives:
//! - [`StreamSink`] / [`StreamSource`]: non-blocking byte halves with
//!   suspend/resume readiness, blocking waits, and event listeners
//! - [`Channel`]: open/close state and typed options shared by both halves
//!
//! Two implementations ship with the crate: a bounded in-memory [`memory::pipe`]
//! and a Unix domain [`SocketChannel`].
//!
//! This is the lowest layer of framux. Everything else builds on top of
//! the traits provided here.

pub mod error;
pub mod listener;
pub mod memory;
pub mod option;
pub mod traits;

#[cfg(unix)]
pub mod socket;

pub use error::{Result, TransportError};
pub use listener::{invoke_listener, ChannelListener, ListenerSetter};
pub use memory::{pipe, pipe_with_config, MemorySink, MemorySource, PipeConfig, PipeStats};
pub use option::{ChannelOption, OptionValue};
pub use traits::{
    read_at, write_all_at, Channel, Executor, StreamSink, StreamSource, Task, TRANSFER_CHUNK_SIZE,
};

#[cfg(unix)]
pub use socket::SocketChannel;
