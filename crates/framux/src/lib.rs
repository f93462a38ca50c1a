//! Activation-gated frame channels multiplexed over non-blocking transports.
//!
//! framux lets many WebSocket frames share one connection while only one of
//! them drives it at a time. Application code writes to a frame as if it were
//! the transport; the owning multiplexer decides when those writes go out.
//!
//! # Crate Structure
//!
//! - [`transport`]: Non-blocking transport contract, in-memory pipe, Unix sockets
//! - [`frame`]: Wire codec, sink/source frame channels, the multiplexer
//! - [`logging`]: `tracing` subscriber setup (behind the `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use framux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use framux_frame::*;
}

#[cfg(feature = "logging")]
pub mod logging;
