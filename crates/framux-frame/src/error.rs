use framux_transport::TransportError;

/// Errors raised by frame channels, the codec, and the multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame channel (or its transport) is already closed.
    #[error("frame channel closed")]
    Closed,

    /// Frame metadata was changed after the first byte went out.
    #[error("invalid frame state: {0}")]
    InvalidState(&'static str),

    /// The underlying transport failed; passed through unchanged.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A file or buffer operation outside the transport failed.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fixed-size frame was closed before its declared payload was written.
    #[error("frame closed with {remaining} of {declared} payload bytes unwritten")]
    IncompleteFrame { declared: u64, remaining: u64 },

    /// Control frame payloads are capped at 125 bytes.
    #[error("control frame payload too large ({size} bytes, max 125)")]
    ControlFrameTooLarge { size: u64 },

    /// The payload exceeds the declared or configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    /// Close frame carried a status code that may not appear on the wire.
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    /// RSV value does not fit in the three reserved header bits.
    #[error("rsv bits out of range: {0:#x}")]
    InvalidRsv(u8),

    /// Inbound bytes broke the framing rules.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;
