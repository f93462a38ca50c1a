use std::path::PathBuf;

/// Errors that can occur in transport channel operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel was closed locally or by the peer.
    #[error("transport channel closed")]
    Closed,

    /// The peer shut down its write side; no more bytes will arrive.
    #[error("end of stream")]
    EndOfStream,

    /// The option is not supported by this channel.
    #[error("option {0:?} not supported")]
    UnsupportedOption(crate::ChannelOption),

    /// The option value has the wrong shape for the option.
    #[error("invalid value for option {option:?}: {value:?}")]
    InvalidOptionValue {
        option: crate::ChannelOption,
        value: crate::OptionValue,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
