use std::time::Duration;

/// Channel configuration keys understood by transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOption {
    /// Send buffer size in bytes.
    SendBuffer,
    /// Receive buffer size in bytes.
    ReceiveBuffer,
    /// Upper bound applied to `await_writable` calls that carry no explicit timeout.
    WriteTimeout,
    /// Upper bound applied to `await_readable` calls that carry no explicit timeout.
    ReadTimeout,
}

/// Typed value for a [`ChannelOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Size(usize),
    Timeout(Option<Duration>),
}

impl OptionValue {
    /// The size carried by this value, if it is a size.
    pub fn as_size(self) -> Option<usize> {
        match self {
            OptionValue::Size(size) => Some(size),
            OptionValue::Timeout(_) => None,
        }
    }

    /// The timeout carried by this value, if it is a timeout.
    pub fn as_timeout(self) -> Option<Option<Duration>> {
        match self {
            OptionValue::Timeout(timeout) => Some(timeout),
            OptionValue::Size(_) => None,
        }
    }
}

impl ChannelOption {
    /// Validate that `value` has the shape this option expects.
    pub fn check(self, value: OptionValue) -> crate::Result<OptionValue> {
        let ok = match self {
            ChannelOption::SendBuffer | ChannelOption::ReceiveBuffer => {
                matches!(value, OptionValue::Size(size) if size > 0)
            }
            ChannelOption::WriteTimeout | ChannelOption::ReadTimeout => {
                matches!(value, OptionValue::Timeout(_))
            }
        };
        if ok {
            Ok(value)
        } else {
            Err(crate::TransportError::InvalidOptionValue {
                option: self,
                value,
            })
        }
    }
}
