//! Activation-gated frame channels over a shared non-blocking transport.
//!
//! One connection carries many WebSocket frames, but only one outbound and
//! one inbound frame may drive the transport at a time:
//! - [`SinkFrameChannel`] writes one outbound frame. Until its owner
//!   activates it, writes return `Ok(0)` and blocking waits park.
//! - [`SourceFrameChannel`] reads the payload of one inbound frame.
//! - [`FrameMultiplexer`] is the owner: it activates outbound frames in
//!   creation order and decodes inbound headers.
//!
//! Custom owners plug in through the [`FrameOwner`] trait.

pub mod codec;
pub mod descriptor;
mod encoder;
pub mod error;
mod gate;
pub mod mux;
pub mod owner;
pub mod sink;
pub mod source;

pub use codec::{
    apply_mask, decode_header, encode_close_payload, encode_header, header_len,
    is_valid_close_code, validate_close_payload, FrameConfig, FrameHeader, FrameType, Role,
    DEFAULT_MAX_PAYLOAD, DEFAULT_TRANSFER_CHUNK, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE,
};
pub use descriptor::FrameDescriptor;
pub use error::{FrameError, Result};
pub use mux::FrameMultiplexer;
pub use owner::{FrameId, FrameOwner, OwnerHandle};
pub use sink::{SinkActivator, SinkFrameChannel};
pub use source::{SourceActivator, SourceFrameChannel};
