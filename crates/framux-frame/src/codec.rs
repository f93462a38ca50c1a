use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Largest possible header: 2 fixed + 8 extended length + 4 mask bytes.
pub const MAX_HEADER_SIZE: usize = 14;

/// Control frame payloads may not exceed this many bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Default chunk size used when a transfer has to pass through a buffer.
pub const DEFAULT_TRANSFER_CHUNK: usize = 16 * 1024;

const FIN_BIT: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl FrameType {
    pub fn opcode(self) -> u8 {
        match self {
            FrameType::Continuation => 0x0,
            FrameType::Text => 0x1,
            FrameType::Binary => 0x2,
            FrameType::Close => 0x8,
            FrameType::Ping => 0x9,
            FrameType::Pong => 0xA,
        }
    }

    /// Map a wire opcode back to a frame type. Reserved opcodes yield `None`.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x0 => Some(FrameType::Continuation),
            0x1 => Some(FrameType::Text),
            0x2 => Some(FrameType::Binary),
            0x8 => Some(FrameType::Close),
            0x9 => Some(FrameType::Ping),
            0xA => Some(FrameType::Pong),
            _ => None,
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, FrameType::Close | FrameType::Ping | FrameType::Pong)
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::Continuation => "CONTINUATION",
            FrameType::Text => "TEXT",
            FrameType::Binary => "BINARY",
            FrameType::Close => "CLOSE",
            FrameType::Ping => "PING",
            FrameType::Pong => "PONG",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end of the connection this side plays.
///
/// Clients mask every outbound frame and expect unmasked inbound frames;
/// servers do the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Client,
    #[default]
    Server,
}

impl Role {
    pub fn masks_outbound(self) -> bool {
        self == Role::Client
    }
}

/// A decoded (or to-be-encoded) frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv: u8,
    pub frame_type: FrameType,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Wire size of this header.
    pub fn encoded_len(&self) -> usize {
        let ext = if self.payload_len < LEN_16 as u64 {
            0
        } else if self.payload_len <= u16::MAX as u64 {
            2
        } else {
            8
        };
        let mask = if self.mask.is_some() { 4 } else { 0 };
        2 + ext + mask
    }
}

/// Encode a frame header into the wire format.
///
/// Wire format:
/// ```text
/// ┌───┬──────┬────────┬───┬─────────┬────────────────┬──────────────┐
/// │FIN│ RSV  │ Opcode │ M │ Len (7) │ Ext len (0/2/8)│ Mask key (0/4)│
/// │1b │ 3b   │ 4b     │1b │         │ big-endian     │              │
/// └───┴──────┴────────┴───┴─────────┴────────────────┴──────────────┘
/// ```
pub fn encode_header(header: &FrameHeader, dst: &mut BytesMut) -> Result<()> {
    if header.rsv > 0x7 {
        return Err(FrameError::InvalidRsv(header.rsv));
    }
    if header.frame_type.is_control() {
        if !header.fin {
            return Err(FrameError::InvalidState(
                "control frames cannot be fragmented",
            ));
        }
        if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLarge {
                size: header.payload_len,
            });
        }
    }

    dst.reserve(header.encoded_len());
    let mut b0 = (header.rsv << 4) | header.frame_type.opcode();
    if header.fin {
        b0 |= FIN_BIT;
    }
    dst.put_u8(b0);

    let mask_bit = if header.mask.is_some() { MASK_BIT } else { 0 };
    let len = header.payload_len;
    if len < LEN_16 as u64 {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as u64 {
        dst.put_u8(mask_bit | LEN_16);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | LEN_64);
        dst.put_u64(len);
    }

    if let Some(key) = header.mask {
        dst.put_slice(&key);
    }
    Ok(())
}

/// Total header length implied by the first two header bytes.
pub fn header_len(first_two: [u8; 2]) -> usize {
    let ext = match first_two[1] & LEN_MASK {
        LEN_16 => 2,
        LEN_64 => 8,
        _ => 0,
    };
    let mask = if first_two[1] & MASK_BIT != 0 { 4 } else { 0 };
    2 + ext + mask
}

/// Decode a frame header from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete header yet.
/// On success, consumes exactly the header bytes; payload bytes are left in
/// place.
pub fn decode_header(src: &mut BytesMut, max_payload: u64) -> Result<Option<FrameHeader>> {
    if src.len() < 2 {
        return Ok(None); // Need more data
    }
    let total = header_len([src[0], src[1]]);
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let b0 = src.get_u8();
    let b1 = src.get_u8();
    let opcode = b0 & OPCODE_MASK;
    let frame_type = FrameType::from_opcode(opcode)
        .ok_or_else(|| FrameError::Protocol(format!("reserved opcode {opcode:#x}")))?;
    let fin = b0 & FIN_BIT != 0;
    let rsv = (b0 & RSV_MASK) >> 4;

    let payload_len = match b1 & LEN_MASK {
        LEN_16 => src.get_u16() as u64,
        LEN_64 => {
            let len = src.get_u64();
            if len & (1 << 63) != 0 {
                return Err(FrameError::Protocol(
                    "64-bit payload length has its high bit set".to_string(),
                ));
            }
            len
        }
        short => short as u64,
    };

    let mask = if b1 & MASK_BIT != 0 {
        let mut key = [0u8; 4];
        src.copy_to_slice(&mut key);
        Some(key)
    } else {
        None
    };

    if frame_type.is_control() {
        if !fin {
            return Err(FrameError::Protocol(format!(
                "fragmented {frame_type} frame"
            )));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLarge { size: payload_len });
        }
    }

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    Ok(Some(FrameHeader {
        fin,
        rsv,
        frame_type,
        mask,
        payload_len,
    }))
}

/// XOR `buf` with `key`, where `buf[0]` sits at `offset` within the payload.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4], offset: u64) {
    let start = (offset % 4) as usize;
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[(start + i) % 4];
    }
}

/// Whether `code` may be sent in a close frame.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Encode a close frame payload: big-endian status code followed by a UTF-8 reason.
pub fn encode_close_payload(code: u16, reason: &str, dst: &mut BytesMut) -> Result<()> {
    if !is_valid_close_code(code) {
        return Err(FrameError::InvalidCloseCode(code));
    }
    let size = 2 + reason.len();
    if size > MAX_CONTROL_PAYLOAD {
        return Err(FrameError::ControlFrameTooLarge { size: size as u64 });
    }
    dst.reserve(size);
    dst.put_u16(code);
    dst.put_slice(reason.as_bytes());
    Ok(())
}

/// Validate a close frame payload: empty, or a valid code plus UTF-8 reason.
pub fn validate_close_payload(payload: &[u8]) -> Result<()> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(FrameError::Protocol(
            "close payload must be empty or at least 2 bytes".to_string(),
        )),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(FrameError::InvalidCloseCode(code));
            }
            std::str::from_utf8(&payload[2..]).map_err(|_| {
                FrameError::Protocol("close reason is not valid UTF-8".to_string())
            })?;
            Ok(())
        }
    }
}

/// Configuration for frame channels and the multiplexer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Connection side; decides outbound masking and inbound mask checks.
    pub role: Role,
    /// Maximum inbound payload size, and the cap for buffered outbound frames.
    /// Default: 16 MiB.
    pub max_payload_size: u64,
    /// Buffer size for transfers that cannot be forwarded directly.
    pub transfer_chunk_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            transfer_chunk_size: DEFAULT_TRANSFER_CHUNK,
        }
    }
}

impl FrameConfig {
    /// Default configuration for the client side.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::default()
        }
    }

    /// Default configuration for the server side.
    pub fn server() -> Self {
        Self::default()
    }

    pub fn with_max_payload_size(mut self, max_payload_size: u64) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn with_transfer_chunk_size(mut self, transfer_chunk_size: usize) -> Self {
        self.transfer_chunk_size = transfer_chunk_size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(frame_type: FrameType, payload_len: u64) -> FrameHeader {
        FrameHeader {
            fin: true,
            rsv: 0,
            frame_type,
            mask: None,
            payload_len,
        }
    }

    #[test]
    fn test_short_text_header_bytes() {
        let mut buf = BytesMut::new();
        encode_header(&header(FrameType::Text, 5), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x81, 0x05]);
    }

    #[test]
    fn test_extended_length_boundaries() {
        for (len, expected) in [(125u64, 2usize), (126, 4), (65_535, 4), (65_536, 10)] {
            let mut buf = BytesMut::new();
            let h = header(FrameType::Binary, len);
            encode_header(&h, &mut buf).unwrap();
            assert_eq!(buf.len(), expected, "len {len}");
            assert_eq!(h.encoded_len(), expected);

            let decoded = decode_header(&mut buf, u64::MAX).unwrap().unwrap();
            assert_eq!(decoded.payload_len, len);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_masked_header_with_flags() {
        let h = FrameHeader {
            fin: false,
            rsv: 0b100,
            frame_type: FrameType::Binary,
            mask: Some([1, 2, 3, 4]),
            payload_len: 300,
        };
        let mut buf = BytesMut::new();
        encode_header(&h, &mut buf).unwrap();
        assert_eq!(header_len([buf[0], buf[1]]), 8);

        let decoded = decode_header(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x82, 0x7E, 0x01][..]);
        assert!(decode_header(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .is_none());
        assert_eq!(buf.len(), 3, "partial header must not be consumed");
    }

    #[test]
    fn test_decode_leaves_payload_in_place() {
        let mut buf = BytesMut::new();
        encode_header(&header(FrameType::Text, 2), &mut buf).unwrap();
        buf.put_slice(b"hi");

        decode_header(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..], b"hi");
    }

    #[test]
    fn test_decode_reserved_opcode() {
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        let result = decode_header(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::Protocol(_))));
    }

    #[test]
    fn test_decode_fragmented_control_frame() {
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        let result = decode_header(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::Protocol(_))));
    }

    #[test]
    fn test_decode_oversized_control_frame() {
        let mut buf = BytesMut::from(&[0x89, 0x7E, 0x00, 0x80][..]);
        let result = decode_header(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(
            result,
            Err(FrameError::ControlFrameTooLarge { size: 128 })
        ));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        encode_header(&header(FrameType::Binary, 1024), &mut buf).unwrap();
        let result = decode_header(&mut buf, 512);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_encode_rejects_bad_rsv_and_fragmented_ping() {
        let mut buf = BytesMut::new();
        let mut h = header(FrameType::Binary, 0);
        h.rsv = 8;
        assert!(matches!(
            encode_header(&h, &mut buf),
            Err(FrameError::InvalidRsv(8))
        ));

        let mut ping = header(FrameType::Ping, 0);
        ping.fin = false;
        assert!(matches!(
            encode_header(&ping, &mut buf),
            Err(FrameError::InvalidState(_))
        ));
    }

    #[test]
    fn test_mask_is_an_involution_at_any_offset() {
        let key = [0xA1, 0xB2, 0xC3, 0xD4];
        let original = b"framing over shared transports".to_vec();

        let mut whole = original.clone();
        apply_mask(&mut whole, key, 0);

        // masking in two uneven pieces must match masking in one go
        let mut pieces = original.clone();
        let (head, tail) = pieces.split_at_mut(7);
        apply_mask(head, key, 0);
        apply_mask(tail, key, 7);
        assert_eq!(pieces, whole);

        apply_mask(&mut whole, key, 0);
        assert_eq!(whole, original);
    }

    #[test]
    fn test_close_payload_validation() {
        let mut buf = BytesMut::new();
        encode_close_payload(1000, "bye", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x03, 0xE8, b'b', b'y', b'e']);
        validate_close_payload(&buf).unwrap();

        validate_close_payload(&[]).unwrap();
        assert!(matches!(
            validate_close_payload(&[0x03]),
            Err(FrameError::Protocol(_))
        ));
        assert!(matches!(
            validate_close_payload(&[0x03, 0xED]),
            Err(FrameError::InvalidCloseCode(1005))
        ));
        assert!(matches!(
            encode_close_payload(1006, "", &mut BytesMut::new()),
            Err(FrameError::InvalidCloseCode(1006))
        ));
    }

    #[test]
    fn test_opcode_mapping() {
        for ty in [
            FrameType::Continuation,
            FrameType::Text,
            FrameType::Binary,
            FrameType::Close,
            FrameType::Ping,
            FrameType::Pong,
        ] {
            assert_eq!(FrameType::from_opcode(ty.opcode()), Some(ty));
        }
        assert!(FrameType::Ping.is_control());
        assert!(!FrameType::Continuation.is_control());
        assert_eq!(FrameType::from_opcode(0x3), None);
    }

    #[test]
    fn test_config_roles() {
        assert!(FrameConfig::client().role.masks_outbound());
        assert!(!FrameConfig::server().role.masks_outbound());
        assert_eq!(
            FrameConfig::default()
                .with_transfer_chunk_size(0)
                .transfer_chunk_size,
            1
        );
    }
}
