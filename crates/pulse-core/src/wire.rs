//! Pulse wire format: the fixed-size broadcast frame.
//!
//! Every message crossing the medium is split into frames of exactly
//! `FRAME_HEADER_LEN + capacity` bytes. The medium carries only tiny
//! payloads (a legacy BLE advertisement has 31 bytes in total), so the
//! header is kept to twelve bytes and the data slice is small.
//!
//! The header is #[repr(C, packed)] with big-endian integer fields and uses
//! zerocopy derives for allocation-free parsing. Changing anything here is a
//! breaking change for every device already in the field.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Header stamped on every broadcast frame.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Wire format version. Currently 0x01.
    /// A receiver seeing an unknown version drops the frame.
    pub version: u8,

    /// Bit flags:
    ///   bit    0: acknowledgement (reply reusing the request's message id)
    ///   bits 1-7: reserved, must be zero
    pub flags: u8,

    /// Zero bytes appended to this fragment's data. Only the final
    /// fragment of a message may carry padding.
    pub padding: u8,

    /// Reserved, must be zero.
    pub reserved: u8,

    /// Message id shared by every fragment of one message.
    pub message_id: U32<BigEndian>,

    /// Number of fragments in the message. Never zero.
    pub total: U16<BigEndian>,

    /// 1-based position of this fragment, 1..=total.
    pub sequence: U16<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 12]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Header length in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Flag bit marking an acknowledgement fragment.
pub const FLAG_ACK: u8 = 0x01;

/// Default data bytes per fragment. Header + 16 = 28 bytes per frame.
pub const DEFAULT_FRAGMENT_CAPACITY: usize = 16;

/// Largest capacity the one-byte padding field can describe.
pub const MAX_FRAGMENT_CAPACITY: usize = u8::MAX as usize;

/// Message id carried in every fragment header.
pub type MessageId = u32;

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Options for [`FragmentCodec::encode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Set the ack flag on every fragment.
    pub is_ack: bool,
    /// Stamp this id instead of generating a fresh one.
    pub reuse_id: Option<MessageId>,
}

impl EncodeOptions {
    /// A new request with a freshly generated id.
    pub fn request() -> Self {
        Self::default()
    }

    /// An acknowledgement that reuses the id of the message it answers.
    pub fn ack(reuse_id: MessageId) -> Self {
        Self {
            is_ack: true,
            reuse_id: Some(reuse_id),
        }
    }
}

/// A message split into ready-to-send frames.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub id: MessageId,
    pub is_ack: bool,
    /// Frames in sequence order, 1..=total.
    pub frames: Vec<Bytes>,
}

impl EncodedMessage {
    pub fn total(&self) -> u16 {
        self.frames.len() as u16
    }
}

/// Splits messages into fixed-size frames.
///
/// The codec holds only the fragment capacity; it keeps no per-message state.
#[derive(Debug, Clone, Copy)]
pub struct FragmentCodec {
    capacity: usize,
}

impl Default for FragmentCodec {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_FRAGMENT_CAPACITY,
        }
    }
}

impl FragmentCodec {
    pub fn new(capacity: usize) -> Result<Self, WireError> {
        if capacity == 0 || capacity > MAX_FRAGMENT_CAPACITY {
            return Err(WireError::InvalidCapacity(capacity));
        }
        Ok(Self { capacity })
    }

    /// Data bytes per fragment.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Full on-air size of every frame this codec produces.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.capacity
    }

    /// Number of fragments `len` bytes split into. Always at least one.
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.capacity).max(1)
    }

    /// Split `message` into frames. The final fragment is zero-padded to
    /// the full capacity and records how much padding it carries.
    pub fn encode(&self, message: &[u8], opts: EncodeOptions) -> Result<EncodedMessage, WireError> {
        let total = self.fragment_count(message.len());
        if total > u16::MAX as usize {
            return Err(WireError::MessageTooLarge(message.len()));
        }

        let id = opts.reuse_id.unwrap_or_else(rand::random);
        let flags = if opts.is_ack { FLAG_ACK } else { 0 };

        let mut frames = Vec::with_capacity(total);
        for index in 0..total {
            let start = index * self.capacity;
            let end = (start + self.capacity).min(message.len());
            let data = &message[start..end];
            let padding = self.capacity - data.len();

            let header = FrameHeader {
                version: FRAME_VERSION,
                flags,
                padding: padding as u8,
                reserved: 0,
                message_id: U32::new(id),
                total: U16::new(total as u16),
                sequence: U16::new((index + 1) as u16),
            };

            let mut frame = BytesMut::with_capacity(self.frame_len());
            frame.put_slice(header.as_bytes());
            frame.put_slice(data);
            frame.put_bytes(0, padding);
            frames.push(frame.freeze());
        }

        Ok(EncodedMessage {
            id,
            is_ack: opts.is_ack,
            frames,
        })
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// A parsed frame. `data` has the padding already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFragment {
    pub id: MessageId,
    pub total: u16,
    pub sequence: u16,
    pub is_ack: bool,
    pub data: Bytes,
}

/// Parse one frame off the medium.
///
/// Pure and stateless. Any error means the frame is dropped by the caller.
pub fn decode(frame: &[u8]) -> Result<DecodedFragment, WireError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(WireError::Truncated(frame.len()));
    }
    let header =
        FrameHeader::read_from_prefix(frame).ok_or(WireError::Truncated(frame.len()))?;

    if header.version != FRAME_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }
    if header.flags & !FLAG_ACK != 0 {
        return Err(WireError::ReservedFlagsSet(header.flags));
    }

    let total = header.total.get();
    let sequence = header.sequence.get();
    if total == 0 || sequence == 0 || sequence > total {
        return Err(WireError::InvalidSequence { sequence, total });
    }

    let body = &frame[FRAME_HEADER_LEN..];
    let padding = header.padding as usize;
    if padding > body.len() || (padding > 0 && sequence != total) {
        return Err(WireError::BadPadding {
            padding: header.padding,
            available: body.len(),
        });
    }

    Ok(DecodedFragment {
        id: header.message_id.get(),
        total,
        sequence,
        is_ack: header.flags & FLAG_ACK != 0,
        data: Bytes::copy_from_slice(&body[..body.len() - padding]),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when building or interpreting frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the {}-byte header", FRAME_HEADER_LEN)]
    Truncated(usize),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("sequence {sequence} outside 1..={total}")]
    InvalidSequence { sequence: u16, total: u16 },

    #[error("padding {padding} invalid for fragment with {available} data bytes")]
    BadPadding { padding: u8, available: usize },

    #[error("fragment capacity {0} outside 1..={}", MAX_FRAGMENT_CAPACITY)]
    InvalidCapacity(usize),

    #[error("message of {0} bytes needs more than 65535 fragments")]
    MessageTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
