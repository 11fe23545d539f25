//! Framed message type and wire codec.
//!
//! Every frame on the wire is a fixed-size little-endian header followed by
//! the payload:
//!
//! ```text
//! [magic: u32-le] [opcode: u8] [length: u32-le] [checksum: u32-le] [payload: length bytes]
//! ```
//!
//! The checksum is the first four bytes of the payload's SHA-256 digest.
//! Peers must agree on this layout bit for bit.

use {
    crate::error::{NetError, Result},
    bytes::{Buf, BufMut, Bytes, BytesMut},
    log::warn,
};

/// Fixed wire size of a frame header.
pub const HEADER_SIZE: usize = 13;

/// A framed message: an opcode plus an opaque payload.
///
/// The magic and checksum are stamped at serialization time and validated at
/// parse time; they are not part of the in-memory representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    opcode: u8,
    payload: Bytes,
}

impl Msg {
    /// Create a message from an opcode and payload bytes.
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// The message opcode.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize to the on-wire frame, stamping the given magic.
    pub(crate) fn encode(&self, magic: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32_le(magic);
        buf.put_u8(self.opcode);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(checksum32(&self.payload));
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// First four bytes of SHA-256(payload), little-endian.
pub(crate) fn checksum32(payload: &[u8]) -> u32 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(payload);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy)]
struct Header {
    magic: u32,
    opcode: u8,
    length: u32,
    checksum: u32,
}

impl Header {
    fn decode(mut buf: impl Buf) -> Self {
        let magic = buf.get_u32_le();
        let opcode = buf.get_u8();
        let length = buf.get_u32_le();
        let checksum = buf.get_u32_le();
        Self {
            magic,
            opcode,
            length,
            checksum,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ParseState {
    Header,
    Payload(Header),
}

/// Incremental two-state frame parser over a connection's recv buffer.
///
/// `next_frame` consumes as much of the buffer as it can: it returns
/// `Ok(Some(msg))` for each deliverable message, `Ok(None)` when the buffer
/// holds no complete frame, and an error when a frame declares a payload
/// larger than the configured cap (fatal to the connection). Frames with a
/// mismatched magic or checksum are dropped without killing the connection.
pub(crate) struct FrameParser {
    magic: u32,
    max_msg_size: usize,
    state: ParseState,
}

impl FrameParser {
    pub(crate) fn new(magic: u32, max_msg_size: usize) -> Self {
        Self {
            magic,
            max_msg_size,
            state: ParseState::Header,
        }
    }

    pub(crate) fn next_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Msg>> {
        loop {
            match self.state {
                ParseState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = Header::decode(buf.split_to(HEADER_SIZE));
                    if header.length as usize > self.max_msg_size {
                        return Err(NetError::ConnOversizedMsg {
                            size: header.length as usize,
                            max: self.max_msg_size,
                        });
                    }
                    self.state = ParseState::Payload(header);
                }
                ParseState::Payload(header) => {
                    let len = header.length as usize;
                    if buf.len() < len {
                        return Ok(None);
                    }
                    let payload = buf.split_to(len).freeze();
                    self.state = ParseState::Header;
                    if header.magic != self.magic {
                        warn!(
                            "frame magic {:#010x} does not match {:#010x}, dropping message",
                            header.magic, self.magic
                        );
                        continue;
                    }
                    #[cfg(feature = "checksum")]
                    if header.checksum != checksum32(&payload) {
                        warn!("checksums do not match, dropping the message");
                        continue;
                    }
                    #[cfg(not(feature = "checksum"))]
                    let _ = header.checksum;
                    return Ok(Some(Msg {
                        opcode: header.opcode,
                        payload,
                    }));
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
