//! Fixed-capacity AJP packet buffer.
//!
//! Every AJP packet starts with a 4-byte header: a 2-byte direction tag
//! followed by the 2-byte body length, both big-endian. The body is a
//! sequence of typed fields:
//!
//! ```text
//! [tag: u16] [len: u16] [field] [field] ...
//!
//! byte    : 1 byte
//! int     : 2 bytes, big-endian
//! long    : 4 bytes, big-endian
//! string  : int length, bytes, NUL   (length 0xFFFF = null, no body)
//! bytes   : raw, length known from context
//! ```
//!
//! All accessors are bounds-checked. Appends that would overflow fail
//! without touching the buffer, and reads past the declared length fail
//! instead of returning adjacent memory.

use std::fmt::Write as _;

use super::error::{AjpError, Result};

/// Size of the packet header (tag + body length).
pub const AJP_HEADER_LEN: usize = 4;

/// Default packet size negotiated with the container.
pub const AJP_DEF_PACKET_SIZE: usize = 8192;

/// Largest packet size a worker may be configured with.
pub const AJP_MAX_PACKET_SIZE: usize = 65536;

/// Length marker for a null string.
pub const NULL_STRING_LEN: u16 = 0xFFFF;

/// A bounded AJP message buffer with independent write and read cursors.
///
/// The buffer is owned by exactly one exchange at a time. It is reset
/// between exchanges rather than reallocated.
///
/// # Example
///
/// ```
/// use ajplb_common::protocol::message::MessageBuffer;
///
/// let mut msg = MessageBuffer::new(64);
/// msg.append_u8(10).unwrap();
/// msg.append_string(Some("hello")).unwrap();
/// msg.seal(0x1234);
///
/// assert_eq!(msg.declared_len(), 1 + 2 + 5 + 1);
/// assert_eq!(msg.read_u8().unwrap(), 10);
/// assert_eq!(msg.read_string().unwrap().as_deref(), Some("hello"));
/// ```
#[derive(Clone)]
pub struct MessageBuffer {
    buf: Vec<u8>,
    len: usize,
    pos: usize,
}

impl MessageBuffer {
    /// Creates an empty buffer able to hold `capacity` bytes including the
    /// header. The capacity is clamped to `AJP_HEADER_LEN..=AJP_MAX_PACKET_SIZE`
    /// so the body length always fits the header's u16.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(AJP_HEADER_LEN, AJP_MAX_PACKET_SIZE);
        Self {
            buf: vec![0; capacity],
            len: AJP_HEADER_LEN,
            pos: AJP_HEADER_LEN,
        }
    }

    /// Total capacity, header included.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Current length, header included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no body bytes have been written or received.
    pub fn is_empty(&self) -> bool {
        self.len == AJP_HEADER_LEN
    }

    /// Number of body bytes currently held.
    pub fn payload_len(&self) -> usize {
        self.len - AJP_HEADER_LEN
    }

    /// Read cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Body bytes not yet consumed by a read.
    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Clears the contents and moves both cursors back to the first body byte.
    pub fn reset(&mut self) {
        self.buf.fill(0);
        self.len = AJP_HEADER_LEN;
        self.pos = AJP_HEADER_LEN;
    }

    /// Moves the read cursor back to the first body byte.
    pub fn rewind(&mut self) {
        self.pos = AJP_HEADER_LEN;
    }

    fn reserve(&self, n: usize) -> Result<()> {
        let needed = self.len + n;
        if needed > self.buf.len() {
            return Err(AjpError::Overflow {
                needed,
                capacity: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn append_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?;
        self.buf[self.len] = value;
        self.len += 1;
        Ok(())
    }

    pub fn append_u16(&mut self, value: u16) -> Result<()> {
        self.reserve(2)?;
        self.buf[self.len..self.len + 2].copy_from_slice(&value.to_be_bytes());
        self.len += 2;
        Ok(())
    }

    pub fn append_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?;
        self.buf[self.len..self.len + 4].copy_from_slice(&value.to_be_bytes());
        self.len += 4;
        Ok(())
    }

    /// Appends a length-prefixed, NUL-terminated string.
    ///
    /// `None` is written as the null marker `0xFFFF` with no body, which
    /// the container distinguishes from an empty string.
    pub fn append_string(&mut self, value: Option<&str>) -> Result<()> {
        let Some(s) = value else {
            return self.append_u16(NULL_STRING_LEN);
        };
        let bytes = s.as_bytes();
        if bytes.len() >= NULL_STRING_LEN as usize {
            return Err(AjpError::Overflow {
                needed: bytes.len(),
                capacity: NULL_STRING_LEN as usize - 1,
            });
        }
        self.reserve(bytes.len() + 3)?;
        self.buf[self.len..self.len + 2].copy_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.len += 2;
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.buf[self.len] = 0;
        self.len += 1;
        Ok(())
    }

    /// Shorthand for `append_string(Some(value))`.
    pub fn append_str(&mut self, value: &str) -> Result<()> {
        self.append_string(Some(value))
    }

    /// Appends raw bytes without a length prefix. Empty input is a no-op.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.reserve(bytes.len())?;
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Writes the direction tag and body length into the header.
    ///
    /// Call once after the last append and before the packet is written
    /// to the socket. Also rewinds the read cursor so a sealed buffer can
    /// be read back.
    pub fn seal(&mut self, tag: u16) {
        let body = (self.len - AJP_HEADER_LEN) as u16;
        self.buf[0..2].copy_from_slice(&tag.to_be_bytes());
        self.buf[2..4].copy_from_slice(&body.to_be_bytes());
        self.pos = AJP_HEADER_LEN;
    }

    /// Tag currently stored in the header.
    pub fn header_tag(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    /// Body length currently stored in the header.
    pub fn declared_len(&self) -> usize {
        u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize
    }

    /// Sealed wire image: header plus body.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Header slot for a receiving transport to fill.
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..AJP_HEADER_LEN]
    }

    /// Validates a freshly received header and prepares the body slot.
    ///
    /// Checks that the tag matches `expected_tag` and that the declared
    /// body fits into this buffer. On success the buffer length covers the
    /// declared body and the read cursor sits on its first byte.
    pub fn accept_header(&mut self, expected_tag: u16) -> Result<usize> {
        let tag = self.header_tag();
        if tag != expected_tag {
            return Err(AjpError::Framing(format!(
                "bad packet signature {:#06x}, expected {:#06x}",
                tag, expected_tag
            )));
        }
        let body = self.declared_len();
        if body + AJP_HEADER_LEN > self.buf.len() {
            return Err(AjpError::Framing(format!(
                "packet body of {} bytes exceeds buffer capacity {}",
                body,
                self.buf.len() - AJP_HEADER_LEN
            )));
        }
        self.len = AJP_HEADER_LEN + body;
        self.pos = AJP_HEADER_LEN;
        Ok(body)
    }

    /// Body slot sized by the last [`accept_header`](Self::accept_header).
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[AJP_HEADER_LEN..self.len]
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.len {
            return Err(AjpError::Framing(format!(
                "read of {} bytes at offset {} runs past message length {}",
                n, self.pos, self.len
            )));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn peek_u8(&self) -> Result<u8> {
        if self.pos + 1 > self.len {
            return Err(AjpError::Framing("peek past end of message".into()));
        }
        Ok(self.buf[self.pos])
    }

    pub fn peek_u16(&self) -> Result<u16> {
        if self.pos + 2 > self.len {
            return Err(AjpError::Framing("peek past end of message".into()));
        }
        Ok(u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a length-prefixed string.
    ///
    /// Returns `Ok(None)` for the null marker. A length that runs past the
    /// message is a framing error; the cursor is left unchanged in that
    /// case and the exchange should be aborted. Invalid UTF-8 is replaced
    /// rather than rejected since headers may carry Latin-1 text.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let start = self.pos;
        let size = self.read_u16()?;
        if size == NULL_STRING_LEN {
            return Ok(None);
        }
        let size = size as usize;
        if self.pos + size + 1 > self.len {
            self.pos = start;
            return Err(AjpError::Framing(format!(
                "string of {} bytes at offset {} runs past message length {}",
                size, start, self.len
            )));
        }
        let value = String::from_utf8_lossy(&self.buf[self.pos..self.pos + size]).into_owned();
        self.pos += size + 1;
        Ok(Some(value))
    }

    /// Reads exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        self.take(n)
    }

    /// Reads an int length followed by that many raw bytes.
    pub fn read_chunk(&mut self) -> Result<&[u8]> {
        let start = self.pos;
        let n = self.read_u16()? as usize;
        if self.pos + n > self.len {
            self.pos = start;
            return Err(AjpError::Framing(format!(
                "chunk of {} bytes runs past message length {}",
                n, self.len
            )));
        }
        self.take(n)
    }

    /// Copies the full contents, header included, into `dst`.
    pub fn copy_into(&self, dst: &mut MessageBuffer) -> Result<()> {
        if dst.capacity() < self.len {
            return Err(AjpError::Capacity {
                required: self.len,
                capacity: dst.capacity(),
            });
        }
        dst.buf[..self.len].copy_from_slice(&self.buf[..self.len]);
        dst.buf[self.len..].fill(0);
        dst.len = self.len;
        dst.pos = AJP_HEADER_LEN;
        Ok(())
    }

    /// Renders the message as a hex dump, 16 bytes per line.
    pub fn hex_dump(&self) -> String {
        let mut out = String::new();
        for (line, chunk) in self.as_bytes().chunks(16).enumerate() {
            let _ = write!(out, "{:04x}    ", line * 16);
            for i in 0..16 {
                match chunk.get(i) {
                    Some(b) => {
                        let _ = write!(out, "{:02x} ", b);
                    }
                    None => out.push_str("   "),
                }
            }
            out.push_str(" - ");
            for b in chunk {
                out.push(if b.is_ascii_graphic() { *b as char } else { '.' });
            }
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("capacity", &self.buf.len())
            .field("len", &self.len)
            .field("pos", &self.pos)
            .finish()
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new(AJP_DEF_PACKET_SIZE)
    }
}
