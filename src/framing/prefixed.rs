//! Length-prefixed framing used by the non-HDLC dialects.
//!
//! ## Wire Format
//! ```text
//! +---------+---------+-----------+----------+
//! | len     | magic   | protocol  | payload  |
//! | u16 BE  | u16 BE  | u16 BE    | len - 6  |
//! +---------+---------+-----------+----------+
//! ```
//! `len` covers the whole frame including itself. The magic value is
//! dialect-specific (0x5050, 0xF500).

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::framing::Frame;

/// Frame header size: length + magic + protocol.
pub const HEADER_LEN: usize = 6;

/// Length-prefixed framer/deframer with streaming reassembly.
#[derive(Debug)]
pub struct LengthPrefixedFramer {
    magic: u16,
    max_frame: usize,
    buf: BytesMut,
}

impl LengthPrefixedFramer {
    /// `max_payload` is the tunnel MTU; frames longer than the MTU plus
    /// framing overhead are rejected.
    pub fn new(magic: u16, max_payload: usize) -> Self {
        Self {
            magic,
            max_frame: max_payload + HEADER_LEN,
            buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn magic(&self) -> u16 {
        self.magic
    }

    /// Frame one `(protocol, payload)` pair.
    pub fn encode(&self, protocol: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let total = HEADER_LEN + payload.len();
        if total > u16::MAX as usize {
            return Err(Error::InvalidLength(total));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.extend_from_slice(&self.magic.to_be_bytes());
        out.extend_from_slice(&protocol.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Feed received bytes into the reassembly buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame.
    ///
    /// There is no resynchronization marker in this framing; an invalid
    /// length or magic means the byte stream is unusable and the error is
    /// final for the transport that fed it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if len < HEADER_LEN || len > self.max_frame {
            return Err(Error::InvalidLength(len));
        }
        if self.buf.len() < len {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(len);
        frame.advance(2);
        let magic = frame.get_u16();
        if magic != self.magic {
            return Err(Error::malformed(format!(
                "frame magic {magic:#06x}, expected {:#06x}",
                self.magic
            )));
        }
        let protocol = frame.get_u16();
        Ok(Some(Frame::new(protocol, frame.to_vec())))
    }

    /// Decode a single datagram-carried frame. Any partial state left by an
    /// earlier datagram is discarded first: datagrams never continue each
    /// other.
    pub fn decode_one(&mut self, bytes: &[u8]) -> Result<Option<Frame>> {
        self.reset();
        self.push(bytes);
        self.next_frame()
    }

    /// Bytes currently buffered but not yet framed.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Drop any partially-assembled state. Used between datagrams, where
    /// every frame stands alone.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
