//! Framing codecs sitting between the transports and the PPP machine.
//!
//! Two framings exist in the supported dialect family: RFC 1662 byte
//! stuffing for the HDLC-style gateways and a 6-byte length prefix for the
//! rest. The PPP machine never sees the difference; both sides of a codec
//! speak `(protocol, payload)` pairs.

mod hdlc;
mod prefixed;

pub use hdlc::HdlcFramer;
pub use prefixed::LengthPrefixedFramer;

use crate::config::{Dialect, FramingKind};
use crate::error::Result;

/// One PPP frame: protocol number plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(protocol: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            protocol,
            payload: payload.into(),
        }
    }
}

/// Dialect-selected framer. The enum dispatch keeps the transport code free
/// of generics; the contract is small enough that a tagged variant reads
/// better than a trait object.
#[derive(Debug)]
pub enum Framer {
    Hdlc(HdlcFramer),
    LengthPrefixed(LengthPrefixedFramer),
}

impl Framer {
    /// Build the framer a dialect uses, sized to the tunnel MTU.
    pub fn for_dialect(dialect: Dialect, mtu: u16) -> Self {
        match dialect.framing() {
            FramingKind::Hdlc => Framer::Hdlc(HdlcFramer::new()),
            FramingKind::LengthPrefixed => Framer::LengthPrefixed(LengthPrefixedFramer::new(
                dialect.frame_magic(),
                mtu as usize,
            )),
        }
    }

    /// Encode one frame to wire bytes.
    pub fn encode(&self, protocol: u16, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            Framer::Hdlc(f) => Ok(f.encode(protocol, payload)),
            Framer::LengthPrefixed(f) => f.encode(protocol, payload),
        }
    }

    /// Feed received bytes into the reassembly buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        match self {
            Framer::Hdlc(f) => f.push(bytes),
            Framer::LengthPrefixed(f) => f.push(bytes),
        }
    }

    /// Pull the next complete frame out of the reassembly buffer.
    ///
    /// `Ok(None)` means more bytes are needed. An `Err` consumes the broken
    /// frame; the caller decides whether the transport can continue.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self {
            Framer::Hdlc(f) => f.next_frame(),
            Framer::LengthPrefixed(f) => f.next_frame(),
        }
    }

    /// Decode a single datagram-carried frame. Any partial state left by an
    /// earlier datagram is discarded first: datagrams never continue each
    /// other.
    pub fn decode_one(&mut self, bytes: &[u8]) -> Result<Option<Frame>> {
        match self {
            Framer::Hdlc(f) => f.reset(),
            Framer::LengthPrefixed(f) => f.reset(),
        }
        self.push(bytes);
        self.next_frame()
    }

    /// Apply the ACCM negotiated by LCP. No-op for length-prefixed framing.
    pub fn set_accm(&mut self, tx: u32, rx: u32) {
        if let Framer::Hdlc(f) = self {
            f.set_accm(tx, rx);
        }
    }
}
