//! Datagram transport: the opportunistic UDP fast path.
//!
//! After the socket is connected, the manager performs the protocol-level
//! handshake: a `clthello` datagram embedding the session cookie, answered
//! by a `svrhello` whose status must be `ok`. Anything else (`fail`, a
//! malformed response, silence until the client-hello timeout) disables
//! the datagram path for the rest of the session. A PPP-looking frame in
//! place of the `svrhello` counts as success: the `ok` may simply have been
//! lost, and the gateway is already sending tunnel traffic.
//!
//! ## Handshake wire format
//! ```text
//! clthello: len:u16 BE ‖ "GFtype\0clthello\0SVPNCOOKIE\0" ‖ cookie ‖ "\0"
//! svrhello: len:u16 BE ‖ "GFtype\0svrhello\0handshake\0" ‖ ("ok"|"fail")
//! ```
//! `len` covers the whole datagram including the length field itself.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Fixed tag opening every client hello.
const CLTHELLO_TAG: &[u8] = b"GFtype\0clthello\0SVPNCOOKIE\0";

/// Fixed tag opening every server hello.
const SVRHELLO_TAG: &[u8] = b"GFtype\0svrhello\0handshake\0";

/// Single-byte heartbeat sent on an established datagram path. Anything
/// shorter than a frame header is ignored by the receive side.
pub const HEARTBEAT: [u8; 1] = [0x00];

/// Largest datagram we expect to see.
pub const MAX_DATAGRAM: usize = 2048;

/// Build the `clthello` datagram for a session cookie.
pub fn build_client_hello(cookie: &[u8]) -> Vec<u8> {
    let total = 2 + CLTHELLO_TAG.len() + cookie.len() + 1;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(CLTHELLO_TAG);
    out.extend_from_slice(cookie);
    out.push(0);
    out
}

/// Parsed `svrhello` status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerHello {
    Ok,
    Fail(String),
}

/// Parse a datagram as a `svrhello`. `None` when it is not one (the caller
/// may still treat it as an early PPP frame).
pub fn parse_server_hello(buf: &[u8]) -> Option<ServerHello> {
    if buf.len() < 2 + SVRHELLO_TAG.len() {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len != buf.len() || &buf[2..2 + SVRHELLO_TAG.len()] != SVRHELLO_TAG {
        return None;
    }
    let status = &buf[2 + SVRHELLO_TAG.len()..];
    let status = match status.split(|&b| b == 0).next() {
        Some(s) => s,
        None => status,
    };
    if status == b"ok" {
        Some(ServerHello::Ok)
    } else {
        Some(ServerHello::Fail(
            String::from_utf8_lossy(status).into_owned(),
        ))
    }
}

/// The UDP datagram socket, connected to the gateway.
pub struct DatagramTransport {
    sock: UdpSocket,
    closed: bool,
    tx_bytes: u64,
    rx_bytes: u64,
}

impl DatagramTransport {
    /// Bind an ephemeral local socket and connect it to the gateway.
    /// The gateway reuses the TLS port for the datagram path.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let remote = lookup_host((host, port))
            .await
            .map_err(|e| Error::datagram(format!("resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| Error::datagram(format!("no addresses for {host}")))?;
        Self::connect_addr(remote).await
    }

    /// Connect to an already-resolved address.
    pub async fn connect_addr(remote: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = match remote {
            SocketAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into(),
            SocketAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into(),
        };
        let sock = UdpSocket::bind(bind)
            .await
            .map_err(|e| Error::datagram(format!("bind: {e}")))?;
        sock.connect(remote)
            .await
            .map_err(|e| Error::datagram(format!("connect {remote}: {e}")))?;
        debug!(local = %sock.local_addr()?, %remote, "datagram transport connected");
        Ok(Self {
            sock,
            closed: false,
            tx_bytes: 0,
            rx_bytes: 0,
        })
    }

    /// Send one datagram, waiting for the socket if necessary.
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::datagram("datagram transport closed"));
        }
        let n = self
            .sock
            .send(buf)
            .await
            .map_err(|e| Error::datagram(format!("send: {e}")))?;
        self.tx_bytes += n as u64;
        Ok(n)
    }

    /// Send without waiting. `None` means the socket would block; the frame
    /// stays at the head of the caller's queue.
    pub fn try_send(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        if self.closed {
            return Err(Error::datagram("datagram transport closed"));
        }
        match self.sock.try_send(buf) {
            Ok(n) => {
                self.tx_bytes += n as u64;
                Ok(Some(n))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::datagram(format!("send: {e}"))),
        }
    }

    /// Receive one datagram. Cancel-safe.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::datagram("datagram transport closed"));
        }
        let n = self
            .sock
            .recv(buf)
            .await
            .map_err(|e| Error::datagram(format!("recv: {e}")))?;
        self.rx_bytes += n as u64;
        trace!(len = n, "datagram received");
        Ok(n)
    }

    /// Non-blocking receive, used to drain the per-source budget after a
    /// wakeup. `None` when no datagram is queued.
    pub fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.closed {
            return Err(Error::datagram("datagram transport closed"));
        }
        match self.sock.try_recv(buf) {
            Ok(n) => {
                self.rx_bytes += n as u64;
                Ok(Some(n))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::datagram(format!("recv: {e}"))),
        }
    }

    /// Wait until a send would not block.
    pub async fn writable(&self) -> Result<()> {
        self.sock
            .writable()
            .await
            .map_err(|e| Error::datagram(format!("writable: {e}")))
    }

    pub fn bytes_sent(&self) -> u64 {
        self.tx_bytes
    }

    pub fn bytes_received(&self) -> u64 {
        self.rx_bytes
    }

    /// Mark the transport closed. Idempotent; the socket itself is released
    /// on drop.
    pub fn close(&mut self) {
        self.closed = true;
    }
}
