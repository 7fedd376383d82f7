//! Session and tunnel configuration records.
//!
//! The authentication collaborator (HTTPS login dialog, form parsing) is not
//! part of this crate. It hands us a session cookie and a parsed
//! [`TunnelConfig`]; everything here is the shape of that handoff.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::DatagramCryptoParams;

/// Maximum accepted session cookie size in bytes.
pub const MAX_COOKIE_LEN: usize = 4096;

/// Gateway endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How PPP frames are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramingKind {
    /// `len:u16 ‖ magic:u16 ‖ protocol:u16 ‖ payload`, big-endian.
    LengthPrefixed,
    /// RFC 1662 byte-stuffed framing with 16-bit FCS.
    Hdlc,
}

/// Protocol dialect of the gateway.
///
/// The dialect fixes the stream framing, whether a datagram path may be
/// probed, and whether datagram traffic is wrapped in the packet crypto
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// Length-prefixed framing (magic 0x5050); datagram path probed with a
    /// clthello/svrhello exchange and carries framed PPP directly.
    Fortinet,
    /// Length-prefixed framing (magic 0xF500); stream only.
    F5,
    /// HDLC framing on the stream; datagram path carries framed PPP wrapped
    /// in the CBC/HMAC packet crypto layer.
    Pulse,
    /// HDLC framing on the stream; stream only.
    Array,
}

impl Dialect {
    /// Stream framing used by this dialect.
    pub fn framing(&self) -> FramingKind {
        match self {
            Dialect::Fortinet | Dialect::F5 => FramingKind::LengthPrefixed,
            Dialect::Pulse | Dialect::Array => FramingKind::Hdlc,
        }
    }

    /// Magic value carried in the length-prefixed frame header.
    pub fn frame_magic(&self) -> u16 {
        match self {
            Dialect::F5 => 0xF500,
            _ => 0x5050,
        }
    }

    /// Whether the dialect supports a datagram transport at all.
    pub fn supports_datagram(&self) -> bool {
        matches!(self, Dialect::Fortinet | Dialect::Pulse)
    }

    /// Whether datagram traffic is wrapped in the packet crypto layer.
    /// Requires `TunnelConfig::datagram_crypto` to be present.
    pub fn datagram_uses_crypto(&self) -> bool {
        matches!(self, Dialect::Pulse)
    }

    /// Default "start tunnel" request sent verbatim over the TLS stream
    /// immediately after handshake. May be overridden per session.
    pub fn stream_request(&self, host: &str) -> Vec<u8> {
        let path = match self {
            Dialect::Fortinet => "/remote/sslvpn-tunnel",
            Dialect::F5 => "/myvpn",
            Dialect::Pulse | Dialect::Array => "/tunnel",
        };
        format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             User-Agent: Mozilla/5.0 SV1\r\n\
             \r\n"
        )
        .into_bytes()
    }
}

/// A split-include route pointing into the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitInclude {
    V4 { addr: Ipv4Addr, mask: Ipv4Addr },
    V6 { addr: Ipv6Addr, prefix_len: u8 },
}

/// Split-DNS configuration as delivered by the gateway.
///
/// Parsed and reported, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitDns {
    pub domains: String,
    pub servers: Vec<IpAddr>,
}

/// Negotiated tunnel configuration, delivered by the authentication
/// collaborator alongside the session cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Assigned Legacy IP address.
    pub addr: Option<Ipv4Addr>,
    /// Netmask for `addr`; `None` means full tunnel (0.0.0.0).
    pub netmask: Option<Ipv4Addr>,
    /// Assigned IPv6 address.
    pub addr6: Option<Ipv6Addr>,
    /// Prefix length for `addr6`.
    pub prefix6: Option<u8>,

    /// DNS servers, at most three.
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Whitespace-joined search domains.
    #[serde(default)]
    pub search_domains: String,
    /// Split-include routes. Empty means default route through the tunnel.
    #[serde(default)]
    pub split_includes: Vec<SplitInclude>,
    /// Split-DNS entries (parsed, warned about, not enforced).
    #[serde(default)]
    pub split_dns: Vec<SplitDns>,

    /// Idle timeout in seconds.
    #[serde(default)]
    pub idle_timeout_secs: u32,
    /// Absolute authentication expiration, seconds since the epoch.
    #[serde(default)]
    pub auth_expiration_epoch: Option<u64>,
    /// MTU hint for the tunnel interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Keepalive / dead-peer-detection interval in seconds.
    #[serde(default = "default_dpd")]
    pub dpd_interval_secs: u32,
    /// Consecutive missed echo replies before the link is declared dead.
    #[serde(default = "default_dpd_fail")]
    pub dpd_fail_count: u32,
    /// How long to wait for the datagram handshake response, in seconds.
    #[serde(default = "default_hello_timeout")]
    pub client_hello_timeout_secs: u32,

    /// Datagram-layer crypto parameters, when the dialect uses them.
    #[serde(default)]
    pub datagram_crypto: Option<DatagramCryptoParams>,
}

fn default_mtu() -> u16 {
    1400
}
fn default_dpd() -> u32 {
    10
}
fn default_dpd_fail() -> u32 {
    3
}
fn default_hello_timeout() -> u32 {
    10
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            addr: None,
            netmask: None,
            addr6: None,
            prefix6: None,
            dns: Vec::new(),
            search_domains: String::new(),
            split_includes: Vec::new(),
            split_dns: Vec::new(),
            idle_timeout_secs: 0,
            auth_expiration_epoch: None,
            mtu: default_mtu(),
            dpd_interval_secs: default_dpd(),
            dpd_fail_count: default_dpd_fail(),
            client_hello_timeout_secs: default_hello_timeout(),
            datagram_crypto: None,
        }
    }
}

impl TunnelConfig {
    /// Whether all traffic is routed through the tunnel.
    pub fn default_route(&self) -> bool {
        self.split_includes.is_empty()
    }

    pub fn dpd_interval(&self) -> Duration {
        Duration::from_secs(self.dpd_interval_secs.max(1) as u64)
    }

    pub fn client_hello_timeout(&self) -> Duration {
        Duration::from_secs(self.client_hello_timeout_secs.max(1) as u64)
    }

    /// Primary IPv4 DNS server, if any.
    pub fn primary_dns4(&self) -> Option<Ipv4Addr> {
        self.dns.iter().find_map(|a| match a {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    /// Interface identifier for IPV6CP, derived from the assigned address.
    pub fn ifid(&self) -> Option<[u8; 8]> {
        self.addr6.map(|a| {
            let o = a.octets();
            let mut ifid = [0u8; 8];
            ifid.copy_from_slice(&o[8..16]);
            ifid
        })
    }
}

/// Knobs controlling how the session connects. These belong to the hosting
/// application, not the gateway.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Accept any TLS certificate (self-signed lab gateways).
    pub skip_tls_verify: bool,
    /// Use a plain TCP stream instead of TLS. Integration tests and local
    /// debugging only; a real gateway always speaks TLS.
    pub plain_transport: bool,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Override the dialect's default "start tunnel" request blob.
    pub stream_request: Option<Vec<u8>>,
    /// Disable the datagram path even when the dialect supports it.
    pub no_datagram: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            skip_tls_verify: false,
            plain_transport: false,
            connect_timeout_secs: 10,
            stream_request: None,
            no_datagram: false,
        }
    }
}
