//! Error types for the SSL VPN transport core.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the transport core.
///
/// Per-packet errors (`BadHmac`, `Replay`, `MalformedFrame`) never escape the
/// receive path; they are counted and the packet is dropped. Everything
/// `is_fatal` bubbles up to the event loop, which transitions the session to
/// `Closing` and surfaces a single terminal event carrying `tag()`.
#[derive(Error, Debug)]
pub enum Error {
    /// The stream transport died; the session cannot continue.
    #[error("stream transport failed: {0}")]
    TransportFailed(String),

    /// The datagram transport died or its handshake failed. The session
    /// continues on the stream transport.
    #[error("datagram transport failed: {0}")]
    DatagramFailed(String),

    /// Inbound packet failed HMAC verification.
    #[error("packet HMAC verification failed")]
    BadHmac,

    /// Inbound packet sequence number already seen or too old.
    #[error("packet rejected by replay window")]
    Replay,

    /// A frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame length field exceeds the configured MTU plus framing overhead.
    #[error("invalid frame length {0}")]
    InvalidLength(usize),

    /// The outbound sequence counter wrapped; new keying material is needed.
    #[error("outbound sequence counter wrapped, rekey required")]
    SeqWrapped,

    /// The cipher/MAC combination is not one of the supported suites.
    #[error("unsupported crypto suite: {0}")]
    UnsupportedSuite(String),

    /// LCP or network-layer negotiation exceeded its retry budget.
    #[error("PPP negotiation timed out: {0}")]
    PppTimeout(&'static str),

    /// The routing/DNS helper exited non-zero.
    #[error("helper script failed with status {0}")]
    HelperFailed(i32),

    /// User-initiated close.
    #[error("session cancelled")]
    Cancelled,

    /// The session cookie was already used; it is not valid for reconnect.
    #[error("session cookie is no longer valid")]
    CookieExpired,

    /// The gateway rejected the tunnel request with an HTTP response.
    #[error("gateway rejected tunnel request: {0}")]
    ConfigRejected(String),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// An external operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Create a new stream transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::TransportFailed(msg.into())
    }

    /// Create a new datagram transport error.
    pub fn datagram<S: Into<String>>(msg: S) -> Self {
        Self::DatagramFailed(msg.into())
    }

    /// Create a new malformed-frame error.
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error ends the session.
    ///
    /// Per-packet errors and datagram failures do not; the receive path drops
    /// the packet (or demotes to the stream transport) and keeps going.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::BadHmac | Self::Replay | Self::MalformedFrame(_) | Self::DatagramFailed(_)
        )
    }

    /// Short machine-readable tag for the terminal session event.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::TransportFailed(_) => "transport-failed",
            Self::DatagramFailed(_) => "datagram-failed",
            Self::BadHmac => "bad-hmac",
            Self::Replay => "replay",
            Self::MalformedFrame(_) => "malformed-frame",
            Self::InvalidLength(_) => "invalid-length",
            Self::SeqWrapped => "seq-wrapped",
            Self::UnsupportedSuite(_) => "unsupported-suite",
            Self::PppTimeout(_) => "ppp-timeout",
            Self::HelperFailed(_) => "helper-failed",
            Self::Cancelled => "cancelled",
            Self::CookieExpired => "cookie-expired",
            Self::ConfigRejected(_) => "config-rejected",
            Self::Tls(_) => "tls",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::Timeout => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_packet_errors_are_not_fatal() {
        assert!(!Error::BadHmac.is_fatal());
        assert!(!Error::Replay.is_fatal());
        assert!(!Error::malformed("short").is_fatal());
        assert!(!Error::datagram("probe refused").is_fatal());
    }

    #[test]
    fn session_errors_are_fatal() {
        assert!(Error::transport("eof").is_fatal());
        assert!(Error::SeqWrapped.is_fatal());
        assert!(Error::PppTimeout("lcp").is_fatal());
        assert!(Error::HelperFailed(1).is_fatal());
        assert!(Error::Cancelled.is_fatal());
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(Error::SeqWrapped.tag(), "seq-wrapped");
        assert_eq!(Error::CookieExpired.tag(), "cookie-expired");
        assert_eq!(Error::Cancelled.tag(), "cancelled");
    }
}
