//! Transport core for a multi-protocol SSL VPN client.
//!
//! Given a session cookie and a server endpoint (both produced by an
//! external HTTPS authentication step), this crate establishes and
//! maintains the tunnel carrying Legacy IP and IPv6 traffic between a
//! local virtual interface and the gateway:
//!
//! - a dual-transport manager owning a TLS stream (always) and an
//!   opportunistic UDP datagram path (promoted when its handshake proves
//!   the path works, demoted when it fails),
//! - a PPP engine negotiating LCP/IPCP/IPV6CP over whichever transport is
//!   active, with HDLC-style and length-prefixed framings,
//! - a CBC + truncated-HMAC packet crypto layer with a sliding anti-replay
//!   window for the dialects that protect datagram traffic themselves.
//!
//! Authentication dialogs, configuration loading, the CLI, and the
//! OS-specific TUN drivers are the hosting application's business; the
//! crate speaks to them through [`Session`], [`TunHandle`] and the helper
//! executable.

pub mod config;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod helper;
mod manager;
pub mod packet;
pub mod ppp;
pub mod session;
pub mod transport;
pub mod tun;

pub use config::{Dialect, Endpoint, SessionOptions, SplitInclude, TunnelConfig};
pub use error::{Error, Result};
pub use session::{Lifecycle, Session, SessionHandle, SessionStats, TunnelEvent};
pub use tun::TunHandle;
