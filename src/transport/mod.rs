//! Tunnel transports.
//!
//! Two transports exist: the always-present TLS byte [`stream`] and the
//! optional UDP [`datagram`] path. Both hand complete frames to the manager
//! (the stream transport reassembles; a datagram is a frame by itself) and
//! are driven from the manager's single-task event loop; their `recv`
//! futures double as the readiness events the loop waits on.

pub mod datagram;
pub mod stream;

pub use datagram::{build_client_hello, parse_server_hello, DatagramTransport, ServerHello};
pub use stream::StreamTransport;
