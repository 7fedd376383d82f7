//! Stream transport: framed PPP over a TLS byte stream.
//!
//! The stream is established once per session, sends the dialect's "start
//! tunnel" request, and from then on carries nothing but framed PPP bytes.
//! The gateway never answers the request on success; if it does answer, the
//! bytes are an HTTP error response and the session is misconfigured.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace, warn};

use crate::config::{Dialect, Endpoint, SessionOptions};
use crate::error::{Error, Result};
use crate::framing::{Frame, Framer};

/// A verifier that accepts all certificates, for lab gateways with
/// self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA512,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// The underlying byte stream: TLS in production, plain TCP for tests and
/// local debugging.
enum StreamLink {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl StreamLink {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            StreamLink::Plain(s) => s.read_buf(buf).await,
            StreamLink::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            StreamLink::Plain(s) => s.write_all(data).await,
            StreamLink::Tls(s) => s.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            StreamLink::Plain(s) => s.flush().await,
            StreamLink::Tls(s) => s.flush().await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            StreamLink::Plain(s) => s.shutdown().await,
            StreamLink::Tls(s) => s.shutdown().await,
        }
    }
}

/// Stream transport with per-dialect framing and reassembly.
pub struct StreamTransport {
    link: StreamLink,
    framer: Framer,
    rx: BytesMut,
    /// HTTP-response detector: bytes seen before the first valid frame.
    preamble: Vec<u8>,
    saw_frame: bool,
    closed: bool,
    tx_bytes: u64,
    rx_bytes: u64,
    rx_dropped: u64,
}

impl StreamTransport {
    /// Connect to the gateway and run the TLS handshake.
    pub async fn connect(
        endpoint: &Endpoint,
        dialect: Dialect,
        mtu: u16,
        options: &SessionOptions,
    ) -> Result<Self> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let timeout = Duration::from_secs(options.connect_timeout_secs);

        debug!(%addr, "connecting stream transport");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::transport(format!("TCP connect failed: {e}")))?;

        stream.set_nodelay(true)?;

        // TCP keepalive guards the NAT mapping under an otherwise idle
        // control stream.
        let sock_ref = SockRef::from(&stream);
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(10))
            .with_interval(Duration::from_secs(5));
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            debug!("failed to set TCP keepalive: {e} (continuing anyway)");
        }

        let link = if options.plain_transport {
            warn!("plain transport requested; TLS disabled");
            StreamLink::Plain(stream)
        } else {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let tls_config = if options.skip_tls_verify {
                ClientConfig::builder_with_provider(provider)
                    .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)
                    .map_err(|e| Error::Tls(e.to_string()))?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            } else {
                let root_store = RootCertStore::empty();
                ClientConfig::builder_with_provider(provider)
                    .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)
                    .map_err(|e| Error::Tls(e.to_string()))?
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            };
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = ServerName::try_from(endpoint.host.clone())
                .map_err(|_| Error::Tls(format!("invalid server name: {}", endpoint.host)))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| Error::Tls(format!("TLS handshake failed: {e}")))?;
            info!("TLS connection established");
            StreamLink::Tls(Box::new(tls))
        };

        Ok(Self {
            link,
            framer: Framer::for_dialect(dialect, mtu),
            rx: BytesMut::with_capacity(16384),
            preamble: Vec::new(),
            saw_frame: false,
            closed: false,
            tx_bytes: 0,
            rx_bytes: 0,
            rx_dropped: 0,
        })
    }

    /// Send the dialect's opaque "start tunnel" request.
    pub async fn start_tunnel(&mut self, request: &[u8]) -> Result<()> {
        trace!(len = request.len(), "sending tunnel request");
        self.link.write_all(request).await?;
        self.link.flush().await?;
        self.tx_bytes += request.len() as u64;
        Ok(())
    }

    /// Frame and send one `(protocol, payload)` pair.
    pub async fn send_frame(&mut self, protocol: u16, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::transport("stream transport closed"));
        }
        let wire = self.framer.encode(protocol, payload)?;
        self.link.write_all(&wire).await?;
        self.link.flush().await?;
        self.tx_bytes += wire.len() as u64;
        Ok(())
    }

    /// Receive the next complete frame. Cancel-safe: partial reads stay in
    /// the reassembly buffer.
    pub async fn recv_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.try_next_frame()? {
                return Ok(frame);
            }
            let n = self
                .link
                .read_buf(&mut self.rx)
                .await
                .map_err(|e| Error::transport(format!("stream read failed: {e}")))?;
            if n == 0 {
                return Err(Error::transport("connection closed by gateway"));
            }
            self.rx_bytes += n as u64;

            if !self.saw_frame && self.preamble.len() < 1024 {
                self.preamble.extend_from_slice(&self.rx[self.rx.len() - n..]);
            }
            let chunk = self.rx.split();
            self.framer.push(&chunk);

            if !self.saw_frame {
                self.check_http_rejection()?;
            }
        }
    }

    /// Pull an already-buffered frame without waiting. Used by the event
    /// loop to drain its per-source budget after a wakeup.
    pub fn try_next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.framer.next_frame() {
                Ok(Some(frame)) => {
                    self.saw_frame = true;
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None),
                // Byte-stuffed framing resynchronizes; a corrupt frame is
                // dropped. The length-prefixed stream has no resync marker,
                // so corruption there kills the transport.
                Err(e) => match &self.framer {
                    Framer::Hdlc(_) => {
                        warn!(error = %e, "dropping corrupt frame");
                        self.rx_dropped += 1;
                    }
                    Framer::LengthPrefixed(_) => {
                        return Err(Error::transport(format!("framing lost: {e}")));
                    }
                },
            }
        }
    }

    /// Reject the session when the gateway answered the tunnel request with
    /// an HTTP response instead of silence.
    fn check_http_rejection(&self) -> Result<()> {
        if self.preamble.len() < 5 || !self.preamble.starts_with(b"HTTP/") {
            return Ok(());
        }
        let line_end = self
            .preamble
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or(self.preamble.len());
        let status_line = String::from_utf8_lossy(&self.preamble[..line_end]).into_owned();
        warn!(%status_line, "gateway rejected the tunnel request");
        Err(Error::ConfigRejected(status_line))
    }

    /// Apply the negotiated ACCM to the framer.
    pub fn set_accm(&mut self, tx: u32, rx: u32) {
        self.framer.set_accm(tx, rx);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.tx_bytes
    }

    pub fn bytes_received(&self) -> u64 {
        self.rx_bytes
    }

    pub fn frames_dropped(&self) -> u64 {
        self.rx_dropped
    }

    /// Close the stream. Idempotent.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.link.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppp::proto;
    use tokio::net::TcpListener;

    async fn pair(dialect: Dialect) -> (StreamTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let options = SessionOptions {
            plain_transport: true,
            ..Default::default()
        };
        let connect = StreamTransport::connect(&endpoint, dialect, 1400, &options);
        let (client, server) = tokio::join!(connect, listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn frames_roundtrip_over_tcp() {
        let (mut client, mut server) = pair(Dialect::Fortinet).await;

        client.send_frame(proto::LCP, &[1, 2, 3]).await.unwrap();

        // The server reads the framed bytes and echoes them back.
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        server.write_all(&buf[..n]).await.unwrap();

        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame.protocol, proto::LCP);
        assert_eq!(frame.payload, [1, 2, 3]);
        assert!(client.bytes_sent() >= 9);
        assert_eq!(client.bytes_received(), client.bytes_sent());
    }

    #[tokio::test]
    async fn http_response_is_a_config_rejection() {
        let (mut client, mut server) = pair(Dialect::Fortinet).await;
        server
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let err = client.recv_frame().await.unwrap_err();
        match err {
            Error::ConfigRejected(line) => assert_eq!(line, "HTTP/1.1 403 Forbidden"),
            other => panic!("expected ConfigRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_is_transport_failure() {
        let (mut client, server) = pair(Dialect::Fortinet).await;
        drop(server);
        assert!(matches!(
            client.recv_frame().await,
            Err(Error::TransportFailed(_))
        ));
    }

    #[tokio::test]
    async fn hdlc_dialect_reassembles_split_frames() {
        let (mut client, mut server) = pair(Dialect::Array).await;

        let framer = crate::framing::HdlcFramer::new();
        let wire = framer.encode(proto::IPV4, b"split me");
        let (a, b) = wire.split_at(wire.len() / 2);
        server.write_all(a).await.unwrap();
        server.flush().await.unwrap();
        tokio::task::yield_now().await;
        server.write_all(b).await.unwrap();

        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame.payload, b"split me");
    }
}
