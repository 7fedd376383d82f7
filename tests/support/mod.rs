//! In-process fake gateway for tunnel-phase integration tests.
//!
//! Speaks the Fortinet dialect over plain TCP (the tests disable TLS) and
//! UDP on the same port: answers the tunnel request's PPP negotiation as a
//! conformant peer, handles the clthello/svrhello exchange, and echoes
//! tunneled IP packets back to their sender on whichever transport they
//! arrived on.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use svpn::framing::{Frame, LengthPrefixedFramer};
use svpn::ppp::{code, proto};

/// Opt-in test logging via `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the gateway answers the clthello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DgramReply {
    Ok,
    Fail,
    Ignore,
}

/// Observable gateway state for test assertions.
#[derive(Debug, Default)]
pub struct GatewayReport {
    pub got_tunnel_request: AtomicBool,
    pub got_clthello: AtomicBool,
    pub got_terminate: AtomicBool,
    pub tcp_data_frames: AtomicU64,
    pub udp_data_frames: AtomicU64,
}

pub struct FakeGateway {
    pub port: u16,
    pub report: Arc<GatewayReport>,
}

/// Minimal conformant PPP peer: acks what it hears, states its own
/// requirements once, answers echoes, and NAKs the client toward the
/// assigned address.
struct PeerPpp {
    assigned: Ipv4Addr,
    dns: Ipv4Addr,
    magic: u32,
    sent_lcp_cr: bool,
    sent_ipcp_cr: bool,
    report: Arc<GatewayReport>,
}

fn cp(protocol: u16, pkt_code: u8, id: u8, data: &[u8]) -> Frame {
    let mut payload = vec![pkt_code, id];
    payload.extend_from_slice(&((4 + data.len()) as u16).to_be_bytes());
    payload.extend_from_slice(data);
    Frame::new(protocol, payload)
}

fn options(opts: &[(u8, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (ty, data) in opts {
        out.push(*ty);
        out.push((2 + data.len()) as u8);
        out.extend_from_slice(data);
    }
    out
}

fn parse_options(mut data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut opts = Vec::new();
    while data.len() >= 2 {
        let len = data[1] as usize;
        if len < 2 || len > data.len() {
            break;
        }
        opts.push((data[0], data[2..len].to_vec()));
        data = &data[len..];
    }
    opts
}

impl PeerPpp {
    fn new(assigned: Ipv4Addr, report: Arc<GatewayReport>) -> Self {
        Self {
            assigned,
            dns: Ipv4Addr::new(10, 0, 0, 53),
            magic: 0x6A5F_0001,
            sent_lcp_cr: false,
            sent_ipcp_cr: false,
            report,
        }
    }

    fn handle(&mut self, frame: &Frame, via_udp: bool) -> Vec<Frame> {
        let mut replies = Vec::new();
        match frame.protocol {
            proto::LCP => self.handle_lcp(frame, &mut replies),
            proto::IPCP => self.handle_ipcp(frame, &mut replies),
            proto::IPV4 => {
                if via_udp {
                    self.report.udp_data_frames.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.report.tcp_data_frames.fetch_add(1, Ordering::SeqCst);
                }
                replies.push(Frame::new(proto::IPV4, frame.payload.clone()));
            }
            _ => {}
        }
        replies
    }

    fn handle_lcp(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        if frame.payload.len() < 4 {
            return;
        }
        let (pkt_code, id) = (frame.payload[0], frame.payload[1]);
        let data = &frame.payload[4..];
        match pkt_code {
            code::CONFIGURE_REQUEST => {
                replies.push(cp(proto::LCP, code::CONFIGURE_ACK, id, data));
                if !self.sent_lcp_cr {
                    self.sent_lcp_cr = true;
                    let magic = self.magic.to_be_bytes();
                    let opts = options(&[(1, &1400u16.to_be_bytes()), (5, &magic)]);
                    replies.push(cp(proto::LCP, code::CONFIGURE_REQUEST, 1, &opts));
                }
            }
            code::ECHO_REQUEST => {
                let mut reply = self.magic.to_be_bytes().to_vec();
                if data.len() > 4 {
                    reply.extend_from_slice(&data[4..]);
                }
                replies.push(cp(proto::LCP, code::ECHO_REPLY, id, &reply));
            }
            code::TERMINATE_REQUEST => {
                self.report.got_terminate.store(true, Ordering::SeqCst);
                replies.push(cp(proto::LCP, code::TERMINATE_ACK, id, b""));
            }
            _ => {}
        }
    }

    fn handle_ipcp(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        if frame.payload.len() < 4 {
            return;
        }
        let (pkt_code, id) = (frame.payload[0], frame.payload[1]);
        let data = &frame.payload[4..];
        if pkt_code != code::CONFIGURE_REQUEST {
            return;
        }

        let mut naks: Vec<(u8, Vec<u8>)> = Vec::new();
        for (ty, value) in parse_options(data) {
            match ty {
                3 if value != self.assigned.octets() => {
                    naks.push((3, self.assigned.octets().to_vec()));
                }
                129 if value == [0, 0, 0, 0] => {
                    naks.push((129, self.dns.octets().to_vec()));
                }
                _ => {}
            }
        }

        if naks.is_empty() {
            replies.push(cp(proto::IPCP, code::CONFIGURE_ACK, id, data));
        } else {
            let opts: Vec<(u8, &[u8])> =
                naks.iter().map(|(t, v)| (*t, v.as_slice())).collect();
            replies.push(cp(proto::IPCP, code::CONFIGURE_NAK, id, &options(&opts)));
        }

        if !self.sent_ipcp_cr {
            self.sent_ipcp_cr = true;
            let gw = [192, 0, 2, 99];
            let opts = options(&[(3, &gw)]);
            replies.push(cp(proto::IPCP, code::CONFIGURE_REQUEST, 1, &opts));
        }
    }
}

const SVRHELLO_TAG: &[u8] = b"GFtype\0svrhello\0handshake\0";
const CLTHELLO_TAG: &[u8] = b"GFtype\0clthello\0SVPNCOOKIE\0";

fn svrhello(status: &[u8]) -> Vec<u8> {
    let total = 2 + SVRHELLO_TAG.len() + status.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(SVRHELLO_TAG);
    out.extend_from_slice(status);
    out
}

impl FakeGateway {
    /// Bind TCP and UDP on one ephemeral port and serve a single session.
    pub async fn spawn(assigned: Ipv4Addr, dgram_reply: DgramReply) -> FakeGateway {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let udp = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
        let report = Arc::new(GatewayReport::default());

        let task_report = report.clone();
        tokio::spawn(async move {
            serve(listener, udp, assigned, dgram_reply, task_report).await;
        });

        FakeGateway { port, report }
    }
}

async fn serve(
    listener: TcpListener,
    udp: UdpSocket,
    assigned: Ipv4Addr,
    dgram_reply: DgramReply,
    report: Arc<GatewayReport>,
) {
    let (mut tcp, _) = match listener.accept().await {
        Ok(conn) => conn,
        Err(_) => return,
    };

    // Consume the HTTP-like tunnel request up to the blank line; whatever
    // follows is already framed PPP.
    let mut head = Vec::new();
    let leftover: Vec<u8>;
    let mut buf = [0u8; 4096];
    loop {
        let n = match tcp.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        head.extend_from_slice(&buf[..n]);
        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            assert!(head.starts_with(b"GET "), "expected a tunnel request");
            report.got_tunnel_request.store(true, Ordering::SeqCst);
            leftover = head.split_off(pos + 4);
            break;
        }
    }

    let mut peer = PeerPpp::new(assigned, report.clone());
    let mut tcp_framer = LengthPrefixedFramer::new(0x5050, 2048);
    let mut udp_framer = LengthPrefixedFramer::new(0x5050, 2048);
    tcp_framer.push(&leftover);

    let mut udp_peer: Option<SocketAddr> = None;
    let mut ubuf = [0u8; 2048];

    loop {
        // Drain complete TCP frames before waiting again.
        while let Ok(Some(frame)) = tcp_framer.next_frame() {
            for reply in peer.handle(&frame, false) {
                let wire = tcp_framer.encode(reply.protocol, &reply.payload).unwrap();
                if tcp.write_all(&wire).await.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            r = tcp.read(&mut buf) => {
                match r {
                    Ok(0) | Err(_) => return,
                    Ok(n) => tcp_framer.push(&buf[..n]),
                }
            }
            r = udp.recv_from(&mut ubuf) => {
                let (n, from) = match r {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                let datagram = &ubuf[..n];
                if datagram.len() < 6 {
                    // Heartbeat or noise.
                    continue;
                }
                if datagram[2..].starts_with(CLTHELLO_TAG) {
                    report.got_clthello.store(true, Ordering::SeqCst);
                    udp_peer = Some(from);
                    match dgram_reply {
                        DgramReply::Ok => {
                            let _ = udp.send_to(&svrhello(b"ok"), from).await;
                        }
                        DgramReply::Fail => {
                            let _ = udp.send_to(&svrhello(b"fail"), from).await;
                        }
                        DgramReply::Ignore => {}
                    }
                    continue;
                }
                udp_peer = Some(from);
                if let Ok(Some(frame)) = udp_framer.decode_one(datagram) {
                    for reply in peer.handle(&frame, true) {
                        let wire = udp_framer.encode(reply.protocol, &reply.payload).unwrap();
                        if let Some(to) = udp_peer {
                            let _ = udp.send_to(&wire, to).await;
                        }
                    }
                }
            }
        }
    }
}
