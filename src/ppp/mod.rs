//! PPP negotiation engine: LCP, IPCP and IPV6CP over whichever transport is
//! active.
//!
//! The engine is sandwiched between the framing codecs and the transport
//! manager and is deliberately free of I/O: the manager feeds it received
//! `(protocol, payload)` pairs and timer ticks, and drains the frames and
//! events it produces. That keeps the transport↔state-machine coupling
//! acyclic; both are owned by the manager, which calls each in turn.
//!
//! Authentication is bypassed: the session was pre-authenticated over HTTPS
//! and carries a cookie, so any auth protocol the peer proposes is
//! Configure-Rejected and the phase moves straight from Establish to
//! Network.

mod fsm;

pub use fsm::{Cp, CpState};

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::framing::Frame;

/// PPP protocol numbers.
pub mod proto {
    /// Internet Protocol version 4
    pub const IPV4: u16 = 0x0021;
    /// Internet Protocol version 6
    pub const IPV6: u16 = 0x0057;
    /// Internet Protocol Control Protocol
    pub const IPCP: u16 = 0x8021;
    /// IPv6 Control Protocol
    pub const IPV6CP: u16 = 0x8057;
    /// Link Control Protocol
    pub const LCP: u16 = 0xC021;
}

/// Control-protocol packet codes.
pub mod code {
    pub const CONFIGURE_REQUEST: u8 = 1;
    pub const CONFIGURE_ACK: u8 = 2;
    pub const CONFIGURE_NAK: u8 = 3;
    pub const CONFIGURE_REJECT: u8 = 4;
    pub const TERMINATE_REQUEST: u8 = 5;
    pub const TERMINATE_ACK: u8 = 6;
    pub const CODE_REJECT: u8 = 7;
    pub const PROTOCOL_REJECT: u8 = 8;
    pub const ECHO_REQUEST: u8 = 9;
    pub const ECHO_REPLY: u8 = 10;
    pub const DISCARD_REQUEST: u8 = 11;
}

mod lcp_opt {
    pub const MRU: u8 = 1;
    pub const ACCM: u8 = 2;
    pub const AUTH_PROTOCOL: u8 = 3;
    pub const MAGIC_NUMBER: u8 = 5;
    pub const PFC: u8 = 7;
    pub const ACFC: u8 = 8;
}

mod ipcp_opt {
    pub const IP_COMPRESSION: u8 = 2;
    pub const IP_ADDRESS: u8 = 3;
    pub const PRIMARY_DNS: u8 = 129;
    pub const SECONDARY_DNS: u8 = 131;
}

mod ipv6cp_opt {
    pub const INTERFACE_ID: u8 = 1;
}

/// Global PPP phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dead,
    Establish,
    /// We refuse every auth protocol; the phase exists only as a waypoint.
    AuthBypass,
    Network,
    Open,
    Terminate,
}

/// Which control protocol, for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpKind {
    Lcp,
    Ipcp,
    Ipv6cp,
}

/// What to do with one option from a peer's Configure-Request.
enum OptionVerdict {
    /// Acceptable as proposed.
    Ack,
    /// Acceptable in principle; counter-propose these value bytes.
    Nak(Vec<u8>),
    /// Unknown or never acceptable.
    Reject,
}

/// Tunable negotiation parameters.
#[derive(Debug, Clone)]
pub struct PppConfig {
    pub mru: u16,
    pub want_ipv4: bool,
    pub want_ipv6: bool,
    /// Address to propose in IPCP (from the tunnel configuration).
    pub addr: Option<Ipv4Addr>,
    /// Primary DNS to propose in IPCP.
    pub dns: Option<Ipv4Addr>,
    /// Interface identifier to propose in IPV6CP.
    pub ifid: Option<[u8; 8]>,
    pub dpd_interval: Duration,
    pub dpd_fail_count: u32,
    pub restart_timer: Duration,
    pub max_configure: u32,
    pub terminate_timeout: Duration,
}

impl Default for PppConfig {
    fn default() -> Self {
        Self {
            mru: 1400,
            want_ipv4: true,
            want_ipv6: false,
            addr: None,
            dns: None,
            ifid: None,
            dpd_interval: Duration::from_secs(10),
            dpd_fail_count: 3,
            restart_timer: Duration::from_secs(3),
            max_configure: 10,
            terminate_timeout: Duration::from_secs(2),
        }
    }
}

/// Addresses negotiated by the network control protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkParams {
    pub addr: Option<Ipv4Addr>,
    pub peer_addr: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub ifid: Option<[u8; 8]>,
    pub peer_ifid: Option<[u8; 8]>,
}

/// Events surfaced to the transport manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PppEvent {
    PhaseChange(Phase),
    /// All wanted network protocols resolved and at least one opened.
    NetworkUp(NetworkParams),
    /// A control protocol exhausted its configure retries.
    NegotiationFailed(&'static str),
    /// Too many missed echo replies; the link is being terminated.
    EchoTimeout,
    /// The link reached Dead after a terminate exchange (ours or the
    /// peer's).
    Terminated,
}

/// The PPP engine.
pub struct Ppp {
    cfg: PppConfig,
    phase: Phase,
    lcp: Cp,
    ipcp: Cp,
    ipv6cp: Cp,

    magic: u32,
    peer_magic: u32,
    peer_mru: u16,
    /// ACCM the peer asked for; governs our transmit escaping.
    tx_accm: u32,
    /// Set once the peer's LCP request is acked; the manager then applies
    /// the ACCM to the framer.
    accm_ready: bool,

    // Current IPCP proposals (absorb NAKs) and results.
    addr: Ipv4Addr,
    dns: Ipv4Addr,
    send_dns: bool,
    send_accm: bool,
    send_pfc: bool,
    send_acfc: bool,
    peer_addr: Option<Ipv4Addr>,
    ifid: [u8; 8],
    peer_ifid: Option<[u8; 8]>,

    echo_pending: u32,
    next_echo: Option<Instant>,

    out: VecDeque<Frame>,
    events: VecDeque<PppEvent>,
    network_notified: bool,
}

fn cp_frame(protocol: u16, code: u8, id: u8, data: &[u8]) -> Frame {
    let mut p = Vec::with_capacity(4 + data.len());
    p.push(code);
    p.push(id);
    p.extend_from_slice(&((4 + data.len()) as u16).to_be_bytes());
    p.extend_from_slice(data);
    Frame::new(protocol, p)
}

/// Parse a run of `(type, len, data)` options. `None` on malformed input.
fn parse_opts(mut data: &[u8]) -> Option<Vec<(u8, Vec<u8>)>> {
    let mut opts = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return None;
        }
        let (ty, len) = (data[0], data[1] as usize);
        if len < 2 || len > data.len() {
            return None;
        }
        opts.push((ty, data[2..len].to_vec()));
        data = &data[len..];
    }
    Some(opts)
}

fn opts_bytes(opts: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (ty, data) in opts {
        out.push(*ty);
        out.push((2 + data.len()) as u8);
        out.extend_from_slice(data);
    }
    out
}

impl Ppp {
    pub fn new(cfg: PppConfig) -> Self {
        let magic: u32 = rand::random::<u32>() | 1;
        let ifid = cfg.ifid.unwrap_or_else(rand::random);
        let addr = cfg.addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let dns = cfg.dns.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let (max_conf, restart) = (cfg.max_configure, cfg.restart_timer);
        let send_dns = cfg.want_ipv4;
        Self {
            cfg,
            phase: Phase::Dead,
            lcp: Cp::new("LCP", max_conf, restart),
            ipcp: Cp::new("IPCP", max_conf, restart),
            ipv6cp: Cp::new("IPV6CP", max_conf, restart),
            magic,
            peer_magic: 0,
            peer_mru: 1500,
            tx_accm: 0xFFFF_FFFF,
            accm_ready: false,
            addr,
            dns,
            send_dns,
            send_accm: true,
            send_pfc: true,
            send_acfc: true,
            peer_addr: None,
            ifid,
            peer_ifid: None,
            echo_pending: 0,
            next_echo: None,
            out: VecDeque::new(),
            events: VecDeque::new(),
            network_notified: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    pub fn lcp_state(&self) -> CpState {
        self.lcp.state
    }

    /// ACCM to apply to the framer once [`accm_ready`](Self::take_accm)
    /// reports it. `(tx, rx)`: what we escape on send, what the peer
    /// escapes toward us.
    pub fn take_accm(&mut self) -> Option<(u32, u32)> {
        if self.accm_ready {
            self.accm_ready = false;
            // We proposed 0 for our receive direction.
            Some((self.tx_accm, 0))
        } else {
            None
        }
    }

    /// Negotiated addresses, valid once `NetworkUp` was emitted.
    pub fn network(&self) -> NetworkParams {
        NetworkParams {
            addr: (self.ipcp.state == CpState::Opened).then_some(self.addr),
            peer_addr: self.peer_addr,
            dns: (self.ipcp.state == CpState::Opened && !self.dns.is_unspecified())
                .then_some(self.dns),
            ifid: (self.ipv6cp.state == CpState::Opened).then_some(self.ifid),
            peer_ifid: self.peer_ifid,
        }
    }

    pub fn take_frame(&mut self) -> Option<Frame> {
        self.out.pop_front()
    }

    pub fn take_event(&mut self) -> Option<PppEvent> {
        self.events.pop_front()
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "PPP phase change");
            self.phase = phase;
            self.events.push_back(PppEvent::PhaseChange(phase));
        }
    }

    /// The transport under us is up; start LCP.
    pub fn lower_up(&mut self, now: Instant) {
        self.set_phase(Phase::Establish);
        self.lcp.enter(CpState::Starting);
        self.send_configure_request(CpKind::Lcp, now);
    }

    /// Begin a graceful close: Terminate-Request with a short deadline.
    pub fn close(&mut self, now: Instant) {
        match self.phase {
            Phase::Dead | Phase::Terminate => {}
            _ => {
                self.set_phase(Phase::Terminate);
                self.ipcp.enter(CpState::Closed);
                self.ipv6cp.enter(CpState::Closed);
                let id = self.lcp.next_id();
                self.out.push_back(cp_frame(proto::LCP, code::TERMINATE_REQUEST, id, b""));
                self.lcp
                    .sent_terminate_request(now, id, self.cfg.terminate_timeout);
            }
        }
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next = None;
        for d in [
            self.lcp.deadline,
            self.ipcp.deadline,
            self.ipv6cp.deadline,
            self.next_echo,
        ]
        .into_iter()
        .flatten()
        {
            next = Some(match next {
                None => d,
                Some(n) if d < n => d,
                Some(n) => n,
            });
        }
        next
    }

    /// Drive restart timers, the echo keepalive and the terminate deadline.
    pub fn poll_timers(&mut self, now: Instant) {
        for kind in [CpKind::Lcp, CpKind::Ipcp, CpKind::Ipv6cp] {
            let cp = self.cp_mut(kind);
            if !cp.timer_due(now) {
                continue;
            }
            match cp.state {
                CpState::Terminating => {
                    // No Terminate-Ack; give up and declare the link dead.
                    cp.enter(CpState::Closed);
                    if kind == CpKind::Lcp {
                        self.link_terminated();
                    }
                }
                CpState::ReqSent | CpState::AckReceived | CpState::AckSent => {
                    if cp.retries_exhausted() {
                        let name = cp.name;
                        cp.enter(CpState::Closed);
                        warn!(protocol = name, "configure retries exhausted");
                        self.events.push_back(PppEvent::NegotiationFailed(name));
                    } else {
                        debug!(protocol = cp.name, "restart timer fired, retransmitting");
                        self.send_configure_request(kind, now);
                    }
                }
                _ => {
                    self.cp_mut(kind).deadline = None;
                }
            }
        }

        // LCP echo keepalive.
        if self.lcp.state == CpState::Opened {
            if let Some(due) = self.next_echo {
                if now >= due {
                    if self.echo_pending >= self.cfg.dpd_fail_count {
                        warn!(
                            missed = self.echo_pending,
                            "no echo replies, terminating link"
                        );
                        self.events.push_back(PppEvent::EchoTimeout);
                        self.next_echo = None;
                        self.close(now);
                    } else {
                        let id = self.lcp.next_id();
                        let data = self.magic.to_be_bytes();
                        self.out
                            .push_back(cp_frame(proto::LCP, code::ECHO_REQUEST, id, &data));
                        self.echo_pending += 1;
                        self.next_echo = Some(now + self.cfg.dpd_interval);
                    }
                }
            }
        }
    }

    /// Feed one received `(protocol, payload)` pair.
    pub fn input(&mut self, now: Instant, protocol: u16, payload: &[u8]) {
        match protocol {
            proto::LCP => self.cp_input(CpKind::Lcp, now, payload),
            proto::IPCP => self.cp_input(CpKind::Ipcp, now, payload),
            proto::IPV6CP => self.cp_input(CpKind::Ipv6cp, now, payload),
            other => self.reject_protocol(other, payload),
        }
    }

    /// Send an LCP Protocol-Reject for a frame we cannot handle.
    pub fn reject_protocol(&mut self, protocol: u16, payload: &[u8]) {
        if self.lcp.state != CpState::Opened {
            return;
        }
        trace!(protocol = format_args!("{protocol:#06x}"), "protocol reject");
        let id = self.lcp.next_id();
        let mut data = protocol.to_be_bytes().to_vec();
        let keep = payload.len().min(self.peer_mru as usize - 8);
        data.extend_from_slice(&payload[..keep]);
        self.out
            .push_back(cp_frame(proto::LCP, code::PROTOCOL_REJECT, id, &data));
    }

    fn cp_mut(&mut self, kind: CpKind) -> &mut Cp {
        match kind {
            CpKind::Lcp => &mut self.lcp,
            CpKind::Ipcp => &mut self.ipcp,
            CpKind::Ipv6cp => &mut self.ipv6cp,
        }
    }

    fn cp_proto(kind: CpKind) -> u16 {
        match kind {
            CpKind::Lcp => proto::LCP,
            CpKind::Ipcp => proto::IPCP,
            CpKind::Ipv6cp => proto::IPV6CP,
        }
    }

    fn send_configure_request(&mut self, kind: CpKind, now: Instant) {
        let data = match kind {
            CpKind::Lcp => self.build_lcp_options(),
            CpKind::Ipcp => self.build_ipcp_options(),
            CpKind::Ipv6cp => self.build_ipv6cp_options(),
        };
        let cp = self.cp_mut(kind);
        let id = cp.next_id();
        cp.sent_configure_request(now, id);
        if !cp.state.negotiating() {
            cp.state = CpState::ReqSent;
        }
        self.out
            .push_back(cp_frame(Self::cp_proto(kind), code::CONFIGURE_REQUEST, id, &data));
    }

    fn build_lcp_options(&self) -> Vec<u8> {
        let mut opts: Vec<(u8, Vec<u8>)> = vec![(lcp_opt::MRU, self.cfg.mru.to_be_bytes().to_vec())];
        if self.send_accm {
            opts.push((lcp_opt::ACCM, 0u32.to_be_bytes().to_vec()));
        }
        opts.push((lcp_opt::MAGIC_NUMBER, self.magic.to_be_bytes().to_vec()));
        if self.send_pfc {
            opts.push((lcp_opt::PFC, Vec::new()));
        }
        if self.send_acfc {
            opts.push((lcp_opt::ACFC, Vec::new()));
        }
        opts_bytes(&opts)
    }

    fn build_ipcp_options(&self) -> Vec<u8> {
        let mut opts: Vec<(u8, Vec<u8>)> =
            vec![(ipcp_opt::IP_ADDRESS, self.addr.octets().to_vec())];
        if self.send_dns {
            opts.push((ipcp_opt::PRIMARY_DNS, self.dns.octets().to_vec()));
        }
        opts_bytes(&opts)
    }

    fn build_ipv6cp_options(&self) -> Vec<u8> {
        opts_bytes(&[(ipv6cp_opt::INTERFACE_ID, self.ifid.to_vec())])
    }

    fn cp_input(&mut self, kind: CpKind, now: Instant, payload: &[u8]) {
        if payload.len() < 4 {
            trace!(?kind, "runt control packet");
            return;
        }
        let (pkt_code, id) = (payload[0], payload[1]);
        let len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        if len < 4 || len > payload.len() {
            trace!(?kind, len, "bad control packet length");
            return;
        }
        let data = &payload[4..len];

        match pkt_code {
            code::CONFIGURE_REQUEST => self.on_configure_request(kind, now, id, data),
            code::CONFIGURE_ACK => self.on_configure_ack(kind, now, id),
            code::CONFIGURE_NAK => self.on_configure_nak(kind, now, id, data),
            code::CONFIGURE_REJECT => self.on_configure_reject(kind, now, id, data),
            code::TERMINATE_REQUEST => self.on_terminate_request(kind, id),
            code::TERMINATE_ACK => self.on_terminate_ack(kind, id),
            code::ECHO_REQUEST => {
                if kind == CpKind::Lcp && self.lcp.state == CpState::Opened {
                    let mut reply = self.magic.to_be_bytes().to_vec();
                    if data.len() > 4 {
                        reply.extend_from_slice(&data[4..]);
                    }
                    self.out
                        .push_back(cp_frame(proto::LCP, code::ECHO_REPLY, id, &reply));
                }
            }
            code::ECHO_REPLY => {
                if kind == CpKind::Lcp {
                    trace!("echo reply");
                    self.echo_pending = 0;
                }
            }
            code::PROTOCOL_REJECT => {
                if kind == CpKind::Lcp && data.len() >= 2 {
                    let rejected = u16::from_be_bytes([data[0], data[1]]);
                    warn!(
                        protocol = format_args!("{rejected:#06x}"),
                        "peer rejected protocol"
                    );
                    match rejected {
                        proto::IPCP => self.ipcp.enter(CpState::Closed),
                        proto::IPV6CP => self.ipv6cp.enter(CpState::Closed),
                        _ => {}
                    }
                    self.maybe_network_up();
                }
            }
            code::CODE_REJECT | code::DISCARD_REQUEST => {}
            other => {
                // Unknown code: Code-Reject with the offending packet.
                let rid = self.cp_mut(kind).next_id();
                let keep = len.min(self.peer_mru as usize - 8);
                let mut rejected = Vec::with_capacity(keep);
                rejected.extend_from_slice(&payload[..keep]);
                trace!(?kind, code = other, "code reject");
                self.out.push_back(cp_frame(
                    Self::cp_proto(kind),
                    code::CODE_REJECT,
                    rid,
                    &rejected,
                ));
            }
        }
    }

    fn on_configure_request(&mut self, kind: CpKind, now: Instant, id: u8, data: &[u8]) {
        let opts = match parse_opts(data) {
            Some(o) => o,
            None => {
                trace!(?kind, "malformed options in configure request");
                return;
            }
        };

        let mut rejected: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut naked: Vec<(u8, Vec<u8>)> = Vec::new();
        for (ty, od) in &opts {
            match self.judge_peer_option(kind, *ty, od) {
                OptionVerdict::Ack => {}
                OptionVerdict::Nak(counter) => naked.push((*ty, counter)),
                OptionVerdict::Reject => rejected.push((*ty, od.clone())),
            }
        }

        let protocol = Self::cp_proto(kind);
        if !rejected.is_empty() {
            self.out.push_back(cp_frame(
                protocol,
                code::CONFIGURE_REJECT,
                id,
                &opts_bytes(&rejected),
            ));
            return;
        }
        if !naked.is_empty() {
            self.out.push_back(cp_frame(
                protocol,
                code::CONFIGURE_NAK,
                id,
                &opts_bytes(&naked),
            ));
            return;
        }

        // Acceptable in full: apply, ack, advance the automaton.
        for (ty, od) in &opts {
            self.apply_peer_option(kind, *ty, od);
        }
        self.out
            .push_back(cp_frame(protocol, code::CONFIGURE_ACK, id, data));
        if kind == CpKind::Lcp {
            self.accm_ready = true;
        }

        let cp = self.cp_mut(kind);
        match cp.state {
            CpState::ReqSent => cp.enter(CpState::AckSent),
            CpState::AckReceived => {
                cp.enter(CpState::Opened);
                self.this_layer_up(kind, now);
            }
            CpState::Opened => {
                // Renegotiation from the peer: answer and restate ours.
                cp.enter(CpState::AckSent);
                self.send_configure_request(kind, now);
            }
            _ => {}
        }
    }

    fn on_configure_ack(&mut self, kind: CpKind, now: Instant, id: u8) {
        let cp = self.cp_mut(kind);
        if id != cp.req_id {
            trace!(?kind, id, expected = cp.req_id, "stale configure ack");
            return;
        }
        cp.reset_retries();
        match cp.state {
            CpState::ReqSent => cp.enter(CpState::AckReceived),
            CpState::AckSent => {
                cp.enter(CpState::Opened);
                self.this_layer_up(kind, now);
            }
            _ => {}
        }
    }

    fn on_configure_nak(&mut self, kind: CpKind, now: Instant, id: u8, data: &[u8]) {
        if id != self.cp_mut(kind).req_id {
            return;
        }
        let opts = match parse_opts(data) {
            Some(o) => o,
            None => return,
        };
        for (ty, od) in &opts {
            self.absorb_nak(kind, *ty, od);
        }
        self.send_configure_request(kind, now);
    }

    fn on_configure_reject(&mut self, kind: CpKind, now: Instant, id: u8, data: &[u8]) {
        if id != self.cp_mut(kind).req_id {
            return;
        }
        let opts = match parse_opts(data) {
            Some(o) => o,
            None => return,
        };
        for (ty, _) in &opts {
            self.absorb_reject(kind, *ty);
        }
        self.send_configure_request(kind, now);
    }

    fn on_terminate_request(&mut self, kind: CpKind, id: u8) {
        debug!(?kind, "peer terminate request");
        self.out.push_back(cp_frame(
            Self::cp_proto(kind),
            code::TERMINATE_ACK,
            id,
            b"",
        ));
        let cp = self.cp_mut(kind);
        cp.enter(CpState::Closed);
        if kind == CpKind::Lcp {
            self.link_terminated();
        }
    }

    fn on_terminate_ack(&mut self, kind: CpKind, id: u8) {
        let cp = self.cp_mut(kind);
        if cp.state == CpState::Terminating && id == cp.term_id {
            cp.enter(CpState::Closed);
            if kind == CpKind::Lcp {
                self.link_terminated();
            }
        }
    }

    fn link_terminated(&mut self) {
        self.ipcp.enter(CpState::Closed);
        self.ipv6cp.enter(CpState::Closed);
        self.next_echo = None;
        self.set_phase(Phase::Dead);
        self.events.push_back(PppEvent::Terminated);
    }

    fn this_layer_up(&mut self, kind: CpKind, now: Instant) {
        match kind {
            CpKind::Lcp => {
                debug!(magic = format_args!("{:#010x}", self.magic), "LCP opened");
                self.set_phase(Phase::AuthBypass);
                // Pre-authenticated over HTTPS; skip straight to Network.
                self.set_phase(Phase::Network);
                self.next_echo = Some(now + self.cfg.dpd_interval);
                self.echo_pending = 0;
                if self.cfg.want_ipv4 {
                    self.ipcp.enter(CpState::Starting);
                    self.send_configure_request(CpKind::Ipcp, now);
                }
                if self.cfg.want_ipv6 {
                    self.ipv6cp.enter(CpState::Starting);
                    self.send_configure_request(CpKind::Ipv6cp, now);
                }
            }
            CpKind::Ipcp => {
                debug!(addr = %self.addr, peer = ?self.peer_addr, "IPCP opened");
                self.maybe_network_up();
            }
            CpKind::Ipv6cp => {
                debug!("IPV6CP opened");
                self.maybe_network_up();
            }
        }
    }

    /// Move to Open once every wanted NCP has either opened or been
    /// rejected, with at least one open.
    fn maybe_network_up(&mut self) {
        if self.network_notified || self.phase != Phase::Network {
            return;
        }
        let v4_done = !self.cfg.want_ipv4
            || matches!(self.ipcp.state, CpState::Opened | CpState::Closed);
        let v6_done = !self.cfg.want_ipv6
            || matches!(self.ipv6cp.state, CpState::Opened | CpState::Closed);
        let any_open =
            self.ipcp.state == CpState::Opened || self.ipv6cp.state == CpState::Opened;
        if v4_done && v6_done && any_open {
            self.network_notified = true;
            self.set_phase(Phase::Open);
            self.events.push_back(PppEvent::NetworkUp(self.network()));
        }
    }

    fn judge_peer_option(&self, kind: CpKind, ty: u8, data: &[u8]) -> OptionVerdict {
        match kind {
            CpKind::Lcp => match ty {
                lcp_opt::MRU if data.len() == 2 => {
                    let mru = u16::from_be_bytes([data[0], data[1]]);
                    if mru < 128 {
                        OptionVerdict::Nak(self.cfg.mru.to_be_bytes().to_vec())
                    } else {
                        OptionVerdict::Ack
                    }
                }
                lcp_opt::ACCM if data.len() == 4 => OptionVerdict::Ack,
                // We pre-authenticated; refuse every auth protocol.
                lcp_opt::AUTH_PROTOCOL => OptionVerdict::Reject,
                lcp_opt::MAGIC_NUMBER if data.len() == 4 => {
                    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    if magic == self.magic {
                        // Possible loopback; ask for a different number.
                        OptionVerdict::Nak((rand::random::<u32>() | 1).to_be_bytes().to_vec())
                    } else {
                        OptionVerdict::Ack
                    }
                }
                lcp_opt::PFC | lcp_opt::ACFC if data.is_empty() => OptionVerdict::Ack,
                _ => OptionVerdict::Reject,
            },
            CpKind::Ipcp => match ty {
                ipcp_opt::IP_ADDRESS if data.len() == 4 => OptionVerdict::Ack,
                ipcp_opt::PRIMARY_DNS | ipcp_opt::SECONDARY_DNS if data.len() == 4 => {
                    OptionVerdict::Ack
                }
                ipcp_opt::IP_COMPRESSION => OptionVerdict::Reject,
                _ => OptionVerdict::Reject,
            },
            CpKind::Ipv6cp => match ty {
                ipv6cp_opt::INTERFACE_ID if data.len() == 8 => {
                    if data == self.ifid {
                        let other: [u8; 8] = rand::random();
                        OptionVerdict::Nak(other.to_vec())
                    } else {
                        OptionVerdict::Ack
                    }
                }
                _ => OptionVerdict::Reject,
            },
        }
    }

    fn apply_peer_option(&mut self, kind: CpKind, ty: u8, data: &[u8]) {
        match (kind, ty) {
            (CpKind::Lcp, lcp_opt::MRU) => {
                self.peer_mru = u16::from_be_bytes([data[0], data[1]]);
            }
            (CpKind::Lcp, lcp_opt::ACCM) => {
                self.tx_accm = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            }
            (CpKind::Lcp, lcp_opt::MAGIC_NUMBER) => {
                self.peer_magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            }
            (CpKind::Ipcp, ipcp_opt::IP_ADDRESS) => {
                self.peer_addr = Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
            }
            (CpKind::Ipv6cp, ipv6cp_opt::INTERFACE_ID) => {
                let mut ifid = [0u8; 8];
                ifid.copy_from_slice(data);
                self.peer_ifid = Some(ifid);
            }
            _ => {}
        }
    }

    fn absorb_nak(&mut self, kind: CpKind, ty: u8, data: &[u8]) {
        match (kind, ty) {
            (CpKind::Lcp, lcp_opt::MRU) if data.len() == 2 => {
                self.cfg.mru = u16::from_be_bytes([data[0], data[1]]);
            }
            (CpKind::Lcp, lcp_opt::MAGIC_NUMBER) => {
                self.magic = rand::random::<u32>() | 1;
            }
            (CpKind::Ipcp, ipcp_opt::IP_ADDRESS) if data.len() == 4 => {
                self.addr = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            }
            (CpKind::Ipcp, ipcp_opt::PRIMARY_DNS) if data.len() == 4 => {
                self.dns = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            }
            (CpKind::Ipv6cp, ipv6cp_opt::INTERFACE_ID) if data.len() == 8 => {
                self.ifid.copy_from_slice(data);
            }
            _ => {}
        }
    }

    fn absorb_reject(&mut self, kind: CpKind, ty: u8) {
        match (kind, ty) {
            (CpKind::Lcp, lcp_opt::ACCM) => self.send_accm = false,
            (CpKind::Lcp, lcp_opt::PFC) => self.send_pfc = false,
            (CpKind::Lcp, lcp_opt::ACFC) => self.send_acfc = false,
            (CpKind::Ipcp, ipcp_opt::PRIMARY_DNS) => self.send_dns = false,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PppConfig {
        PppConfig {
            addr: None,
            dns: Some(Ipv4Addr::new(1, 1, 1, 1)),
            ..Default::default()
        }
    }

    /// Shuttle frames between two engines until both are quiet.
    fn pump(a: &mut Ppp, b: &mut Ppp, now: Instant) {
        for _ in 0..64 {
            let mut moved = false;
            while let Some(f) = a.take_frame() {
                b.input(now, f.protocol, &f.payload);
                moved = true;
            }
            while let Some(f) = b.take_frame() {
                a.input(now, f.protocol, &f.payload);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn two_machines_converge_to_open() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);

        assert_eq!(a.lcp_state(), CpState::Opened);
        assert_eq!(b.lcp_state(), CpState::Opened);
        assert_eq!(a.phase(), Phase::Open);
        assert_eq!(b.phase(), Phase::Open);

        let mut saw_up = false;
        while let Some(ev) = a.take_event() {
            if let PppEvent::NetworkUp(params) = ev {
                saw_up = true;
                assert_eq!(params.peer_addr, Some(Ipv4Addr::new(192, 0, 2, 1)));
            }
        }
        assert!(saw_up);
    }

    #[test]
    fn auth_proposal_is_rejected() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        a.lower_up(now);
        while a.take_frame().is_some() {}

        // Peer proposes PAP (auth-protocol 0xC023).
        let opts = opts_bytes(&[(lcp_opt::AUTH_PROTOCOL, vec![0xC0, 0x23])]);
        a.input(now, proto::LCP, &cp_frame(proto::LCP, code::CONFIGURE_REQUEST, 7, &opts).payload);

        let reply = a.take_frame().expect("expected a reply");
        assert_eq!(reply.protocol, proto::LCP);
        assert_eq!(reply.payload[0], code::CONFIGURE_REJECT);
        assert_eq!(reply.payload[1], 7);
        assert_eq!(&reply.payload[4..], &opts[..]);
    }

    #[test]
    fn ipcp_nak_values_are_absorbed() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);

        // Run LCP to completion, then intercept IPCP.
        for _ in 0..64 {
            let fa = a.take_frame();
            let fb = b.take_frame();
            if fa.is_none() && fb.is_none() {
                break;
            }
            if let Some(f) = fa {
                if f.protocol == proto::IPCP && f.payload[0] == code::CONFIGURE_REQUEST {
                    // NAK the address with the gateway's assignment.
                    let naked = opts_bytes(&[(
                        ipcp_opt::IP_ADDRESS,
                        vec![172, 16, 1, 1],
                    )]);
                    a.input(
                        now,
                        proto::IPCP,
                        &cp_frame(proto::IPCP, code::CONFIGURE_NAK, f.payload[1], &naked).payload,
                    );
                    continue;
                }
                b.input(now, f.protocol, &f.payload);
            }
            if let Some(f) = fb {
                a.input(now, f.protocol, &f.payload);
            }
        }

        // The next IPCP request from `a` proposes the NAKed address.
        assert_eq!(a.addr, Ipv4Addr::new(172, 16, 1, 1));
    }

    #[test]
    fn negotiation_timeout_fails_the_protocol() {
        let start = Instant::now();
        let mut a = Ppp::new(PppConfig {
            max_configure: 3,
            restart_timer: Duration::from_millis(10),
            ..cfg()
        });
        a.lower_up(start);
        while a.take_frame().is_some() {}

        let mut now = start;
        for _ in 0..16 {
            now += Duration::from_secs(10);
            a.poll_timers(now);
            while a.take_frame().is_some() {}
        }

        assert_eq!(a.lcp_state(), CpState::Closed);
        let mut failed = false;
        while let Some(ev) = a.take_event() {
            if matches!(ev, PppEvent::NegotiationFailed("LCP")) {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[test]
    fn echo_keepalive_and_dpd_timeout() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);
        assert!(a.is_open());
        while a.take_event().is_some() {}

        // First echo goes out after the dpd interval.
        let mut t = now + Duration::from_secs(11);
        a.poll_timers(t);
        let echo = a.take_frame().expect("echo request");
        assert_eq!(echo.payload[0], code::ECHO_REQUEST);

        // No replies: after dpd_fail_count misses the link terminates.
        for _ in 0..4 {
            t += Duration::from_secs(11);
            a.poll_timers(t);
            while a.take_frame().is_some() {}
        }
        let mut timed_out = false;
        while let Some(ev) = a.take_event() {
            if ev == PppEvent::EchoTimeout {
                timed_out = true;
            }
        }
        assert!(timed_out);
        // Depending on timing the terminate deadline may already have fired.
        assert!(matches!(a.phase(), Phase::Terminate | Phase::Dead));
    }

    #[test]
    fn echo_reply_resets_the_miss_counter() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);

        let mut t = now;
        for _ in 0..10 {
            t += Duration::from_secs(11);
            a.poll_timers(t);
            // The peer answers every echo.
            while let Some(f) = a.take_frame() {
                b.input(t, f.protocol, &f.payload);
            }
            while let Some(f) = b.take_frame() {
                a.input(t, f.protocol, &f.payload);
            }
        }
        while let Some(ev) = a.take_event() {
            assert_ne!(ev, PppEvent::EchoTimeout);
        }
        assert!(a.is_open());
    }

    #[test]
    fn terminate_handshake_reaches_dead() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);
        while a.take_event().is_some() {}

        a.close(now);
        let term = a.take_frame().expect("terminate request");
        assert_eq!(term.payload[0], code::TERMINATE_REQUEST);
        b.input(now, term.protocol, &term.payload);
        let ack = b.take_frame().expect("terminate ack");
        assert_eq!(ack.payload[0], code::TERMINATE_ACK);
        a.input(now, ack.protocol, &ack.payload);

        assert_eq!(a.phase(), Phase::Dead);
        let mut terminated = false;
        while let Some(ev) = a.take_event() {
            if ev == PppEvent::Terminated {
                terminated = true;
            }
        }
        assert!(terminated);
    }

    #[test]
    fn terminate_timeout_still_reaches_dead() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);

        a.close(now);
        a.poll_timers(now + Duration::from_secs(3));
        assert_eq!(a.phase(), Phase::Dead);
    }

    #[test]
    fn peer_terminate_request_is_acked() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);

        b.close(now);
        let term = b.take_frame().unwrap();
        a.input(now, term.protocol, &term.payload);
        let ack = a.take_frame().unwrap();
        assert_eq!(ack.payload[0], code::TERMINATE_ACK);
        assert_eq!(a.phase(), Phase::Dead);
    }

    #[test]
    fn unknown_protocol_is_protocol_rejected() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);
        while a.take_frame().is_some() {}

        a.input(now, 0x80FD, &[0x01, 0x01, 0x00, 0x04]);
        let rej = a.take_frame().expect("protocol reject");
        assert_eq!(rej.protocol, proto::LCP);
        assert_eq!(rej.payload[0], code::PROTOCOL_REJECT);
        assert_eq!(&rej.payload[4..6], &[0x80, 0xFD]);
    }

    #[test]
    fn accm_is_surfaced_after_peer_request_acked() {
        let now = Instant::now();
        let mut a = Ppp::new(cfg());
        let mut b = Ppp::new(PppConfig {
            addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..cfg()
        });
        a.lower_up(now);
        b.lower_up(now);
        pump(&mut a, &mut b, now);

        let (tx, rx) = a.take_accm().expect("accm ready");
        assert_eq!(tx, 0); // peer proposed an empty map
        assert_eq!(rx, 0);
        assert!(a.take_accm().is_none());
    }
}
