//! Transport manager: the single-task event loop owning the session.
//!
//! One task owns the stream transport, the optional datagram transport, the
//! PPP engine, both crypto contexts and the outbound queue; nothing here is
//! shared across threads, so none of it is locked. Each loop iteration
//! first pumps the PPP engine (frames out, events up), then waits on
//! `{stream, datagram, tun, earliest-timer}` and processes the source that
//! woke it with a bounded per-source budget so no source can starve the
//! others.
//!
//! The datagram path is strictly a performance optimization: it is probed
//! opportunistically after the stream is up, promoted to the active data
//! transport when its handshake completes, and demoted for good (a retry
//! would need fresh keying material) the moment it misbehaves. The stream
//! transport is the session: losing it is fatal.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{Dialect, Endpoint, SessionOptions, TunnelConfig};
use crate::crypto::{self, CryptoIn, CryptoOut, NEXT_HEADER_IPV4, NEXT_HEADER_IPV6};
use crate::error::{Error, Result};
use crate::framing::{Frame, Framer};
use crate::helper::{build_env, run_helper, HelperConfig};
use crate::packet::{fragment_ipv4, FragmentResult, Origin, Packet, PacketQueue, PushOutcome};
use crate::ppp::{proto, Ppp, PppConfig, PppEvent};
use crate::session::{Lifecycle, SessionStats, TunnelEvent};
use crate::transport::{
    build_client_hello, parse_server_hello, DatagramTransport, ServerHello, StreamTransport,
};
use crate::tun::TunHandle;

/// Packets processed per source per wakeup.
const RECV_BUDGET: usize = 32;

/// Soft cap of the outbound datagram queue.
const OUTQ_CAP: usize = 64;

/// How long a blocked datagram send may hold the loop before the frame goes
/// back to the queue head.
const WRITABLE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DgramState {
    /// Not probed (dialect or options say no).
    Off,
    /// clthello sent, waiting for svrhello.
    Probing { deadline: Instant },
    /// Promoted: the active data transport.
    Active,
    /// Failed; stays off for the rest of the session.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivePath {
    Stream,
    Datagram,
}

enum Wake {
    Close,
    Stream(Result<Frame>),
    Dgram(Result<usize>),
    Tun(Option<Vec<u8>>),
    Timer,
}

pub(crate) struct TransportManager {
    endpoint: Endpoint,
    dialect: Dialect,
    config: TunnelConfig,
    stream: StreamTransport,
    datagram: Option<DatagramTransport>,
    dgram_state: DgramState,
    dgram_framer: Framer,
    dgram_buf: Vec<u8>,
    crypto: Option<(CryptoOut, CryptoIn)>,
    active: ActivePath,
    ppp: Ppp,
    tun: TunHandle,
    helper: HelperConfig,
    helper_connected: bool,
    outq: PacketQueue,
    state: Lifecycle,
    events: mpsc::Sender<TunnelEvent>,
    close_rx: mpsc::Receiver<()>,
    stats: Arc<SessionStats>,
    heartbeat_due: Option<Instant>,
    network: Option<crate::ppp::NetworkParams>,
    first_error: Option<Error>,
    closing: bool,
    done: bool,
    // Datagram byte counters survive transport teardown.
    dgram_tx_accum: u64,
    dgram_rx_accum: u64,
}

impl TransportManager {
    /// Connect the stream transport, send the tunnel request, kick off PPP
    /// and (when the dialect has one) the datagram probe.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn establish(
        endpoint: Endpoint,
        dialect: Dialect,
        cookie: Vec<u8>,
        config: TunnelConfig,
        options: SessionOptions,
        tun: TunHandle,
        helper: HelperConfig,
        events: mpsc::Sender<TunnelEvent>,
        close_rx: mpsc::Receiver<()>,
        stats: Arc<SessionStats>,
    ) -> Result<Self> {
        let _ = events.send(TunnelEvent::State(Lifecycle::StreamConnecting)).await;
        let mut stream =
            StreamTransport::connect(&endpoint, dialect, config.mtu, &options).await?;
        let _ = events
            .send(TunnelEvent::State(Lifecycle::StreamEstablished))
            .await;

        let request = options
            .stream_request
            .clone()
            .unwrap_or_else(|| dialect.stream_request(&endpoint.host));
        stream.start_tunnel(&request).await?;

        // The crypto contexts are built up front so an unsupported suite
        // fails the session at initialization, not mid-probe.
        let crypto = if dialect.datagram_uses_crypto() {
            match &config.datagram_crypto {
                Some(params) => Some(crypto::contexts(params)?),
                None => None,
            }
        } else {
            None
        };

        let mut ppp = Ppp::new(PppConfig {
            mru: config.mtu,
            want_ipv4: true,
            want_ipv6: config.addr6.is_some(),
            addr: config.addr,
            dns: config.primary_dns4(),
            ifid: config.ifid(),
            dpd_interval: config.dpd_interval(),
            dpd_fail_count: config.dpd_fail_count,
            ..Default::default()
        });
        ppp.lower_up(Instant::now());

        let mut manager = Self {
            dgram_framer: Framer::for_dialect(dialect, config.mtu),
            endpoint,
            dialect,
            config,
            stream,
            datagram: None,
            dgram_state: DgramState::Off,
            dgram_buf: vec![0u8; crate::transport::datagram::MAX_DATAGRAM],
            crypto,
            active: ActivePath::Stream,
            ppp,
            tun,
            helper,
            helper_connected: false,
            outq: PacketQueue::new(OUTQ_CAP),
            state: Lifecycle::StreamEstablished,
            events,
            close_rx,
            stats,
            heartbeat_due: None,
            network: None,
            first_error: None,
            closing: false,
            done: false,
            dgram_tx_accum: 0,
            dgram_rx_accum: 0,
        };
        manager.start_datagram_probe(&cookie, &options).await;
        Ok(manager)
    }

    /// Probe failures are never fatal; the tunnel stays on the stream.
    async fn start_datagram_probe(&mut self, cookie: &[u8], options: &SessionOptions) {
        if !self.dialect.supports_datagram() || options.no_datagram {
            return;
        }
        if self.dialect.datagram_uses_crypto() && self.crypto.is_none() {
            debug!("no datagram keying material delivered, staying on stream");
            return;
        }

        let result = async {
            let mut dgram =
                DatagramTransport::connect(&self.endpoint.host, self.endpoint.port).await?;
            dgram.send(&build_client_hello(cookie)).await?;
            Ok::<_, Error>(dgram)
        }
        .await;

        match result {
            Ok(dgram) => {
                let deadline = Instant::now() + self.config.client_hello_timeout();
                self.datagram = Some(dgram);
                self.dgram_state = DgramState::Probing { deadline };
                self.set_state(Lifecycle::DatagramProbing).await;
            }
            Err(e) => {
                warn!(error = %e, "datagram probe setup failed");
                self.dgram_state = DgramState::Disabled;
            }
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if let Err(e) = self.pump_ppp().await {
                self.fatal(e).await;
            }
            if let Err(e) = self.flush_outq().await {
                self.fatal(e).await;
            }
            self.sync_stats();
            if self.done {
                break;
            }

            let wake = self.wait().await;
            if let Err(e) = self.handle_wake(wake).await {
                self.fatal(e).await;
            }
        }
        self.finish().await;
    }

    async fn wait(&mut self) -> Wake {
        let deadline = self.next_deadline();
        // Reading the interface only while the outbound queue has headroom
        // gives producers backpressure instead of drops.
        let tun_live =
            self.ppp.is_open() && !self.closing && self.outq.len() + RECV_BUDGET <= OUTQ_CAP;
        let dgram_live = self.datagram.is_some()
            && matches!(
                self.dgram_state,
                DgramState::Probing { .. } | DgramState::Active
            );

        let Self {
            stream,
            datagram,
            tun,
            close_rx,
            dgram_buf,
            ..
        } = self;

        tokio::select! {
            biased;
            _ = close_rx.recv() => Wake::Close,
            r = stream.recv_frame() => Wake::Stream(r),
            r = async { datagram.as_mut().expect("guarded").recv(dgram_buf).await },
                if dgram_live => Wake::Dgram(r),
            pkt = tun.recv(), if tun_live => Wake::Tun(pkt),
            _ = tokio::time::sleep_until(deadline.into()) => Wake::Timer,
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut next = Instant::now() + Duration::from_secs(60);
        if let Some(d) = self.ppp.next_deadline() {
            next = next.min(d);
        }
        if let DgramState::Probing { deadline } = self.dgram_state {
            next = next.min(deadline);
        }
        if let Some(d) = self.heartbeat_due {
            next = next.min(d);
        }
        next
    }

    async fn handle_wake(&mut self, wake: Wake) -> Result<()> {
        match wake {
            Wake::Close => {
                debug!("close requested");
                self.begin_close().await;
            }
            Wake::Stream(Ok(frame)) => {
                self.handle_frame(Origin::Stream, frame)?;
                for _ in 1..RECV_BUDGET {
                    match self.stream.try_next_frame()? {
                        Some(frame) => self.handle_frame(Origin::Stream, frame)?,
                        None => break,
                    }
                }
            }
            Wake::Stream(Err(e)) => return Err(e),
            Wake::Dgram(Ok(n)) => {
                let data = self.dgram_buf[..n].to_vec();
                self.handle_datagram(&data).await;
                for _ in 1..RECV_BUDGET {
                    let more = match self.datagram.as_mut() {
                        Some(d) => d.try_recv(&mut self.dgram_buf),
                        None => break,
                    };
                    match more {
                        Ok(Some(n)) => {
                            let data = self.dgram_buf[..n].to_vec();
                            self.handle_datagram(&data).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            self.demote(e).await;
                            break;
                        }
                    }
                }
            }
            Wake::Dgram(Err(e)) => self.demote(e).await,
            Wake::Tun(Some(pkt)) => {
                self.handle_tun_packet(pkt).await?;
                for _ in 1..RECV_BUDGET {
                    match self.tun.try_recv() {
                        Some(pkt) => self.handle_tun_packet(pkt).await?,
                        None => break,
                    }
                }
            }
            Wake::Tun(None) => {
                debug!("virtual interface handle dropped");
                self.begin_close().await;
            }
            Wake::Timer => self.handle_timers().await?,
        }
        Ok(())
    }

    async fn handle_timers(&mut self) -> Result<()> {
        let now = Instant::now();
        self.ppp.poll_timers(now);

        if let DgramState::Probing { deadline } = self.dgram_state {
            if now >= deadline {
                self.disable_datagram("no svrhello before the client-hello timeout")
                    .await;
            }
        }

        if self.dgram_state == DgramState::Active {
            if let Some(due) = self.heartbeat_due {
                if now >= due {
                    let sent = self
                        .datagram
                        .as_mut()
                        .map(|d| d.try_send(&crate::transport::datagram::HEARTBEAT));
                    match sent {
                        Some(Ok(Some(_))) => {
                            trace!("datagram heartbeat");
                            self.heartbeat_due = Some(now + self.config.dpd_interval());
                        }
                        Some(Ok(None)) => {
                            // Keepalives may be dropped under pressure.
                            self.stats.keepalives_dropped.fetch_add(1, Ordering::Relaxed);
                            self.heartbeat_due = Some(now + self.config.dpd_interval());
                        }
                        Some(Err(e)) => self.demote(e).await,
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// A complete frame arrived on either transport.
    fn handle_frame(&mut self, origin: Origin, frame: Frame) -> Result<()> {
        match frame.protocol {
            proto::IPV4 | proto::IPV6 => {
                if self.ppp.is_open() {
                    if !self.tun.try_send(frame.payload) {
                        self.stats.tun_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    trace!(?origin, "data frame before network phase, dropped");
                }
            }
            _ => {
                self.ppp.input(Instant::now(), frame.protocol, &frame.payload);
            }
        }
        Ok(())
    }

    /// One datagram arrived. Never fatal: per-packet errors are counted and
    /// the packet dropped; transport errors demote.
    async fn handle_datagram(&mut self, data: &[u8]) {
        // Sub-header datagrams are heartbeats or noise.
        if data.len() < 6 {
            trace!(len = data.len(), "short datagram ignored");
            return;
        }

        match self.dgram_state {
            DgramState::Probing { .. } => {
                match parse_server_hello(data) {
                    Some(ServerHello::Ok) => self.promote().await,
                    Some(ServerHello::Fail(status)) => {
                        self.disable_datagram(&format!("svrhello status {status:?}")).await;
                    }
                    None => {
                        // The ok packet may have been lost; a decodable PPP
                        // frame proves the gateway moved on without it.
                        match self.decode_datagram_frame(data) {
                            Ok(Some(frame)) => {
                                debug!("PPP frame during probe, treating as svrhello ok");
                                self.promote().await;
                                let _ = self.handle_frame(Origin::Datagram, frame);
                            }
                            _ => {
                                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
            DgramState::Active => match self.decode_datagram_frame(data) {
                Ok(Some(frame)) => {
                    let _ = self.handle_frame(Origin::Datagram, frame);
                }
                Ok(None) => {}
                Err(Error::BadHmac) => {
                    self.stats.bad_hmac.fetch_add(1, Ordering::Relaxed);
                }
                Err(Error::Replay) => {
                    self.stats.replay.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                }
            },
            DgramState::Off | DgramState::Disabled => {
                // Stray traffic after a drain (e.g. a late svrhello).
                trace!("datagram on inactive path ignored");
            }
        }
    }

    fn decode_datagram_frame(&mut self, data: &[u8]) -> Result<Option<Frame>> {
        match self.crypto.as_mut() {
            Some((_, inbound)) => {
                let mut pkt = Packet::from_payload(Origin::Datagram, data);
                inbound.decrypt(&mut pkt)?;
                self.dgram_framer.decode_one(pkt.payload())
            }
            None => self.dgram_framer.decode_one(data),
        }
    }

    /// An IP packet came off the virtual interface.
    async fn handle_tun_packet(&mut self, pkt: Vec<u8>) -> Result<()> {
        if !self.ppp.is_open() {
            return Ok(());
        }
        match pkt.first().map(|b| b >> 4) {
            Some(4) => match fragment_ipv4(&pkt, self.config.mtu as usize) {
                FragmentResult::Fits => self.send_data(proto::IPV4, &pkt).await?,
                FragmentResult::Fragmented(frags) => {
                    trace!(count = frags.len(), "fragmented oversized packet");
                    for frag in frags {
                        self.send_data(proto::IPV4, &frag).await?;
                    }
                }
                FragmentResult::DontFragment => {
                    debug!(len = pkt.len(), "DF packet exceeds tunnel MTU, dropped");
                    self.stats.tun_dropped.fetch_add(1, Ordering::Relaxed);
                }
                FragmentResult::Invalid => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                }
            },
            Some(6) => self.send_data(proto::IPV6, &pkt).await?,
            _ => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Send a data or control frame on the active transport.
    async fn send_data(&mut self, protocol: u16, payload: &[u8]) -> Result<()> {
        if self.active == ActivePath::Datagram {
            match self.send_via_datagram(protocol, payload) {
                Ok(()) => return Ok(()),
                Err(Error::SeqWrapped) => return Err(Error::SeqWrapped),
                Err(e) => {
                    self.demote(e).await;
                    // Fall through to the stream for this frame.
                }
            }
        }
        self.stream.send_frame(protocol, payload).await
    }

    /// Frame, optionally encrypt, and queue/send one datagram.
    fn send_via_datagram(&mut self, protocol: u16, payload: &[u8]) -> Result<()> {
        let framed = self.dgram_framer.encode(protocol, payload)?;
        let wire = match self.crypto.as_mut() {
            Some((outbound, _)) => {
                let next_header = if protocol == proto::IPV6 {
                    NEXT_HEADER_IPV6
                } else {
                    NEXT_HEADER_IPV4
                };
                let mut pkt = Packet::from_payload(Origin::Tun, &framed);
                outbound.encrypt(&mut pkt, next_header)?;
                pkt.into_payload()
            }
            None => framed,
        };

        let dgram = self
            .datagram
            .as_mut()
            .ok_or_else(|| Error::datagram("datagram transport gone"))?;

        if self.outq.is_empty() {
            if dgram.try_send(&wire)?.is_some() {
                return Ok(());
            }
        }
        // Socket busy or frames already queued: preserve order.
        let queued = Packet::from_payload(Origin::Tun, &wire);
        if self.outq.push(queued) == PushOutcome::Full {
            warn!("outbound datagram queue full, dropping frame");
            self.stats.tun_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drain the outbound datagram queue without letting a blocked socket
    /// stall the loop for more than a grace period.
    async fn flush_outq(&mut self) -> Result<()> {
        while let Some(pkt) = self.outq.pop() {
            let dgram = match self.datagram.as_mut() {
                Some(d) => d,
                None => {
                    self.outq.clear();
                    return Ok(());
                }
            };
            match dgram.try_send(pkt.payload()) {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    let writable =
                        tokio::time::timeout(WRITABLE_GRACE, dgram.writable()).await;
                    let retry = match writable {
                        Ok(Ok(())) => dgram.try_send(pkt.payload()),
                        Ok(Err(e)) => Err(e),
                        Err(_elapsed) => Ok(None),
                    };
                    match retry {
                        Ok(Some(_)) => continue,
                        Ok(None) => {
                            self.outq.requeue_front(pkt);
                            return Ok(());
                        }
                        Err(e) => {
                            self.demote(e).await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    self.demote(e).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Drain frames and events out of the PPP engine.
    async fn pump_ppp(&mut self) -> Result<()> {
        if let Some((tx, rx)) = self.ppp.take_accm() {
            debug!(tx = format_args!("{tx:#010x}"), "applying negotiated ACCM");
            self.stream.set_accm(tx, rx);
            self.dgram_framer.set_accm(tx, rx);
        }

        while let Some(frame) = self.ppp.take_frame() {
            self.send_data(frame.protocol, &frame.payload).await?;
        }

        while let Some(event) = self.ppp.take_event() {
            match event {
                PppEvent::PhaseChange(phase) => {
                    trace!(?phase, "ppp phase");
                }
                PppEvent::NetworkUp(params) => {
                    if !self.config.split_dns.is_empty() {
                        warn!("gateway sent split-DNS configuration (not implemented)");
                    }
                    let env = build_env(
                        "connect",
                        &self.endpoint.host,
                        self.tun.name(),
                        &self.config,
                        &params,
                    );
                    run_helper(&self.helper, &env).await?;
                    self.helper_connected = true;
                    info!(addr = ?params.addr, "tunnel up");
                    self.network = Some(params.clone());
                    self.set_state(Lifecycle::Running).await;
                    let _ = self.events.send(TunnelEvent::NetworkUp(params)).await;
                }
                PppEvent::NegotiationFailed(which) => {
                    return Err(Error::PppTimeout(which));
                }
                PppEvent::EchoTimeout => {
                    // The engine already sent its Terminate-Request.
                    return Err(Error::PppTimeout("dpd"));
                }
                PppEvent::Terminated => {
                    debug!("ppp link terminated");
                    self.done = true;
                }
            }
        }
        Ok(())
    }

    async fn promote(&mut self) {
        info!("datagram handshake complete, promoting");
        self.dgram_state = DgramState::Active;
        self.active = ActivePath::Datagram;
        self.heartbeat_due = Some(Instant::now() + self.config.dpd_interval());
        self.set_state(Lifecycle::DatagramEstablished).await;
        let _ = self.events.send(TunnelEvent::DatagramUp).await;
    }

    /// Probe-phase failure: never carried data, nothing to demote.
    async fn disable_datagram(&mut self, reason: &str) {
        warn!(reason, "datagram path disabled");
        self.teardown_datagram();
        let _ = self.events.send(TunnelEvent::DatagramDown).await;
    }

    /// Post-promotion failure: back to the stream transport. PPP state is
    /// preserved; the crypto contexts are not.
    async fn demote(&mut self, error: Error) {
        if self.dgram_state == DgramState::Disabled {
            return;
        }
        warn!(%error, "datagram transport failed, demoting to stream");
        self.teardown_datagram();
        let _ = self.events.send(TunnelEvent::DatagramDown).await;
    }

    fn teardown_datagram(&mut self) {
        if let Some(mut d) = self.datagram.take() {
            self.dgram_tx_accum += d.bytes_sent();
            self.dgram_rx_accum += d.bytes_received();
            d.close();
        }
        self.crypto = None;
        self.dgram_state = DgramState::Disabled;
        self.active = ActivePath::Stream;
        self.heartbeat_due = None;
        self.outq.clear();
    }

    /// Start the graceful close sequence: LCP Terminate-Request with a
    /// deadline, datagram closed immediately, stream last.
    async fn begin_close(&mut self) {
        if self.closing || self.done {
            return;
        }
        self.closing = true;
        self.set_state(Lifecycle::Closing).await;

        if self.datagram.is_some() {
            self.teardown_datagram();
        }
        self.outq.clear();

        if self.ppp.phase() == crate::ppp::Phase::Dead {
            self.done = true;
        } else {
            self.ppp.close(Instant::now());
        }
    }

    async fn fatal(&mut self, error: Error) {
        if !error.is_fatal() {
            return;
        }
        if self.closing {
            // Errors during teardown are part of the teardown.
            debug!(%error, "error while closing");
            self.done = true;
            return;
        }
        warn!(%error, tag = error.tag(), "fatal session error");
        let stream_dead = matches!(
            error,
            Error::TransportFailed(_)
                | Error::ConfigRejected(_)
                | Error::Io(_)
                | Error::Tls(_)
        );
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
        if stream_dead {
            self.closing = true;
            self.done = true;
            self.set_state(Lifecycle::Closing).await;
        } else {
            self.begin_close().await;
        }
    }

    async fn finish(&mut self) {
        if self.helper_connected {
            let params = self.network.clone().unwrap_or_default();
            let env = build_env(
                "disconnect",
                &self.endpoint.host,
                self.tun.name(),
                &self.config,
                &params,
            );
            if let Err(e) = run_helper(&self.helper, &env).await {
                warn!(error = %e, "disconnect helper failed");
            }
            self.helper_connected = false;
        }

        self.teardown_datagram();
        self.stream.close().await;
        self.sync_stats();

        let error = self.first_error.as_ref().map(|e| e.tag().to_string());
        info!(dropped = self.outq.dropped(), error = ?error, "session closed");
        self.set_state(Lifecycle::Closed).await;
        let _ = self.events.send(TunnelEvent::Closed { error }).await;
    }

    async fn set_state(&mut self, state: Lifecycle) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "lifecycle");
            self.state = state;
            let _ = self.events.send(TunnelEvent::State(state)).await;
        }
    }

    fn sync_stats(&self) {
        let s = &self.stats;
        s.stream_tx_bytes
            .store(self.stream.bytes_sent(), Ordering::Relaxed);
        s.stream_rx_bytes
            .store(self.stream.bytes_received(), Ordering::Relaxed);
        let (dtx, drx) = match &self.datagram {
            Some(d) => (d.bytes_sent(), d.bytes_received()),
            None => (0, 0),
        };
        s.datagram_tx_bytes
            .store(self.dgram_tx_accum + dtx, Ordering::Relaxed);
        s.datagram_rx_bytes
            .store(self.dgram_rx_accum + drx, Ordering::Relaxed);
    }
}
