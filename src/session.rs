//! Session lifecycle and the public face of the transport core.
//!
//! A [`Session`] is built from what the authentication collaborator
//! delivered: endpoint, dialect, cookie and the parsed tunnel
//! configuration. `connect` consumes the cookie, establishes the stream
//! transport and hands the running tunnel to a background task owned by the
//! returned [`SessionHandle`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::{Dialect, Endpoint, SessionOptions, TunnelConfig, MAX_COOKIE_LEN};
use crate::error::{Error, Result};
use crate::helper::HelperConfig;
use crate::manager::TransportManager;
use crate::ppp::NetworkParams;
use crate::tun::TunHandle;

/// Lifecycle states of the transport manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Init,
    StreamConnecting,
    StreamEstablished,
    DatagramProbing,
    DatagramEstablished,
    Running,
    Closing,
    Closed,
}

/// Events delivered to the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Lifecycle progress.
    State(Lifecycle),
    /// The datagram path was promoted to the active data transport.
    DatagramUp,
    /// The datagram path failed or was disabled; traffic is back on the
    /// stream transport.
    DatagramDown,
    /// PPP negotiation finished and the tunnel interface is plumbed.
    NetworkUp(NetworkParams),
    /// Terminal event: the session is gone. `error` carries the
    /// machine-readable tag of the first fatal error, or `None` for a
    /// user-initiated close.
    Closed { error: Option<String> },
}

/// Live counters, shared with the event loop.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub stream_tx_bytes: AtomicU64,
    pub stream_rx_bytes: AtomicU64,
    pub datagram_tx_bytes: AtomicU64,
    pub datagram_rx_bytes: AtomicU64,
    pub bad_hmac: AtomicU64,
    pub replay: AtomicU64,
    pub malformed: AtomicU64,
    pub keepalives_dropped: AtomicU64,
    pub tun_dropped: AtomicU64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            stream_tx_bytes: self.stream_tx_bytes.load(Ordering::Relaxed),
            stream_rx_bytes: self.stream_rx_bytes.load(Ordering::Relaxed),
            datagram_tx_bytes: self.datagram_tx_bytes.load(Ordering::Relaxed),
            datagram_rx_bytes: self.datagram_rx_bytes.load(Ordering::Relaxed),
            bad_hmac: self.bad_hmac.load(Ordering::Relaxed),
            replay: self.replay.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            keepalives_dropped: self.keepalives_dropped.load(Ordering::Relaxed),
            tun_dropped: self.tun_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub stream_tx_bytes: u64,
    pub stream_rx_bytes: u64,
    pub datagram_tx_bytes: u64,
    pub datagram_rx_bytes: u64,
    pub bad_hmac: u64,
    pub replay: u64,
    pub malformed: u64,
    pub keepalives_dropped: u64,
    pub tun_dropped: u64,
}

/// Handle to a connected session.
pub struct SessionHandle {
    events: mpsc::Receiver<TunnelEvent>,
    close: mpsc::Sender<()>,
    stats: Arc<SessionStats>,
}

impl SessionHandle {
    pub(crate) fn new(
        events: mpsc::Receiver<TunnelEvent>,
        close: mpsc::Sender<()>,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            events,
            close,
            stats,
        }
    }

    /// Next tunnel event; `None` once the event loop is gone.
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }

    /// Request a graceful close. Idempotent.
    pub fn close(&self) {
        let _ = self.close.try_send(());
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Drive events until the terminal `Closed` event and return its error
    /// tag.
    pub async fn wait_closed(&mut self) -> Option<String> {
        while let Some(ev) = self.next_event().await {
            if let TunnelEvent::Closed { error } = ev {
                return error;
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Fresh,
    Consumed,
}

/// A single tunnel session: one cookie, one connect.
pub struct Session {
    pub endpoint: Endpoint,
    pub dialect: Dialect,
    pub config: TunnelConfig,
    pub options: SessionOptions,
    cookie: Vec<u8>,
    state: SessionState,
}

impl Session {
    /// Build a session from the authentication collaborator's output.
    pub fn new(
        endpoint: Endpoint,
        dialect: Dialect,
        cookie: impl Into<Vec<u8>>,
        config: TunnelConfig,
    ) -> Result<Self> {
        let cookie = cookie.into();
        if cookie.is_empty() {
            return Err(Error::config("empty session cookie"));
        }
        if cookie.len() > MAX_COOKIE_LEN {
            return Err(Error::config(format!(
                "session cookie exceeds {MAX_COOKIE_LEN} bytes"
            )));
        }
        Ok(Self {
            endpoint,
            dialect,
            config,
            options: SessionOptions::default(),
            cookie,
            state: SessionState::Fresh,
        })
    }

    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    /// Establish the tunnel and spawn its event loop.
    ///
    /// The cookie is single-use: the supported gateways invalidate it on
    /// the first tunnel setup, so a second `connect` on the same session
    /// fails with `CookieExpired` instead of silently reauthenticating.
    pub async fn connect(
        &mut self,
        tun: TunHandle,
        helper_program: Option<PathBuf>,
    ) -> Result<SessionHandle> {
        if self.state != SessionState::Fresh {
            return Err(Error::CookieExpired);
        }
        self.state = SessionState::Consumed;

        let helper = HelperConfig {
            program: helper_program,
            timeout: None,
        };
        let (events_tx, events_rx) = mpsc::channel(64);
        let (close_tx, close_rx) = mpsc::channel(1);
        let stats = Arc::new(SessionStats::default());

        let manager = TransportManager::establish(
            self.endpoint.clone(),
            self.dialect,
            self.cookie.clone(),
            self.config.clone(),
            self.options.clone(),
            tun,
            helper,
            events_tx,
            close_rx,
            stats.clone(),
        )
        .await?;

        info!(endpoint = %self.endpoint, dialect = ?self.dialect, "session established");
        tokio::spawn(manager.run());

        Ok(SessionHandle::new(events_rx, close_tx, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_size_is_bounded() {
        let endpoint = Endpoint::new("gw", 443);
        assert!(Session::new(
            endpoint.clone(),
            Dialect::Fortinet,
            vec![0u8; MAX_COOKIE_LEN + 1],
            TunnelConfig::default()
        )
        .is_err());
        assert!(Session::new(
            endpoint.clone(),
            Dialect::Fortinet,
            b"".to_vec(),
            TunnelConfig::default()
        )
        .is_err());
        assert!(Session::new(
            endpoint,
            Dialect::Fortinet,
            b"cookie".to_vec(),
            TunnelConfig::default()
        )
        .is_ok());
    }

    #[tokio::test]
    async fn reconnect_fails_with_cookie_expired() {
        let mut session = Session::new(
            Endpoint::new("127.0.0.1", 1), // nothing listens here
            Dialect::Fortinet,
            b"cookie".to_vec(),
            TunnelConfig::default(),
        )
        .unwrap();
        session.options.plain_transport = true;
        session.options.connect_timeout_secs = 1;

        // First connect fails at the TCP level and still consumes the
        // cookie.
        let (core, _driver) = TunHandle::pair("tun0", 8);
        assert!(session.connect(core, None).await.is_err());

        let (core, _driver) = TunHandle::pair("tun0", 8);
        assert!(matches!(
            session.connect(core, None).await,
            Err(Error::CookieExpired)
        ));
    }
}
