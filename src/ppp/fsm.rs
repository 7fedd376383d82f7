//! Per-protocol PPP control machine bookkeeping (RFC 1661).
//!
//! One [`Cp`] instance tracks the negotiation state, identifiers and the
//! restart timer of a single control protocol (LCP, IPCP or IPV6CP). The
//! option semantics live with the owner; this type only knows the automaton.

use std::time::{Duration, Instant};

/// Negotiation states of a control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpState {
    /// Lower layer down or the protocol is unused/disabled.
    Closed,
    /// Waiting for the lower layer before sending the first request.
    Starting,
    /// Our Configure-Request is outstanding.
    ReqSent,
    /// Peer acknowledged our request; theirs is still outstanding.
    AckReceived,
    /// We acknowledged the peer's request; ours is still outstanding.
    AckSent,
    /// Both sides acknowledged; the protocol is up.
    Opened,
    /// Our Terminate-Request is outstanding.
    Terminating,
}

impl CpState {
    /// Whether a Configure-Request of ours is in flight.
    pub fn negotiating(&self) -> bool {
        matches!(self, CpState::ReqSent | CpState::AckReceived | CpState::AckSent)
    }
}

/// Control-protocol automaton state shared by LCP and the NCPs.
#[derive(Debug)]
pub struct Cp {
    pub name: &'static str,
    pub state: CpState,
    next_id: u8,
    /// Identifier of the outstanding Configure-Request.
    pub req_id: u8,
    /// Identifier of the outstanding Terminate-Request.
    pub term_id: u8,
    attempts: u32,
    max_configure: u32,
    restart_timer: Duration,
    /// When the current request should be retransmitted or abandoned.
    pub deadline: Option<Instant>,
}

impl Cp {
    pub fn new(name: &'static str, max_configure: u32, restart_timer: Duration) -> Self {
        Self {
            name,
            state: CpState::Closed,
            next_id: 1,
            req_id: 0,
            term_id: 0,
            attempts: 0,
            max_configure,
            restart_timer,
            deadline: None,
        }
    }

    pub fn next_id(&mut self) -> u8 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Record a (re)transmitted Configure-Request and arm the restart timer
    /// with exponential backoff.
    pub fn sent_configure_request(&mut self, now: Instant, id: u8) {
        self.req_id = id;
        let exp = self.attempts.min(6);
        self.deadline = Some(now + self.restart_timer * 2u32.pow(exp));
        self.attempts += 1;
    }

    /// Whether the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.attempts > self.max_configure
    }

    pub fn reset_retries(&mut self) {
        self.attempts = 0;
        self.deadline = None;
    }

    /// Record a transmitted Terminate-Request with its fixed deadline.
    pub fn sent_terminate_request(&mut self, now: Instant, id: u8, timeout: Duration) {
        self.term_id = id;
        self.state = CpState::Terminating;
        self.deadline = Some(now + timeout);
    }

    pub fn enter(&mut self, state: CpState) {
        if state == CpState::Opened || state == CpState::Closed {
            self.reset_retries();
        }
        self.state = state;
    }

    /// Whether the deadline has fired.
    pub fn timer_due(&self, now: Instant) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }
}
