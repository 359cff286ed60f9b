//! RFC-3261 transaction state machines (C2, §3, §4.2).
//!
//! Upward API: `send_request`, `send_response`, `cancel_transaction`.
//! Downward: `on_message` (fed by C1) emits `TransactionEvent`s to the owning
//! component (the B2BUA pairing engine, C4). Each transaction drives its own
//! retransmission timers in its own task and talks back to its owner over an
//! mpsc mailbox, matching §9's "each transaction is a task; communication is
//! message passing over bounded queues" discipline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rsip::prelude::*;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{call_id, cseq_method, method_for_tx_key, top_via_branch, TransportKind};
use crate::config::SipConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Invite,
    NonInvite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: rsip::Method,
}

impl TransactionKey {
    pub fn from_message(msg: &rsip::SipMessage) -> Result<Self> {
        let method = match msg {
            rsip::SipMessage::Request(_) => cseq_method(msg)?,
            rsip::SipMessage::Response(_) => cseq_method(msg)?,
        };
        Ok(Self { branch: top_via_branch(msg)?, method: method_for_tx_key(method) })
    }
}

#[derive(Debug, Clone)]
pub enum TransactionEvent {
    RequestReceived { key: TransactionKey, request: rsip::Request, source: SocketAddr, transport: TransportKind },
    ResponseReceived { key: TransactionKey, response: rsip::Response },
    TransportError { key: TransactionKey, reason: String },
    Timeout { key: TransactionKey },
}

pub type TransactionEventSender = mpsc::UnboundedSender<TransactionEvent>;

/// RFC-3261 §17 state transition tables, expressed as pure functions so they
/// are unit-testable without any I/O.
pub mod fsm {
    use super::*;

    pub fn client_invite_on_response(state: TxState, status: u16) -> TxState {
        match (state, status) {
            (TxState::Calling, 100..=199) => TxState::Proceeding,
            (TxState::Calling | TxState::Proceeding, 200..=299) => TxState::Terminated,
            (TxState::Calling | TxState::Proceeding, 300..=699) => TxState::Completed,
            (other, _) => other,
        }
    }

    pub fn client_non_invite_on_response(state: TxState, status: u16) -> TxState {
        match (state, status) {
            (TxState::Trying, 100..=199) => TxState::Proceeding,
            (TxState::Trying | TxState::Proceeding, 200..=699) => TxState::Completed,
            (other, _) => other,
        }
    }

    pub fn server_invite_on_response_sent(state: TxState, status: u16) -> TxState {
        match (state, status) {
            (TxState::Proceeding, 200..=299) => TxState::Terminated, // 2xx ACK handled by dialog
            (TxState::Proceeding, 300..=699) => TxState::Completed,
            (other, _) => other,
        }
    }

    pub fn server_invite_on_ack(state: TxState) -> TxState {
        match state {
            TxState::Completed => TxState::Confirmed,
            other => other,
        }
    }

    pub fn server_non_invite_on_response_sent(state: TxState, status: u16) -> TxState {
        match (state, status) {
            (TxState::Trying | TxState::Proceeding, 100..=199) => TxState::Proceeding,
            (TxState::Trying | TxState::Proceeding, 200..=699) => TxState::Completed,
            (other, _) => other,
        }
    }
}

/// A single transaction. Retransmission/timeout scheduling lives in the
/// `TransactionManager` task that owns this struct; the struct itself only
/// tracks state and the data needed to retransmit or answer duplicates.
pub struct Transaction {
    pub key: TransactionKey,
    pub role: TransactionRole,
    pub kind: TransactionKind,
    pub state: TxState,
    pub destination: SocketAddr,
    pub transport: TransportKind,
    pub request: rsip::Request,
    pub last_response: Option<rsip::Response>,
    pub retransmit_count: u32,
}

impl Transaction {
    pub fn new_client(
        key: TransactionKey,
        request: rsip::Request,
        destination: SocketAddr,
        transport: TransportKind,
    ) -> Self {
        let kind = if request.method == rsip::Method::Invite {
            TransactionKind::Invite
        } else {
            TransactionKind::NonInvite
        };
        let state = if kind == TransactionKind::Invite { TxState::Calling } else { TxState::Trying };
        Self {
            key,
            role: TransactionRole::Client,
            kind,
            state,
            destination,
            transport,
            request,
            last_response: None,
            retransmit_count: 0,
        }
    }

    pub fn new_server(
        key: TransactionKey,
        request: rsip::Request,
        source: SocketAddr,
        transport: TransportKind,
    ) -> Self {
        let kind = if request.method == rsip::Method::Invite {
            TransactionKind::Invite
        } else {
            TransactionKind::NonInvite
        };
        let state = if kind == TransactionKind::Invite { TxState::Proceeding } else { TxState::Trying };
        Self {
            key,
            role: TransactionRole::Server,
            kind,
            state,
            destination: source,
            transport,
            request,
            last_response: None,
            retransmit_count: 0,
        }
    }

    /// Applies an inbound response (client role) and returns the new state.
    pub fn on_response(&mut self, response: &rsip::Response) -> TxState {
        let status: u16 = response.status_code.clone().into();
        self.state = match self.kind {
            TransactionKind::Invite => fsm::client_invite_on_response(self.state, status),
            TransactionKind::NonInvite => fsm::client_non_invite_on_response(self.state, status),
        };
        self.last_response = Some(response.clone());
        self.state
    }

    /// Applies an outbound response (server role) and returns the new state.
    pub fn on_response_sent(&mut self, response: &rsip::Response) -> TxState {
        let status: u16 = response.status_code.clone().into();
        self.state = match self.kind {
            TransactionKind::Invite => fsm::server_invite_on_response_sent(self.state, status),
            TransactionKind::NonInvite => fsm::server_non_invite_on_response_sent(self.state, status),
        };
        self.last_response = Some(response.clone());
        self.state
    }

    pub fn on_ack(&mut self) -> TxState {
        if self.kind == TransactionKind::Invite {
            self.state = fsm::server_invite_on_ack(self.state);
        }
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TxState::Terminated
    }

    /// §4.2: "a server transaction in Completed retransmits its last
    /// response on every duplicate request".
    pub fn retransmit_response(&self) -> Option<rsip::Response> {
        if self.state == TxState::Completed || self.state == TxState::Confirmed {
            self.last_response.clone()
        } else {
            None
        }
    }
}

/// Outbound bytes a transaction wants sent, handed to C1.
pub struct OutboundDatagram {
    pub destination: SocketAddr,
    pub transport: TransportKind,
    pub bytes: Vec<u8>,
}

pub type Sender = mpsc::UnboundedSender<OutboundDatagram>;

/// Owns every live transaction, keyed by (branch, method-modulo-ACK/CANCEL).
/// CANCEL is matched to its INVITE's transaction via the same key (§4.2).
pub struct TransactionManager {
    transactions: Arc<DashMap<TransactionKey, Arc<Mutex<Transaction>>>>,
    event_tx: TransactionEventSender,
    out_tx: Sender,
    timers: SipConfig,
    per_source_counts: Arc<DashMap<std::net::IpAddr, u32>>,
}

impl TransactionManager {
    pub fn new(timers: SipConfig, out_tx: Sender) -> (Self, mpsc::UnboundedReceiver<TransactionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                transactions: Arc::new(DashMap::new()),
                event_tx,
                out_tx,
                timers,
                per_source_counts: Arc::new(DashMap::new()),
            },
            event_rx,
        )
    }

    pub fn get(&self, key: &TransactionKey) -> Option<Arc<Mutex<Transaction>>> {
        self.transactions.get(key).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Creates and registers a client transaction, sends the initial
    /// request, and arms retransmission/timeout timers (UDP only — §4.1:
    /// "TCP/TLS suppresses retransmits").
    pub async fn send_request(
        &self,
        request: rsip::Request,
        destination: SocketAddr,
        transport: TransportKind,
    ) -> Result<TransactionKey> {
        let key = TransactionKey::from_message(&rsip::SipMessage::Request(request.clone()))?;
        let tx = Transaction::new_client(key.clone(), request.clone(), destination, transport);
        let bytes: Vec<u8> = rsip::SipMessage::Request(request).into();
        self.out_tx
            .send(OutboundDatagram { destination, transport, bytes: bytes.clone() })
            .map_err(|_| Error::transport("outbound channel closed"))?;

        let handle = Arc::new(Mutex::new(tx));
        self.transactions.insert(key.clone(), handle.clone());

        if transport == TransportKind::Udp {
            self.arm_client_timers(key.clone(), handle, bytes, destination, transport);
        }
        Ok(key)
    }

    fn arm_client_timers(
        &self,
        key: TransactionKey,
        handle: Arc<Mutex<Transaction>>,
        bytes: Vec<u8>,
        destination: SocketAddr,
        transport: TransportKind,
    ) {
        let out_tx = self.out_tx.clone();
        let event_tx = self.event_tx.clone();
        let transactions = self.transactions.clone();
        let t1 = self.timers.t1();
        let t2 = self.timers.t2();
        let timer_b = self.timers.timer_b();

        tokio::spawn(async move {
            let mut interval = t1;
            let mut elapsed = Duration::ZERO;
            loop {
                tokio::time::sleep(interval).await;
                elapsed += interval;
                let mut guard = handle.lock().await;
                if guard.is_terminated() || guard.state == TxState::Completed {
                    break;
                }
                if elapsed >= timer_b {
                    guard.state = TxState::Terminated;
                    drop(guard);
                    let _ = event_tx.send(TransactionEvent::Timeout { key: key.clone() });
                    transactions.remove(&key);
                    break;
                }
                guard.retransmit_count += 1;
                drop(guard);
                if out_tx
                    .send(OutboundDatagram { destination, transport, bytes: bytes.clone() })
                    .is_err()
                {
                    break;
                }
                interval = std::cmp::min(interval * 2, t2);
            }
        });
    }

    /// C1 hands inbound messages here. Returns `Some` with the application
    /// event only when the message is novel (dedup absorbs retransmitted
    /// requests against a Completed/Confirmed server transaction, §4.2).
    pub async fn on_message(&self, msg: rsip::SipMessage, source: SocketAddr, transport: TransportKind) -> Result<()> {
        let key = TransactionKey::from_message(&msg)?;
        match msg {
            rsip::SipMessage::Request(req) => {
                if req.method == rsip::Method::Ack {
                    if let Some(existing) = self.get(&key) {
                        let mut guard = existing.lock().await;
                        guard.on_ack();
                        if guard.is_terminated() {
                            drop(guard);
                            self.transactions.remove(&key);
                        }
                    }
                    return Ok(());
                }
                if let Some(existing) = self.get(&key) {
                    let guard = existing.lock().await;
                    if let Some(resp) = guard.retransmit_response() {
                        let bytes: Vec<u8> = rsip::SipMessage::Response(resp).into();
                        let _ = self.out_tx.send(OutboundDatagram { destination: source, transport, bytes });
                        return Ok(());
                    }
                    if req.method == rsip::Method::Cancel && guard.state == TxState::Completed {
                        // §4.2: INVITE already Completed — CANCEL answered 200 but does not abort.
                        drop(guard);
                        let _ = self.event_tx.send(TransactionEvent::RequestReceived {
                            key: key.clone(),
                            request: req,
                            source,
                            transport,
                        });
                        return Ok(());
                    }
                } else {
                    let server_tx = Transaction::new_server(key.clone(), req.clone(), source, transport);
                    self.transactions.insert(key.clone(), Arc::new(Mutex::new(server_tx)));
                }
                let _ = self.event_tx.send(TransactionEvent::RequestReceived { key, request: req, source, transport });
            }
            rsip::SipMessage::Response(resp) => {
                if let Some(existing) = self.get(&key) {
                    let mut guard = existing.lock().await;
                    let new_state = guard.on_response(&resp);
                    let terminal = new_state == TxState::Terminated;
                    drop(guard);
                    let _ = self.event_tx.send(TransactionEvent::ResponseReceived { key: key.clone(), response: resp });
                    if terminal {
                        self.transactions.remove(&key);
                    }
                } else {
                    debug!("response for unknown transaction {:?}", key);
                }
            }
        }
        Ok(())
    }

    /// Sends a response for an existing server transaction, advancing its
    /// state machine.
    pub async fn send_response(&self, key: &TransactionKey, response: rsip::Response) -> Result<()> {
        let existing = self
            .get(key)
            .ok_or_else(|| Error::invalid_state("no such server transaction"))?;
        let mut guard = existing.lock().await;
        let destination = guard.destination;
        let transport = guard.transport;
        guard.on_response_sent(&response);
        let terminal = guard.is_terminated();
        drop(guard);
        let bytes: Vec<u8> = rsip::SipMessage::Response(response).into();
        self.out_tx
            .send(OutboundDatagram { destination, transport, bytes })
            .map_err(|_| Error::transport("outbound channel closed"))?;
        if terminal {
            self.transactions.remove(key);
        }
        Ok(())
    }

    /// Enforces the per-source-IP server-transaction ceiling (§5
    /// backpressure): excess is answered 503 by the caller.
    pub fn admit_source(&self, source: SocketAddr, ceiling: u32) -> bool {
        let mut entry = self.per_source_counts.entry(source.ip()).or_insert(0);
        if *entry >= ceiling {
            return false;
        }
        *entry += 1;
        true
    }

    pub fn release_source(&self, source: SocketAddr) {
        if let Some(mut entry) = self.per_source_counts.get_mut(&source.ip()) {
            if *entry > 0 {
                *entry -= 1;
            }
        }
    }

    pub async fn cancel_transaction(&self, key: &TransactionKey) -> Result<()> {
        if let Some(existing) = self.get(key) {
            let mut guard = existing.lock().await;
            guard.state = TxState::Terminated;
        }
        Ok(())
    }

    /// Transmits a CANCEL without registering a client transaction for it:
    /// CANCEL shares its INVITE's branch (§4.2 "method modulo ACK/CANCEL"
    /// equivalence), so tracking it under the same collapsed key would
    /// clobber the INVITE's own transaction entry. Its own response carries
    /// no call-state information the caller needs — the peer's resulting
    /// 487 to the original INVITE is what actually finalizes the pair, and
    /// that response already correlates through the existing INVITE key.
    pub async fn send_cancel(&self, cancel: rsip::Request, destination: SocketAddr, transport: TransportKind) -> Result<()> {
        let bytes: Vec<u8> = rsip::SipMessage::Request(cancel).into();
        self.out_tx.send(OutboundDatagram { destination, transport, bytes }).map_err(|_| Error::transport("outbound channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_invite_fsm_trying_to_terminated() {
        assert_eq!(fsm::client_invite_on_response(TxState::Calling, 100), TxState::Proceeding);
        assert_eq!(fsm::client_invite_on_response(TxState::Proceeding, 200), TxState::Terminated);
        assert_eq!(fsm::client_invite_on_response(TxState::Calling, 486), TxState::Completed);
    }

    #[test]
    fn server_invite_completes_on_non_2xx_and_confirms_on_ack() {
        let mut s = fsm::server_invite_on_response_sent(TxState::Proceeding, 486);
        assert_eq!(s, TxState::Completed);
        s = fsm::server_invite_on_ack(s);
        assert_eq!(s, TxState::Confirmed);
    }

    #[test]
    fn server_invite_2xx_terminates_transaction_immediately() {
        // ACK for 2xx is routed through the dialog, not this transaction (§4.2).
        assert_eq!(fsm::server_invite_on_response_sent(TxState::Proceeding, 200), TxState::Terminated);
    }

    #[test]
    fn non_invite_client_completes_on_any_final() {
        assert_eq!(fsm::client_non_invite_on_response(TxState::Trying, 100), TxState::Proceeding);
        assert_eq!(fsm::client_non_invite_on_response(TxState::Proceeding, 200), TxState::Completed);
    }

    #[tokio::test]
    async fn per_source_admission_ceiling() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (mgr, _rx) = TransactionManager::new(crate::config::Config::default_config().sip, out_tx);
        let addr: SocketAddr = "10.0.0.1:5060".parse().unwrap();
        assert!(mgr.admit_source(addr, 2));
        assert!(mgr.admit_source(addr, 2));
        assert!(!mgr.admit_source(addr, 2));
        mgr.release_source(addr);
        assert!(mgr.admit_source(addr, 2));
    }
}
