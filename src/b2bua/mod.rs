//! B2BUA pairing engine (C4, §4.4).
//!
//! Ties an inbound ("A-leg") dialog to a synthesized outbound ("B-leg")
//! dialog: one task per pair coordinates both legs' transactions by message
//! passing, never by sharing a mutable struct between them (§5). This is the
//! central integration point tying together C2 (transactions), C3 (dialogs),
//! C5 (routing), C6 (media relay), C7 (session admission), and C9 (dialog
//! sync) — this crate's lineage's closest analogue is `services/b2bua.rs`,
//! which this module replaces outright: the lineage's version only toggled a
//! couple of booleans and never actually built a second leg.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use rsip::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SipConfig;
use crate::dialog_sync::{DialogSync, PairSnapshot, PairState};
use crate::media_relay::MediaRelayClient;
use crate::routing::rule::{HeaderMutations, NextHopAction, RequestContext};
use crate::routing::{RoutingDecision, RoutingEngine};
use crate::session::{AdmissionResult, SessionTracker};
use crate::sip::dialog::{Dialog, DialogId, DialogManager, DialogState};
use crate::sip::transaction::{TransactionKey, TransactionManager};
use crate::sip::TransportKind;
use crate::{Error, Result};

/// An active B2BUA pair: the A-leg transaction/dialog, and (once synthesized)
/// the B-leg's. Dialogs hold only a pair-id, never a pointer back (§9
/// "Cyclic references").
#[derive(Debug, Clone)]
pub struct Pair {
    pub id: String,
    pub username: String,
    pub call_id: String,
    pub b_call_id: String,
    pub a_leg_tx: TransactionKey,
    pub b_leg_tx: Option<TransactionKey>,
    pub a_from_tag: String,
    pub a_to_tag: String,
    pub b_from_tag: String,
    pub b_to_tag: Option<String>,
    pub a_leg_uri: String,
    pub b_leg_uri: String,
    pub b_leg_destination: SocketAddr,
    pub b_leg_transport: TransportKind,
    pub state: PairState,
}

pub struct B2buaEngine {
    pub transactions: Arc<TransactionManager>,
    pub dialogs: Arc<DialogManager>,
    pub routing: Arc<RoutingEngine>,
    pub media_relay: Arc<MediaRelayClient>,
    pub sessions: Arc<SessionTracker>,
    pub dialog_sync: Arc<DialogSync>,
    pairs: Arc<DashMap<String, Pair>>,
    /// Maps the B-leg's transaction key back to its pair, so inbound B-leg
    /// responses can be bridged to the right A-leg.
    pending_b_legs: Arc<DashMap<TransactionKey, String>>,
    sip: SipConfig,
    local_contact_host: String,
}

impl B2buaEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transactions: Arc<TransactionManager>,
        dialogs: Arc<DialogManager>,
        routing: Arc<RoutingEngine>,
        media_relay: Arc<MediaRelayClient>,
        sessions: Arc<SessionTracker>,
        dialog_sync: Arc<DialogSync>,
        sip: SipConfig,
        local_contact_host: String,
    ) -> Self {
        Self {
            transactions,
            dialogs,
            routing,
            media_relay,
            sessions,
            dialog_sync,
            pairs: Arc::new(DashMap::new()),
            pending_b_legs: Arc::new(DashMap::new()),
            sip,
            local_contact_host,
        }
    }

    pub fn pair(&self, id: &str) -> Option<Pair> {
        self.pairs.get(id).map(|p| p.clone())
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Finds the pair whose A-leg transaction matches `key` — used to route
    /// an inbound CANCEL (which shares its INVITE's branch, §4.2) to a pair.
    pub fn find_pair_by_a_leg_tx(&self, key: &TransactionKey) -> Option<Pair> {
        self.pairs.iter().find(|p| &p.a_leg_tx == key).map(|p| p.clone())
    }

    /// §4.4 algorithm, steps 1-6: validates, routes, admits, allocates media,
    /// and synthesizes the B-leg INVITE. Every early-exit path answers the
    /// A-leg directly and never creates a pair.
    pub async fn handle_a_leg_invite(
        &self,
        a_key: TransactionKey,
        request: rsip::Request,
        source: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        let call_id = crate::sip::call_id(&rsip::SipMessage::Request(request.clone()))?;

        if let Some(0) = crate::sip::max_forwards(&request) {
            return self.respond(&a_key, &request, 483, "Too Many Hops", None, Vec::new()).await;
        }

        let username = crate::sip::from_user(&request)?;
        let headers = header_map(&request);
        let ctx = RequestContext {
            request_uri: &request.uri.to_string(),
            method: "INVITE",
            source_ip: source.ip(),
            headers: &headers,
            timestamp: chrono::Utc::now(),
        };

        let decision = self.routing.evaluate(&ctx);
        let next_hop = match decision {
            RoutingDecision::Reject { status_code, reason } => {
                return self.respond(&a_key, &request, status_code, Box::leak(reason.into_boxed_str()), None, Vec::new()).await;
            }
            RoutingDecision::NoMatch => {
                return self.respond(&a_key, &request, 404, "Not Found", None, Vec::new()).await;
            }
            RoutingDecision::NextHop(next_hop) => next_hop,
        };

        let pair_id = Uuid::new_v4().to_string();
        match self.sessions.admit(&pair_id, &username, &call_id).await {
            Ok(AdmissionResult::Denied) => {
                return self.respond(&a_key, &request, 486, "Busy Here", None, Vec::new()).await;
            }
            Ok(AdmissionResult::AdmittedByEvicting { session_id }) => {
                info!("evicting oldest session {session_id} for {username} to admit {pair_id}");
                self.terminate_pair(&session_id, "terminate-oldest admission").await;
            }
            Ok(AdmissionResult::Admitted) => {}
            Err(e) => {
                warn!("session tracker unreachable, rejecting: {e}");
                return self.respond(&a_key, &request, 503, "Dependency Unavailable", None, Vec::new()).await;
            }
        }

        let a_sdp = String::from_utf8_lossy(&request.body).to_string();
        let a_from_tag = extract_tag(&request, true)?;
        let rewritten_sdp = match self.media_relay.offer(&call_id, &a_from_tag, &a_sdp, &next_hop.media_relay_flags).await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!("media allocation failed for {call_id}: {e}");
                return self.respond(&a_key, &request, 500, "Media Allocation Failed", None, Vec::new()).await;
            }
        };

        let b_call_id = format!("{}-b", Uuid::new_v4());
        let b_from_tag = Uuid::new_v4().to_string();
        let max_forwards = crate::sip::max_forwards(&request).unwrap_or(70).saturating_sub(1);
        let b_request = build_b_leg_request(&request, &next_hop, &b_call_id, &b_from_tag, max_forwards, &rewritten_sdp, &self.local_contact_host)?;

        let destination: SocketAddr = next_hop
            .outbound_proxy
            .as_deref()
            .or(Some(next_hop.destination_uri.as_str()))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::routing(format!("cannot resolve next hop {}", next_hop.destination_uri)))?;

        let b_key = self.transactions.send_request(b_request, destination, transport).await?;

        let pair = Pair {
            id: pair_id.clone(),
            username: username.clone(),
            call_id: call_id.clone(),
            b_call_id: b_call_id.clone(),
            a_leg_tx: a_key,
            b_leg_tx: Some(b_key.clone()),
            a_from_tag: a_from_tag.clone(),
            a_to_tag: Uuid::new_v4().to_string(),
            b_from_tag,
            b_to_tag: None,
            a_leg_uri: request.uri.to_string(),
            b_leg_uri: next_hop.destination_uri.clone(),
            b_leg_destination: destination,
            b_leg_transport: transport,
            state: PairState::Establishing,
        };
        self.pairs.insert(pair_id.clone(), pair.clone());
        self.pending_b_legs.insert(b_key, pair_id.clone());

        self.publish_snapshot(&pair).await;
        Ok(())
    }

    /// §4.4 steps 6-7: bridges a B-leg response back onto the A-leg. Looked
    /// up and called from the transaction manager's `ResponseReceived`
    /// event; untracked keys (BYE/CANCEL responses, which key on their own
    /// branch rather than the INVITE's) are dropped silently.
    pub async fn handle_b_leg_response(&self, b_key: &TransactionKey, response: rsip::Response) -> Result<()> {
        let Some(pair_id) = self.pending_b_legs.get(b_key).map(|e| e.clone()) else {
            debug!("response on untracked B-leg transaction {:?}", b_key);
            return Ok(());
        };
        let Some(mut pair) = self.pair(&pair_id) else { return Ok(()) };
        let Some(a_tx) = self.transactions.get(&pair.a_leg_tx) else {
            warn!("A-leg transaction for pair {pair_id} is gone; dropping bridged response");
            return Ok(());
        };
        let a_request = a_tx.lock().await.request.clone();
        let status: u16 = response.status_code.clone().into();

        if should_suppress_provisional(status) {
            return Ok(());
        }

        if (180..200).contains(&status) {
            pair.state = PairState::EarlyMedia;
            self.pairs.insert(pair_id.clone(), pair.clone());
            return self.respond(&pair.a_leg_tx, &a_request, status, "Ringing", Some(&pair.a_to_tag), Vec::new()).await;
        }

        if (200..300).contains(&status) {
            if self.dialogs.has_confirmed_dialog_for_pair(&pair_id) {
                // §4.3 forked 2xx: accept only the first, BYE the rest.
                let extra_to_tag = extract_tag_from_response(&response, false).unwrap_or_default();
                self.send_bye_to_b_leg(&pair, &extra_to_tag).await;
                return Ok(());
            }
            let b_to_tag = extract_tag_from_response(&response, false).unwrap_or_default();
            pair.b_to_tag = Some(b_to_tag.clone());
            pair.state = PairState::Confirmed;
            self.pairs.insert(pair_id.clone(), pair.clone());

            let a_dialog_id = DialogId { call_id: pair.call_id.clone(), local_tag: pair.a_to_tag.clone(), remote_tag: pair.a_from_tag.clone() };
            self.dialogs.register(Dialog::new(a_dialog_id.clone(), pair_id.clone(), pair.a_leg_uri.clone(), pair.b_leg_uri.clone()))?;
            self.dialogs.update(&a_dialog_id, |d| d.state = DialogState::Confirmed)?;

            let b_dialog_id = DialogId { call_id: pair.b_call_id.clone(), local_tag: pair.b_from_tag.clone(), remote_tag: b_to_tag };
            self.dialogs.register(Dialog::new(b_dialog_id.clone(), pair_id.clone(), pair.b_leg_uri.clone(), pair.a_leg_uri.clone()))?;
            self.dialogs.update(&b_dialog_id, |d| d.state = DialogState::Confirmed)?;

            self.publish_snapshot(&pair).await;

            let body = response.body.clone();
            return self.respond(&pair.a_leg_tx, &a_request, 200, "OK", Some(&pair.a_to_tag), body).await;
        }

        // final failure >= 300: §4.4 failure semantics.
        let (a_status, a_reason) = b_leg_failure_to_a_leg(status);
        self.media_relay.delete_best_effort(&pair.call_id, &pair.a_from_tag, &pair.b_from_tag).await;
        pair.state = PairState::Terminated;
        self.pairs.insert(pair_id.clone(), pair.clone());
        self.dialog_sync.retire(&pair_id).await;
        self.respond(&pair.a_leg_tx, &a_request, a_status, a_reason, None, Vec::new()).await
    }

    /// §4.4 Mid-dialog: BYE on either leg tears down the other and the pair.
    pub async fn handle_bye(&self, pair_id: &str, from_a_leg: bool) -> Result<()> {
        let Some(pair) = self.pair(pair_id) else { return Ok(()) };
        if from_a_leg {
            if let Some(b_to_tag) = &pair.b_to_tag {
                info!("mirroring BYE from A-leg to B-leg for pair {pair_id}");
                let bye = build_bye_request(&pair.call_id, &pair.b_from_tag, b_to_tag, &pair.b_leg_uri, &self.local_contact_host);
                if let Err(e) = self.transactions.send_request(bye, pair.b_leg_destination, pair.b_leg_transport).await {
                    warn!("failed to send BYE to B-leg for pair {pair_id}: {e}");
                }
            }
        }
        self.terminate_pair(pair_id, "BYE").await;
        Ok(())
    }

    /// §4.4 Mid-dialog: CANCEL on the A-leg before the B-leg's final response
    /// cancels the B-leg; its 487 translates to an A-leg 487.
    pub async fn handle_cancel(&self, pair_id: &str) -> Result<()> {
        let Some(pair) = self.pair(pair_id) else { return Ok(()) };
        if let Some(b_key) = &pair.b_leg_tx {
            if let Some(b_tx) = self.transactions.get(b_key) {
                let invite = b_tx.lock().await.request.clone();
                match build_cancel_request(&invite) {
                    Ok(cancel) => {
                        if let Err(e) = self.transactions.send_cancel(cancel, pair.b_leg_destination, pair.b_leg_transport).await {
                            warn!("failed to send CANCEL to B-leg for pair {pair_id}: {e}");
                        }
                    }
                    Err(e) => warn!("failed to build CANCEL for pair {pair_id}: {e}"),
                }
            }
            self.transactions.cancel_transaction(b_key).await?;
        }
        Ok(())
    }

    /// §4.4 Mid-dialog re-INVITE: renegotiates media via C6's *answer*
    /// command and answers the originating leg with the rewritten SDP. A
    /// renegotiation failure leaves the prior media session intact — it
    /// answers 488, it does not tear down the pair (§9 Open Question).
    pub async fn handle_reinvite(&self, key: &TransactionKey, request: rsip::Request, dialog: &Dialog) -> Result<()> {
        let Some(pair) = self.pair(&dialog.pair_id) else {
            return self.respond(key, &request, 481, "Call/Transaction Does Not Exist", None, Vec::new()).await;
        };
        let on_a_leg = dialog.id.call_id == pair.call_id;
        let (from_tag, to_tag) = if on_a_leg {
            (pair.a_from_tag.clone(), pair.a_to_tag.clone())
        } else {
            (pair.b_from_tag.clone(), pair.b_to_tag.clone().unwrap_or_default())
        };
        let offered_sdp = String::from_utf8_lossy(&request.body).to_string();

        let rewritten_sdp = match self.media_relay.answer(&dialog.id.call_id, &from_tag, &to_tag, &offered_sdp, "").await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!("re-INVITE media renegotiation failed for pair {}: {e}", pair.id);
                return self.respond(key, &request, 488, "Not Acceptable Here", Some(&dialog.id.local_tag), Vec::new()).await;
            }
        };

        self.respond(key, &request, 200, "OK", Some(&dialog.id.local_tag), rewritten_sdp.into_bytes()).await
    }

    async fn send_bye_to_b_leg(&self, pair: &Pair, extra_to_tag: &str) {
        info!("BYE-ing forked 2xx leg for pair {}", pair.id);
        let bye = build_bye_request(&pair.call_id, &pair.b_from_tag, extra_to_tag, &pair.b_leg_uri, &self.local_contact_host);
        if let Err(e) = self.transactions.send_request(bye, pair.b_leg_destination, pair.b_leg_transport).await {
            warn!("failed to BYE forked leg for pair {}: {e}", pair.id);
        }
    }

    /// Releases a pair's session, media, dialogs, and published snapshot
    /// (§5 cancellation unwind order).
    pub async fn terminate_pair(&self, pair_id: &str, reason: &str) {
        let Some(pair) = self.pair(pair_id) else { return };
        info!("terminating pair {pair_id}: {reason}");
        self.media_relay.delete_best_effort(&pair.call_id, &pair.a_from_tag, &pair.b_from_tag).await;
        self.dialogs.remove(&DialogId { call_id: pair.call_id.clone(), local_tag: pair.a_to_tag.clone(), remote_tag: pair.a_from_tag.clone() });
        if let Some(b_to_tag) = &pair.b_to_tag {
            self.dialogs.remove(&DialogId { call_id: pair.b_call_id.clone(), local_tag: pair.b_from_tag.clone(), remote_tag: b_to_tag.clone() });
        }
        if let Err(e) = self.sessions.release(pair_id, &pair.username).await {
            warn!("failed to release session record for {pair_id}: {e}");
        }
        self.dialog_sync.retire(pair_id).await;
        self.pairs.remove(pair_id);
        if let Some(b_key) = &pair.b_leg_tx {
            self.pending_b_legs.remove(b_key);
        }
    }

    /// §4.4 "a pair that has been in Early state beyond a configurable
    /// dialog timeout (default 30 minutes) is force-terminated".
    pub async fn sweep_stale_early_pairs(&self) {
        for pair_id in self.dialogs.early_pairs_older_than(std::time::Duration::from_secs(self.sip.dialog_early_timeout_secs)) {
            self.terminate_pair(&pair_id, "Early-state timeout").await;
        }
    }

    async fn publish_snapshot(&self, pair: &Pair) {
        let now = chrono::Utc::now();
        self.dialog_sync
            .publish(&PairSnapshot {
                pair_id: pair.id.clone(),
                a_leg_uri: pair.a_leg_uri.clone(),
                b_leg_uri: pair.b_leg_uri.clone(),
                username: pair.username.clone(),
                state: pair.state,
                created_at: now,
                updated_at: now,
            })
            .await;
    }

    async fn respond(
        &self,
        key: &TransactionKey,
        request: &rsip::Request,
        status_code: u16,
        reason: &str,
        to_tag: Option<&str>,
        body: Vec<u8>,
    ) -> Result<()> {
        let response = build_response(request, status_code, reason, to_tag, body)?;
        self.transactions.send_response(key, response).await
    }
}

fn should_suppress_provisional(status: u16) -> bool {
    status == 100
}

/// §4.4 failure semantics: "B-leg 408 or 503 -> A-leg 503"; any other final
/// failure passes its status through unchanged.
fn b_leg_failure_to_a_leg(status: u16) -> (u16, &'static str) {
    match status {
        408 | 503 => (503, "Service Unavailable"),
        486 => (486, "Busy Here"),
        487 => (487, "Request Terminated"),
        other => (other, "Call Failed"),
    }
}

fn header_map(request: &rsip::Request) -> HashMap<String, String> {
    request
        .headers
        .iter()
        .map(|h| (h.to_string().split(':').next().unwrap_or_default().trim().to_string(), h.to_string()))
        .collect()
}

fn extract_tag(request: &rsip::Request, from_header: bool) -> Result<String> {
    let header = if from_header { request.from_header()? } else { request.to_header()? };
    let typed = header.typed().map_err(|e| Error::protocol(format!("bad tag header: {e}")))?;
    typed.tag().map(|t| t.to_string()).ok_or_else(|| Error::protocol("missing tag parameter"))
}

fn extract_tag_from_response(response: &rsip::Response, from_header: bool) -> Option<String> {
    let header = if from_header { response.from_header().ok()? } else { response.to_header().ok()? };
    header.typed().ok()?.tag().map(|t| t.to_string())
}

/// Applies a routing action's header add/set/remove mutations in order:
/// remove, then set (overwrite), then add (append) — §3 data model.
fn apply_header_mutations(headers: &mut Vec<(String, String)>, mutations: &HeaderMutations) {
    headers.retain(|(name, _)| !mutations.remove.iter().any(|r| r.eq_ignore_ascii_case(name)));
    for (name, value) in &mutations.set {
        if let Some(existing) = headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            existing.1 = value.clone();
        } else {
            headers.push((name.clone(), value.clone()));
        }
    }
    for (name, value) in &mutations.add {
        headers.push((name.clone(), value.clone()));
    }
}

/// §4.4 step 5: synthesizes the B-leg INVITE from the A-leg request and the
/// routing decision's next-hop action.
fn build_b_leg_request(
    a_request: &rsip::Request,
    next_hop: &NextHopAction,
    b_call_id: &str,
    b_from_tag: &str,
    max_forwards: u32,
    rewritten_sdp: &str,
    local_host: &str,
) -> Result<rsip::Request> {
    let uri: rsip::Uri = next_hop
        .destination_uri
        .as_str()
        .try_into()
        .map_err(|e| Error::routing(format!("invalid next-hop URI: {e}")))?;

    let branch = format!("z9hG4bK{}", Uuid::new_v4().simple());
    let via = rsip::headers::Via::from(format!("SIP/2.0/UDP {local_host};branch={branch}"));
    let from = rsip::headers::From::from(format!("{};tag={}", a_request.uri, b_from_tag));
    let to = rsip::headers::To::from(next_hop.destination_uri.clone());
    let call_id = rsip::headers::CallId::from(b_call_id.to_string());
    let cseq = rsip::headers::CSeq::from("1 INVITE".to_string());
    let contact = rsip::headers::Contact::from(format!("<sip:{local_host}>"));
    let record_route = rsip::headers::RecordRoute::from(format!("<sip:{local_host};lr>"));
    let body = rewritten_sdp.as_bytes().to_vec();

    let mut header_pairs: Vec<(String, String)> = vec![];
    apply_header_mutations(&mut header_pairs, &next_hop.headers);

    let mut headers: Vec<rsip::Header> = vec![
        via.into(),
        from.into(),
        to.into(),
        call_id.into(),
        cseq.into(),
        rsip::headers::MaxForwards::from(max_forwards).into(),
        contact.into(),
        record_route.into(),
        rsip::headers::ContentLength::from(body.len() as u32).into(),
    ];
    for (name, value) in header_pairs {
        headers.push(rsip::Header::Other(name, value));
    }

    Ok(rsip::Request { method: rsip::Method::Invite, uri, version: rsip::Version::V2, headers: headers.into(), body })
}

/// Builds an in-dialog BYE from the B2BUA's own end of a pair's dialog with
/// the far side (§4.4 mid-dialog teardown, §4.3 forked-2xx cleanup).
fn build_bye_request(call_id: &str, local_tag: &str, remote_tag: &str, request_uri: &str, local_host: &str) -> rsip::Request {
    let uri: rsip::Uri = request_uri.try_into().unwrap_or_else(|_| format!("sip:{local_host}").as_str().try_into().expect("fallback URI parses"));
    let branch = format!("z9hG4bK{}", Uuid::new_v4().simple());
    let via = rsip::headers::Via::from(format!("SIP/2.0/UDP {local_host};branch={branch}"));
    let from = rsip::headers::From::from(format!("{request_uri};tag={local_tag}"));
    let to = rsip::headers::To::from(format!("{request_uri};tag={remote_tag}"));
    let call_id_hdr = rsip::headers::CallId::from(call_id.to_string());
    let cseq = rsip::headers::CSeq::from("2 BYE".to_string());

    let headers: Vec<rsip::Header> =
        vec![via.into(), from.into(), to.into(), call_id_hdr.into(), cseq.into(), rsip::headers::MaxForwards::from(70).into(), rsip::headers::ContentLength::from(0).into()];

    rsip::Request { method: rsip::Method::Bye, uri, version: rsip::Version::V2, headers: headers.into(), body: Vec::new() }
}

fn build_response(request: &rsip::Request, status_code: u16, reason: &str, local_tag: Option<&str>, body: Vec<u8>) -> Result<rsip::Response> {
    let via = request.via_header().map_err(|e| Error::protocol(format!("missing Via: {e}")))?.clone();
    let from = request.from_header().map_err(|e| Error::protocol(format!("missing From: {e}")))?.clone();
    let mut to_value = request.to_header().map_err(|e| Error::protocol(format!("missing To: {e}")))?.value().to_string();
    if let Some(tag) = local_tag {
        if !to_value.contains("tag=") {
            to_value.push_str(&format!(";tag={tag}"));
        }
    }
    let to = rsip::headers::To::from(to_value);
    let call_id = request.call_id_header().map_err(|e| Error::protocol(format!("missing Call-ID: {e}")))?.clone();
    let cseq = request.cseq_header().map_err(|e| Error::protocol(format!("missing CSeq: {e}")))?.clone();

    let headers: Vec<rsip::Header> = vec![
        via.into(),
        from.into(),
        to.into(),
        call_id.into(),
        cseq.into(),
        rsip::headers::ContentLength::from(body.len() as u32).into(),
    ];

    Ok(rsip::Response { status_code: rsip::StatusCode::Unofficial(status_code, reason.to_string()), version: rsip::Version::V2, headers: headers.into(), body })
}

/// Builds the CANCEL for a pending B-leg INVITE: same branch, Call-ID, CSeq
/// number, To and From as the request being cancelled (RFC 3261 §9.1) so the
/// peer can correlate it to the pending transaction.
fn build_cancel_request(invite: &rsip::Request) -> Result<rsip::Request> {
    let via = invite.via_header().map_err(|e| Error::protocol(format!("missing Via: {e}")))?.clone();
    let from = invite.from_header().map_err(|e| Error::protocol(format!("missing From: {e}")))?.clone();
    let to = invite.to_header().map_err(|e| Error::protocol(format!("missing To: {e}")))?.clone();
    let call_id = invite.call_id_header().map_err(|e| Error::protocol(format!("missing Call-ID: {e}")))?.clone();
    let cseq_num = invite.cseq_header().map_err(|e| Error::protocol(format!("missing CSeq: {e}")))?.typed().map_err(|e| Error::protocol(format!("bad CSeq: {e}")))?.seq;
    let cseq = rsip::headers::CSeq::from(format!("{cseq_num} CANCEL"));
    let max_forwards = rsip::headers::MaxForwards::from(crate::sip::max_forwards(invite).unwrap_or(70));

    let headers: Vec<rsip::Header> =
        vec![via.into(), from.into(), to.into(), call_id.into(), cseq.into(), max_forwards.into(), rsip::headers::ContentLength::from(0).into()];

    Ok(rsip::Request { method: rsip::Method::Cancel, uri: invite.uri.clone(), version: rsip::Version::V2, headers: headers.into(), body: Vec::new() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_100_is_suppressed() {
        assert!(should_suppress_provisional(100));
        assert!(!should_suppress_provisional(180));
    }

    #[test]
    fn b_leg_timeout_and_unavailable_both_map_to_a_leg_503() {
        assert_eq!(b_leg_failure_to_a_leg(408).0, 503);
        assert_eq!(b_leg_failure_to_a_leg(503).0, 503);
        assert_eq!(b_leg_failure_to_a_leg(486).0, 486);
    }

    #[test]
    fn header_mutations_apply_remove_then_set_then_add() {
        let mut headers = vec![("X-A".to_string(), "old".to_string()), ("X-B".to_string(), "keep".to_string())];
        let mutations = HeaderMutations {
            add: [("X-C".to_string(), "new".to_string())].into_iter().collect(),
            set: [("X-A".to_string(), "updated".to_string())].into_iter().collect(),
            remove: vec!["X-B".to_string()],
        };
        apply_header_mutations(&mut headers, &mutations);
        assert_eq!(headers.len(), 2);
        assert!(headers.contains(&("X-A".to_string(), "updated".to_string())));
        assert!(headers.contains(&("X-C".to_string(), "new".to_string())));
        assert!(!headers.iter().any(|(n, _)| n == "X-B"));
    }

    #[test]
    fn bye_request_carries_both_dialog_tags_and_bumped_cseq() {
        let bye = build_bye_request("call-1", "from-tag", "to-tag", "sip:bob@next-hop.example", "gw.example:5060");
        assert_eq!(bye.method, rsip::Method::Bye);
        let from = bye.from_header().unwrap().value().to_string();
        let to = bye.to_header().unwrap().value().to_string();
        assert!(from.contains("tag=from-tag"));
        assert!(to.contains("tag=to-tag"));
        assert_eq!(bye.cseq_header().unwrap().value(), "2 BYE");
    }
}
