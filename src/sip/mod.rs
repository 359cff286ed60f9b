//! SIP protocol engine: transport (C1), transaction (C2), and dialog (C3)
//! layers, built on the `rsip` message-modeling crate rather than this
//! lineage's fabricated sibling SIP stack.

pub mod dialog;
pub mod transaction;
pub mod transport;

use std::net::SocketAddr;

use rsip::prelude::*;

use crate::{Error, Result};

/// The transport a message arrived on or must be sent over (§4.1: "tagged
/// with its receive-transport so responses use the same path").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Tls => write!(f, "TLS"),
        }
    }
}

/// A SIP message plus the transport-layer context it needs: where it came
/// from (inbound) or must go (outbound), and which socket family carried it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: rsip::SipMessage,
    pub peer: SocketAddr,
    pub transport: TransportKind,
}

pub fn is_request(msg: &rsip::SipMessage) -> bool {
    matches!(msg, rsip::SipMessage::Request(_))
}

/// Extracts the branch parameter of the top Via header — the primary key
/// component for transaction matching (§3).
pub fn top_via_branch(msg: &rsip::SipMessage) -> Result<String> {
    let via = match msg {
        rsip::SipMessage::Request(r) => r.via_header(),
        rsip::SipMessage::Response(r) => r.via_header(),
    }
    .map_err(|e| Error::protocol(format!("missing Via: {e}")))?;
    let typed = via.typed().map_err(|e| Error::protocol(format!("bad Via: {e}")))?;
    typed
        .branch()
        .map(|b| b.to_string())
        .ok_or_else(|| Error::protocol("Via has no branch parameter"))
}

pub fn call_id(msg: &rsip::SipMessage) -> Result<String> {
    let header = match msg {
        rsip::SipMessage::Request(r) => r.call_id_header(),
        rsip::SipMessage::Response(r) => r.call_id_header(),
    }
    .map_err(|e| Error::protocol(format!("missing Call-ID: {e}")))?;
    Ok(header.value().to_string())
}

pub fn cseq_method(msg: &rsip::SipMessage) -> Result<rsip::Method> {
    let header = match msg {
        rsip::SipMessage::Request(r) => r.cseq_header(),
        rsip::SipMessage::Response(r) => r.cseq_header(),
    }
    .map_err(|e| Error::protocol(format!("missing CSeq: {e}")))?;
    header
        .typed()
        .map(|c| c.method)
        .map_err(|e| Error::protocol(format!("bad CSeq: {e}")))
}

/// CANCEL and the request it cancels share a transaction key under the
/// "method modulo ACK/CANCEL equivalence" rule (§3): for transaction-key
/// purposes both INVITE and CANCEL key on INVITE's branch, and the method
/// dimension is collapsed.
pub fn method_for_tx_key(method: rsip::Method) -> rsip::Method {
    match method {
        rsip::Method::Cancel => rsip::Method::Invite,
        other => other,
    }
}

pub fn max_forwards(msg: &rsip::Request) -> Option<u32> {
    msg.headers.iter().find_map(|h| match h {
        rsip::Header::MaxForwards(mf) => mf.value().parse::<u32>().ok(),
        _ => None,
    })
}

pub fn from_user(req: &rsip::Request) -> Result<String> {
    let from = req.from_header().map_err(|e| Error::protocol(format!("missing From: {e}")))?;
    let typed = from.typed().map_err(|e| Error::protocol(format!("bad From: {e}")))?;
    typed
        .uri
        .user()
        .map(|u| u.to_string())
        .ok_or_else(|| Error::protocol("From URI has no user part"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invite() -> rsip::Request {
        rsip::Request {
            method: rsip::Method::Invite,
            uri: "sip:bob@example.com".try_into().unwrap(),
            version: rsip::Version::V2,
            headers: vec![
                rsip::headers::Via::from(
                    "SIP/2.0/UDP pc.example.com;branch=z9hG4bK776asdhds",
                )
                .into(),
                rsip::headers::From::from("sip:alice@example.com;tag=1928301774").into(),
                rsip::headers::To::from("sip:bob@example.com").into(),
                rsip::headers::CallId::from("a84b4c76e66710@pc.example.com").into(),
                rsip::headers::CSeq::from("314159 INVITE").into(),
                rsip::headers::MaxForwards::from(70).into(),
            ]
            .into(),
            body: Default::default(),
        }
    }

    #[test]
    fn extracts_branch_and_call_id() {
        let req = rsip::SipMessage::Request(sample_invite());
        assert_eq!(top_via_branch(&req).unwrap(), "z9hG4bK776asdhds");
        assert_eq!(call_id(&req).unwrap(), "a84b4c76e66710@pc.example.com");
        assert_eq!(cseq_method(&req).unwrap(), rsip::Method::Invite);
    }

    #[test]
    fn extracts_from_user() {
        assert_eq!(from_user(&sample_invite()).unwrap(), "alice");
    }

    #[test]
    fn max_forwards_zero_is_detected() {
        let mut req = sample_invite();
        req.headers = vec![rsip::headers::MaxForwards::from(0).into()].into();
        assert_eq!(max_forwards(&req), Some(0));
    }

    #[test]
    fn cancel_keys_on_invite_branch() {
        assert_eq!(method_for_tx_key(rsip::Method::Cancel), rsip::Method::Invite);
        assert_eq!(method_for_tx_key(rsip::Method::Bye), rsip::Method::Bye);
    }
}
