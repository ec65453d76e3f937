// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction identity (RFC 3261 §17.1.3/§17.2.3, RFC 2543 fallback).
//!
//! A compliant message is identified by (branch, sent-by, method), where the
//! method used for matching folds ACK onto its INVITE. A response derives
//! the method from its CSeq. Messages whose branch lacks the magic cookie
//! fall back to the RFC 2543 heuristic over Call-ID, CSeq, From-tag, To,
//! request-URI, and top Via.

use sip_core::{Method, Request, Response, Via};
use smol_str::SmolStr;

/// Unique key for one transaction within an engine's client or server table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionId {
    /// Magic-cookie identification: hash over branch, sent-by, and the
    /// matching method.
    Rfc3261 {
        branch: SmolStr,
        sent_by: SmolStr,
        method: Method,
    },
    /// Legacy heuristic for pre-3261 peers.
    Rfc2543 {
        call_id: SmolStr,
        cseq_seq: u32,
        method: Method,
        from_tag: SmolStr,
        to: SmolStr,
        request_uri: SmolStr,
        via_sent_by: SmolStr,
    },
}

impl TransactionId {
    /// Derives the ID for an inbound or outbound request.
    ///
    /// ACK matches the INVITE it acknowledges; CANCEL forms its own
    /// transaction (use [`TransactionId::invite_peer`] to find the INVITE
    /// with the identical branch).
    pub fn from_request(req: &Request) -> Option<Self> {
        let via = req.header.top_via()?;
        let method = matching_method(&req.method);
        Self::from_via(via, method).or_else(|| Self::legacy_from_request(req))
    }

    /// Derives the ID a response matches: branch and sent-by from the top
    /// Via, method from CSeq.
    pub fn from_response(resp: &Response) -> Option<Self> {
        let via = resp.header.top_via()?;
        let cseq = resp.header.cseq.as_ref()?;
        Self::from_via(via, matching_method(&cseq.method))
    }

    fn from_via(via: &Via, method: Method) -> Option<Self> {
        if !via.has_rfc3261_branch() {
            return None;
        }
        Some(TransactionId::Rfc3261 {
            branch: via.branch.clone()?,
            sent_by: via.sent_by(),
            method,
        })
    }

    fn legacy_from_request(req: &Request) -> Option<Self> {
        let via = req.header.top_via()?;
        Some(TransactionId::Rfc2543 {
            call_id: req.header.call_id.clone()?,
            cseq_seq: req.header.cseq.as_ref()?.seq,
            method: matching_method(&req.method),
            from_tag: SmolStr::new(req.header.from_tag().unwrap_or("")),
            to: SmolStr::new(
                req.header
                    .to
                    .as_ref()
                    .map(|t| t.uri.to_string())
                    .unwrap_or_default(),
            ),
            request_uri: SmolStr::new(req.uri.to_string()),
            via_sent_by: via.sent_by(),
        })
    }

    /// The ID of the INVITE transaction sharing this key's branch. Used to
    /// pair a CANCEL (or a stray ACK) with the INVITE it targets.
    pub fn invite_peer(&self) -> Self {
        match self {
            TransactionId::Rfc3261 {
                branch, sent_by, ..
            } => TransactionId::Rfc3261 {
                branch: branch.clone(),
                sent_by: sent_by.clone(),
                method: Method::Invite,
            },
            TransactionId::Rfc2543 {
                call_id,
                cseq_seq,
                from_tag,
                to,
                request_uri,
                via_sent_by,
                ..
            } => TransactionId::Rfc2543 {
                call_id: call_id.clone(),
                cseq_seq: *cseq_seq,
                method: Method::Invite,
                from_tag: from_tag.clone(),
                to: to.clone(),
                request_uri: request_uri.clone(),
                via_sent_by: via_sent_by.clone(),
            },
        }
    }

    /// The matching method this ID was built with.
    pub fn method(&self) -> &Method {
        match self {
            TransactionId::Rfc3261 { method, .. } => method,
            TransactionId::Rfc2543 { method, .. } => method,
        }
    }
}

/// ACK folds onto the INVITE it acknowledges; every other method matches
/// itself (CANCEL included; the CANCEL transaction is distinct).
fn matching_method(method: &Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other.clone(),
    }
}
