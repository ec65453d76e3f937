// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP messages: [`Request`], [`Response`], and the [`SipMessage`] sum type.
//!
//! Bodies are raw [`Bytes`]; Content-Length always counts body bytes in the
//! body encoding, and the serializer recomputes it.

use bytes::Bytes;
use smol_str::SmolStr;

use crate::header::Header;
use crate::method::Method;
use crate::uri::SipUri;

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: SipUri,
    pub header: Header,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: SipUri, header: Header, body: Bytes) -> Self {
        Self {
            method,
            uri,
            header,
            body,
        }
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code, 100..=699.
    pub status: u16,
    pub reason: SmolStr,
    pub header: Header,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<SmolStr>, header: Header, body: Bytes) -> Self {
        debug_assert!((100..=699).contains(&status), "status out of SIP range");
        Self {
            status,
            reason: reason.into(),
            header,
            body,
        }
    }

    /// Builds a response to a request, copying the headers a transaction-
    /// stateless reply needs (Vias, From, To, Call-ID, CSeq).
    pub fn for_request(status: u16, reason: impl Into<SmolStr>, request: &Request) -> Self {
        let mut header = Header::new();
        header.vias = request.header.vias.clone();
        header.from = request.header.from.clone();
        header.to = request.header.to.clone();
        header.call_id = request.header.call_id.clone();
        header.cseq = request.header.cseq.clone();
        Self::new(status, reason, header, Bytes::new())
    }

    /// 1xx.
    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    /// 2xx..6xx.
    pub fn is_final(&self) -> bool {
        self.status >= 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Tagged request/response variant moved through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn header(&self) -> &Header {
        match self {
            SipMessage::Request(r) => &r.header,
            SipMessage::Response(r) => &r.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            SipMessage::Request(r) => &mut r.header,
            SipMessage::Response(r) => &mut r.header,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            SipMessage::Request(r) => &r.body,
            SipMessage::Response(r) => &r.body,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }
}

impl From<Request> for SipMessage {
    fn from(value: Request) -> Self {
        SipMessage::Request(value)
    }
}

impl From<Response> for SipMessage {
    fn from(value: Response) -> Self {
        SipMessage::Response(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CSeq;
    use crate::name_addr::NameAddr;
    use crate::via::Via;

    fn sample_request() -> Request {
        let mut header = Header::new();
        let mut via = Via::new("UDP", "client.example.com", Some(5060));
        via.branch = Some(SmolStr::new("z9hG4bKtest"));
        header.push_via(via);
        header.from = Some(NameAddr::parse("<sip:alice@example.com>;tag=1").unwrap());
        header.to = Some(NameAddr::parse("<sip:bob@example.com>").unwrap());
        header.call_id = Some(SmolStr::new("abc@client"));
        header.cseq = Some(CSeq::new(1, Method::Invite));
        Request::new(
            Method::Invite,
            SipUri::parse("sip:bob@example.com").unwrap(),
            header,
            Bytes::new(),
        )
    }

    #[test]
    fn response_for_request_copies_envelope() {
        let req = sample_request();
        let resp = Response::for_request(486, "Busy Here", &req);
        assert_eq!(resp.status, 486);
        assert_eq!(resp.header.vias.len(), 1);
        assert_eq!(resp.header.branch(), req.header.branch());
        assert_eq!(resp.header.call_id, req.header.call_id);
        assert_eq!(resp.header.cseq, req.header.cseq);
        assert!(resp.is_final());
        assert!(!resp.is_success());
    }

    #[test]
    fn provisional_and_final_split_at_200() {
        let req = sample_request();
        assert!(Response::for_request(180, "Ringing", &req).is_provisional());
        assert!(Response::for_request(200, "OK", &req).is_success());
        assert!(Response::for_request(699, "Weird", &req).is_final());
    }
}
