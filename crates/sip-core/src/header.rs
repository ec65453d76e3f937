// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The typed header envelope shared by requests and responses.
//!
//! Fields the signaling core routes on are typed; everything else is kept in
//! an insertion-ordered unknown-header bag and survives a parse/serialize
//! round trip untouched. Via order is significant: index 0 is the top
//! (most recent) hop.

use smol_str::SmolStr;

use crate::method::Method;
use crate::name_addr::NameAddr;
use crate::via::Via;

/// CSeq header: sequence number plus the method it counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }

    /// Parses `"314159 INVITE"`.
    pub fn parse(input: &str) -> Option<Self> {
        let mut parts = input.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some(Self { seq, method })
    }
}

impl std::fmt::Display for CSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// Typed header envelope plus the unknown-header bag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub from: Option<NameAddr>,
    pub to: Option<NameAddr>,
    pub call_id: Option<SmolStr>,
    pub cseq: Option<CSeq>,
    /// Ordered top-first: `vias[0]` is the most recent hop.
    pub vias: Vec<Via>,
    pub contacts: Vec<NameAddr>,
    /// Ordered as received.
    pub routes: Vec<NameAddr>,
    pub record_routes: Vec<NameAddr>,
    pub max_forwards: Option<u32>,
    pub content_length: Option<usize>,
    pub content_type: Option<SmolStr>,
    pub require: Vec<SmolStr>,
    pub unsupported: Vec<SmolStr>,
    /// Unknown headers in first-seen order, round-tripped verbatim.
    pub unknown: Vec<(SmolStr, SmolStr)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently added Via, if any.
    pub fn top_via(&self) -> Option<&Via> {
        self.vias.first()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.vias.first_mut()
    }

    /// Pushes a Via on top of the stack.
    pub fn push_via(&mut self, via: Via) {
        self.vias.insert(0, via);
    }

    /// Pops the top Via, used when a response crosses back over this hop.
    pub fn pop_via(&mut self) -> Option<Via> {
        if self.vias.is_empty() {
            None
        } else {
            Some(self.vias.remove(0))
        }
    }

    /// Branch token from the top Via.
    pub fn branch(&self) -> Option<&SmolStr> {
        self.top_via().and_then(|v| v.branch.as_ref())
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_ref().and_then(|f| f.tag())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.as_ref().and_then(|t| t.tag())
    }

    /// Appends an unknown header, preserving insertion order.
    pub fn push_unknown(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.unknown.push((name.into(), value.into()));
    }

    /// First unknown header with the given name (case-insensitive).
    pub fn get_unknown(&self, name: &str) -> Option<&SmolStr> {
        self.unknown
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// All unknown headers with the given name, in insertion order.
    pub fn get_unknown_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.unknown
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::SipUri;

    fn via(branch: &str) -> Via {
        let mut v = Via::new("UDP", "host.example.com", Some(5060));
        v.branch = Some(SmolStr::new(branch));
        v
    }

    #[test]
    fn cseq_parses_and_prints() {
        let cseq = CSeq::parse("314159 INVITE").unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }

    #[test]
    fn cseq_rejects_trailing_tokens() {
        assert!(CSeq::parse("1 INVITE extra").is_none());
        assert!(CSeq::parse("INVITE").is_none());
    }

    #[test]
    fn via_stack_is_top_first() {
        let mut header = Header::new();
        header.push_via(via("z9hG4bKfirst"));
        header.push_via(via("z9hG4bKsecond"));
        assert_eq!(
            header.top_via().and_then(|v| v.branch.as_deref()),
            Some("z9hG4bKsecond")
        );
        let popped = header.pop_via().unwrap();
        assert_eq!(popped.branch.as_deref(), Some("z9hG4bKsecond"));
        assert_eq!(header.branch().map(|b| b.as_str()), Some("z9hG4bKfirst"));
    }

    #[test]
    fn tags_come_from_name_addrs() {
        let mut header = Header::new();
        let mut from = NameAddr::from_uri(SipUri::parse("sip:alice@example.com").unwrap());
        from.set_tag("abc");
        header.from = Some(from);
        header.to = Some(NameAddr::from_uri(
            SipUri::parse("sip:bob@example.com").unwrap(),
        ));
        assert_eq!(header.from_tag(), Some("abc"));
        assert_eq!(header.to_tag(), None);
    }

    #[test]
    fn unknown_bag_preserves_order_and_duplicates() {
        let mut header = Header::new();
        header.push_unknown("X-A", "1");
        header.push_unknown("X-B", "2");
        header.push_unknown("x-a", "3");
        assert_eq!(header.get_unknown("X-A").map(|v| v.as_str()), Some("1"));
        let all: Vec<&str> = header.get_unknown_all("X-A").map(|v| v.as_str()).collect();
        assert_eq!(all, vec!["1", "3"]);
    }
}
