// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parser and serializer.
//!
//! The parser is liberal in what it accepts per RFC 3261 §7 (header names
//! are case-insensitive, compact forms are expanded, whitespace around the
//! colon is tolerated) and strict in what it produces: canonical CRLF, one
//! header per line, a single space after the colon, and a recomputed
//! Content-Length. Parse failures carry the offending field tag and the SIP
//! status code the transport should answer with.
//!
//! Stream framing for TCP/TLS lives in [`scanner`]; datagram and WebSocket
//! payloads arrive one-message-per-unit and go straight through
//! [`parse_message`].
//!
//! # Example
//! ```
//! use sip_parse::{parse_request, serialize_request};
//! # let raw = b"OPTIONS sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\nMax-Forwards: 70\r\nTo: <sip:bob@example.com>\r\nFrom: Alice <sip:alice@example.com>;tag=1928301774\r\nCall-ID: a84b4c76e66710@pc33.example.com\r\nCSeq: 314159 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let request = parse_request(raw).unwrap();
//! let serialized = serialize_request(&request);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use sip_core::{
    CSeq, Header, Method, NameAddr, ParseError, ParseField, Request, Response, SipMessage, SipUri,
    TextEncoding, Via,
};
use smol_str::SmolStr;

pub mod scanner;

pub use scanner::{ScanError, StreamScanner};

/// Hard upper bound on any single message the codec will look at.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest Content-Length the codec will honor.
const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// Returns `true` for NAT keep-alive pings: a payload consisting only of
/// CRLF (or bare CR / LF) sequences. These are dropped silently.
pub fn is_keepalive(payload: &[u8]) -> bool {
    !payload.is_empty() && payload.iter().all(|b| *b == b'\r' || *b == b'\n')
}

/// Cheap pre-parse heuristic: the first line of any SIP message contains the
/// literal `SIP` (either in the version token or the status line prefix).
pub fn looks_like_sip(payload: &[u8]) -> bool {
    let line_end = memchr::memchr(b'\n', payload).unwrap_or(payload.len());
    memchr::memmem::find(&payload[..line_end], b"SIP").is_some()
}

/// Parses a SIP message, auto-detecting request vs response, with the
/// default UTF-8 header encoding.
pub fn parse_message(raw: &[u8]) -> Result<SipMessage, ParseError> {
    parse_message_with(raw, TextEncoding::Utf8)
}

/// Parses a SIP message with an explicit header text encoding.
pub fn parse_message_with(raw: &[u8], encoding: TextEncoding) -> Result<SipMessage, ParseError> {
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(ParseError::new(ParseField::StartLine, "message too large").with_status(413));
    }
    let (head_bytes, body_bytes) = split_head_body(raw);
    let head = encoding.decode(head_bytes).ok_or_else(|| {
        ParseError::new(ParseField::StartLine, "header bytes not valid in configured encoding")
    })?;

    let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));
    let first = lines
        .next()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ParseError::new(ParseField::StartLine, "empty message"))?;

    if first.starts_with("SIP/") {
        let (status, reason) = parse_status_line(first)?;
        let (header, body) = parse_envelope(lines, body_bytes, None)?;
        Ok(SipMessage::Response(Response::new(
            status, reason, header, body,
        )))
    } else {
        let (method, uri) = parse_request_line(first)?;
        let (header, body) = parse_envelope(lines, body_bytes, Some(&method))?;
        Ok(SipMessage::Request(Request::new(method, uri, header, body)))
    }
}

/// Parses a request; responses are rejected with a start-line error.
pub fn parse_request(raw: &[u8]) -> Result<Request, ParseError> {
    match parse_message(raw)? {
        SipMessage::Request(req) => Ok(req),
        SipMessage::Response(_) => Err(ParseError::new(
            ParseField::StartLine,
            "expected request, got response",
        )),
    }
}

/// Parses a response; requests are rejected with a start-line error.
pub fn parse_response(raw: &[u8]) -> Result<Response, ParseError> {
    match parse_message(raw)? {
        SipMessage::Response(resp) => Ok(resp),
        SipMessage::Request(_) => Err(ParseError::new(
            ParseField::StartLine,
            "expected response, got request",
        )),
    }
}

/// Parses the request-line into a method and request URI.
fn parse_request_line(line: &str) -> Result<(Method, SipUri), ParseError> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim())
        .map_err(|_| ParseError::new(ParseField::StartLine, "malformed request line"))?;

    if !version_token.trim().eq_ignore_ascii_case("SIP/2.0") {
        return Err(ParseError::new(
            ParseField::StartLine,
            "unsupported SIP version",
        ));
    }
    let method = Method::from_token(method_token);
    let uri = SipUri::parse(uri_token)
        .ok_or_else(|| ParseError::new(ParseField::StartLine, "unparseable request URI"))?;
    Ok((method, uri))
}

/// Parses the status-line of a SIP response.
fn parse_status_line(line: &str) -> Result<(u16, SmolStr), ParseError> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, reason)) = parser(line.trim())
        .map_err(|_| ParseError::new(ParseField::StartLine, "malformed status line"))?;

    if !(100..=699).contains(&code) {
        return Err(ParseError::new(
            ParseField::StartLine,
            "status code out of range",
        ));
    }
    Ok((code, SmolStr::new(reason.trim())))
}

/// Parses header lines into the typed envelope and extracts the body.
fn parse_envelope<'a, I>(
    lines: I,
    body_bytes: &[u8],
    request_method: Option<&Method>,
) -> Result<(Header, Bytes), ParseError>
where
    I: Iterator<Item = &'a str>,
{
    let mut header = Header::new();
    let mut pending: Option<(SmolStr, String)> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        // RFC 3261 §7.3.1 line folding: continuation lines start with SP/HT.
        if line.starts_with(' ') || line.starts_with('\t') {
            match &mut pending {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => {
                    return Err(ParseError::new(
                        ParseField::Unknown,
                        "continuation line with no preceding header",
                    ))
                }
            }
        }
        if let Some((name, value)) = pending.take() {
            apply_header(&mut header, &name, value.trim())?;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ParseError::new(ParseField::Unknown, "header line missing colon")
        })?;
        pending = Some((canonical_header_name(name.trim()), value.to_owned()));
    }
    if let Some((name, value)) = pending.take() {
        apply_header(&mut header, &name, value.trim())?;
    }

    if header.vias.is_empty() {
        return Err(ParseError::new(ParseField::Via, "message has no Via"));
    }
    if let (Some(method), Some(cseq)) = (request_method, header.cseq.as_ref()) {
        if cseq.method != *method {
            return Err(ParseError::new(
                ParseField::CSeq,
                "CSeq method does not match request method",
            ));
        }
    }

    let body = extract_body(body_bytes, header.content_length)?;
    header.content_length = Some(body.len());
    Ok((header, body))
}

/// Routes one canonical header name/value into the typed envelope.
fn apply_header(header: &mut Header, name: &str, value: &str) -> Result<(), ParseError> {
    match name {
        "Via" => {
            for item in split_list_values(value) {
                let via = Via::parse(item)
                    .ok_or_else(|| ParseError::new(ParseField::Via, "unparseable Via"))?;
                header.vias.push(via);
            }
        }
        "From" => {
            header.from = Some(
                NameAddr::parse(value)
                    .ok_or_else(|| ParseError::new(ParseField::From, "unparseable From"))?,
            );
        }
        "To" => {
            header.to = Some(
                NameAddr::parse(value)
                    .ok_or_else(|| ParseError::new(ParseField::To, "unparseable To"))?,
            );
        }
        "Call-ID" => {
            if value.is_empty() {
                return Err(ParseError::new(ParseField::CallId, "empty Call-ID"));
            }
            header.call_id = Some(SmolStr::new(value));
        }
        "CSeq" => {
            header.cseq = Some(
                CSeq::parse(value)
                    .ok_or_else(|| ParseError::new(ParseField::CSeq, "unparseable CSeq"))?,
            );
        }
        "Contact" => {
            // A wildcard Contact ("*") only appears in REGISTER bodies we
            // pass through untouched.
            if value.trim() == "*" {
                header.push_unknown("Contact", "*");
            } else {
                for item in split_list_values(value) {
                    let contact = NameAddr::parse(item).ok_or_else(|| {
                        ParseError::new(ParseField::Contact, "unparseable Contact")
                    })?;
                    header.contacts.push(contact);
                }
            }
        }
        "Route" => {
            for item in split_list_values(value) {
                let route = NameAddr::parse(item)
                    .ok_or_else(|| ParseError::new(ParseField::Route, "unparseable Route"))?;
                header.routes.push(route);
            }
        }
        "Record-Route" => {
            for item in split_list_values(value) {
                let route = NameAddr::parse(item).ok_or_else(|| {
                    ParseError::new(ParseField::Route, "unparseable Record-Route")
                })?;
                header.record_routes.push(route);
            }
        }
        "Max-Forwards" => {
            let hops = value
                .parse()
                .map_err(|_| ParseError::new(ParseField::Unknown, "bad Max-Forwards"))?;
            header.max_forwards = Some(hops);
        }
        "Content-Length" => {
            let declared: u64 = value
                .parse()
                .map_err(|_| ParseError::new(ParseField::ContentLength, "non-numeric"))?;
            if declared > MAX_CONTENT_LENGTH as u64 {
                return Err(
                    ParseError::new(ParseField::ContentLength, "value too large").with_status(413),
                );
            }
            let declared = declared as usize;
            if let Some(existing) = header.content_length {
                if existing != declared {
                    return Err(ParseError::new(
                        ParseField::ContentLength,
                        "conflicting Content-Length values",
                    ));
                }
            }
            header.content_length = Some(declared);
        }
        "Content-Type" => {
            header.content_type = Some(SmolStr::new(value));
        }
        "Require" => {
            for token in value.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    header.require.push(SmolStr::new(token));
                }
            }
        }
        "Unsupported" => {
            for token in value.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    header.unsupported.push(SmolStr::new(token));
                }
            }
        }
        _ => header.push_unknown(name, value),
    }
    Ok(())
}

/// Splits raw bytes into head and body at the first CRLF-CRLF (tolerating
/// bare-LF separators from sloppy peers).
fn split_head_body(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = memchr::memmem::find(raw, b"\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = memchr::memmem::find(raw, b"\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, &[])
    }
}

/// Returns the body truncated to the declared Content-Length; shorter bodies
/// are a framing error.
fn extract_body(body_bytes: &[u8], declared: Option<usize>) -> Result<Bytes, ParseError> {
    match declared {
        None => Ok(Bytes::copy_from_slice(body_bytes)),
        Some(len) if len <= body_bytes.len() => Ok(Bytes::copy_from_slice(&body_bytes[..len])),
        Some(_) => Err(ParseError::new(
            ParseField::ContentLength,
            "body shorter than declared Content-Length",
        )),
    }
}

/// Expands RFC 3261 §7.3.3 compact forms and canonicalizes casing for the
/// headers the envelope types.
fn canonical_header_name(name: &str) -> SmolStr {
    let lower = name.to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "i" | "call-id" => "Call-ID",
        "f" | "from" => "From",
        "t" | "to" => "To",
        "m" | "contact" => "Contact",
        "l" | "content-length" => "Content-Length",
        "c" | "content-type" => "Content-Type",
        "v" | "via" => "Via",
        "cseq" => "CSeq",
        "route" => "Route",
        "record-route" => "Record-Route",
        "max-forwards" => "Max-Forwards",
        "require" => "Require",
        "unsupported" => "Unsupported",
        "k" => "Supported",
        "s" => "Subject",
        "e" => "Content-Encoding",
        "o" => "Event",
        "u" => "Allow-Events",
        "r" => "Refer-To",
        "b" => "Referred-By",
        _ => name,
    };
    SmolStr::new(canonical)
}

/// Splits a comma-separated header value at top level, honoring quoted
/// strings and angle brackets.
fn split_list_values(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut in_angles = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angles = true,
            '>' if !in_quotes => in_angles = false,
            ',' if !in_quotes && !in_angles => {
                out.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(value[start..].trim());
    out.retain(|s| !s.is_empty());
    out
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}

/// Serializes a request in canonical order, recomputing Content-Length.
pub fn serialize_request(req: &Request) -> Bytes {
    serialize_request_with(req, TextEncoding::Utf8)
}

/// Serializes a request with an explicit header text encoding.
pub fn serialize_request_with(req: &Request, encoding: TextEncoding) -> Bytes {
    use std::fmt::Write;
    let mut head = String::new();
    let _ = write!(head, "{} {} SIP/2.0\r\n", req.method.as_str(), req.uri);
    write_envelope(&mut head, &req.header, req.body.len());
    assemble(&head, &req.body, encoding)
}

/// Serializes a response in canonical order, recomputing Content-Length.
pub fn serialize_response(resp: &Response) -> Bytes {
    serialize_response_with(resp, TextEncoding::Utf8)
}

/// Serializes a response with an explicit header text encoding.
pub fn serialize_response_with(resp: &Response, encoding: TextEncoding) -> Bytes {
    use std::fmt::Write;
    let mut head = String::new();
    let _ = write!(head, "SIP/2.0 {} {}\r\n", resp.status, resp.reason);
    write_envelope(&mut head, &resp.header, resp.body.len());
    assemble(&head, &resp.body, encoding)
}

/// Serializes either message kind.
pub fn serialize_message(msg: &SipMessage) -> Bytes {
    match msg {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(resp) => serialize_response(resp),
    }
}

/// Stable header ordering: Vias top-first, From, To, Call-ID, CSeq,
/// Max-Forwards, Contact, Route, Record-Route, Content-Length, Content-Type,
/// remaining known headers alphabetically, then unknown in insertion order.
fn write_envelope(head: &mut String, header: &Header, body_len: usize) {
    use std::fmt::Write;
    for via in &header.vias {
        let _ = write!(head, "Via: {}\r\n", via);
    }
    if let Some(from) = &header.from {
        let _ = write!(head, "From: {}\r\n", from);
    }
    if let Some(to) = &header.to {
        let _ = write!(head, "To: {}\r\n", to);
    }
    if let Some(call_id) = &header.call_id {
        let _ = write!(head, "Call-ID: {}\r\n", call_id);
    }
    if let Some(cseq) = &header.cseq {
        let _ = write!(head, "CSeq: {}\r\n", cseq);
    }
    if let Some(hops) = header.max_forwards {
        let _ = write!(head, "Max-Forwards: {}\r\n", hops);
    }
    for contact in &header.contacts {
        let _ = write!(head, "Contact: {}\r\n", contact);
    }
    for route in &header.routes {
        let _ = write!(head, "Route: {}\r\n", route);
    }
    for route in &header.record_routes {
        let _ = write!(head, "Record-Route: {}\r\n", route);
    }
    let _ = write!(head, "Content-Length: {}\r\n", body_len);
    if let Some(ct) = &header.content_type {
        let _ = write!(head, "Content-Type: {}\r\n", ct);
    }
    if !header.require.is_empty() {
        let _ = write!(head, "Require: {}\r\n", join_tokens(&header.require));
    }
    if !header.unsupported.is_empty() {
        let _ = write!(head, "Unsupported: {}\r\n", join_tokens(&header.unsupported));
    }
    for (name, value) in &header.unknown {
        let _ = write!(head, "{}: {}\r\n", name, value);
    }
    head.push_str("\r\n");
}

fn join_tokens(tokens: &[SmolStr]) -> String {
    tokens
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn assemble(head: &str, body: &Bytes, encoding: TextEncoding) -> Bytes {
    let head_bytes = encoding.encode(head);
    let mut out = BytesMut::with_capacity(head_bytes.len() + body.len());
    out.put_slice(&head_bytes);
    out.put_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sip_core::Method;

    fn sample_request_bytes() -> &'static [u8] {
        b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=123\r\n\
Call-ID: abc123\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n"
    }

    #[test]
    fn parses_basic_request() {
        let req = parse_request(sample_request_bytes()).expect("parse");
        assert_eq!(req.method, Method::Options);
        assert_eq!(req.uri.host.as_str(), "example.com");
        assert_eq!(req.header.branch().map(|b| b.as_str()), Some("z9hG4bKx"));
        assert_eq!(req.header.from_tag(), Some("123"));
        assert_eq!(req.header.call_id.as_deref(), Some("abc123"));
        assert_eq!(req.header.max_forwards, Some(70));
    }

    #[test]
    fn rejects_missing_via() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\nCSeq: 1 OPTIONS\r\n\r\n";
        let err = parse_request(raw).unwrap_err();
        assert_eq!(err.field, ParseField::Via);
        assert_eq!(err.status, 400);
    }

    #[test]
    fn rejects_cseq_method_mismatch() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
CSeq: 1 INVITE\r\n\r\n";
        let err = parse_request(raw).unwrap_err();
        assert_eq!(err.field, ParseField::CSeq);
    }

    #[test]
    fn parses_response_status_line() {
        let raw = b"SIP/2.0 486 Busy Here\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n";
        let resp = parse_response(raw).expect("parse");
        assert_eq!(resp.status, 486);
        assert_eq!(resp.reason.as_str(), "Busy Here");
    }

    #[test]
    fn rejects_status_out_of_range() {
        let raw = b"SIP/2.0 99 Too Low\r\nVia: SIP/2.0/UDP h;branch=z9hG4bKx\r\n\r\n";
        assert!(parse_response(raw).is_err());
    }

    #[test]
    fn expands_compact_header_forms() {
        let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
v: SIP/2.0/UDP host;branch=z9hG4bKc\r\n\
f: <sip:alice@example.com>;tag=1\r\n\
t: <sip:bob@example.com>\r\n\
i: compact@test\r\n\
m: <sip:alice@10.0.0.1>\r\n\
l: 0\r\n\
CSeq: 1 INVITE\r\n\r\n";
        let req = parse_request(raw).expect("parse");
        assert_eq!(req.header.vias.len(), 1);
        assert_eq!(req.header.call_id.as_deref(), Some("compact@test"));
        assert_eq!(req.header.contacts.len(), 1);
        assert_eq!(req.header.content_length, Some(0));
    }

    #[test]
    fn folded_header_lines_are_unfolded() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Subject: first part\r\n\
 second part\r\n\
Content-Length: 0\r\n\r\n";
        let req = parse_request(raw).expect("parse");
        assert_eq!(
            req.header.get_unknown("Subject").map(|v| v.as_str()),
            Some("first part second part")
        );
    }

    #[test]
    fn splits_comma_separated_vias_and_routes() {
        let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP h1;branch=z9hG4bKa, SIP/2.0/TCP h2;branch=z9hG4bKb\r\n\
Route: <sip:p1.example;lr>, <sip:p2.example;lr>\r\n\
CSeq: 1 INVITE\r\n\r\n";
        let req = parse_request(raw).expect("parse");
        assert_eq!(req.header.vias.len(), 2);
        assert_eq!(req.header.vias[0].host.as_str(), "h1");
        assert_eq!(req.header.routes.len(), 2);
    }

    #[test]
    fn comma_inside_quoted_display_name_is_not_a_separator() {
        let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Contact: \"Lastname, First\" <sip:a@example.com>\r\n\
CSeq: 1 INVITE\r\n\r\n";
        let req = parse_request(raw).expect("parse");
        assert_eq!(req.header.contacts.len(), 1);
        assert_eq!(
            req.header.contacts[0].display_name.as_deref(),
            Some("Lastname, First")
        );
    }

    #[test]
    fn truncates_extra_body_bytes() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Content-Length: 4\r\n\r\nbodyEXTRA";
        let req = parse_request(raw).expect("parse");
        assert_eq!(req.body.as_ref(), b"body");
        assert_eq!(req.header.content_length, Some(4));
    }

    #[test]
    fn rejects_short_body() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Content-Length: 10\r\n\r\nbody";
        let err = parse_request(raw).unwrap_err();
        assert_eq!(err.field, ParseField::ContentLength);
    }

    #[test]
    fn rejects_conflicting_content_lengths() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Content-Length: 4\r\n\
Content-Length: 5\r\n\r\nbody!";
        assert!(parse_request(raw).is_err());
    }

    #[test]
    fn oversized_content_length_maps_to_413() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Content-Length: 99999999999\r\n\r\n";
        let err = parse_request(raw).unwrap_err();
        assert_eq!(err.status, 413);
    }

    #[test]
    fn unsupported_require_tokens_are_collected() {
        let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Require: 100rel, timer\r\n\
CSeq: 1 INVITE\r\n\r\n";
        let req = parse_request(raw).expect("parse");
        let tokens: Vec<&str> = req.header.require.iter().map(|t| t.as_str()).collect();
        assert_eq!(tokens, vec!["100rel", "timer"]);
    }

    #[test]
    fn keepalive_detection() {
        assert!(is_keepalive(b"\r\n"));
        assert!(is_keepalive(b"\r\n\r\n"));
        assert!(!is_keepalive(b""));
        assert!(!is_keepalive(b"OPTIONS"));
    }

    #[test]
    fn sip_heuristic() {
        assert!(looks_like_sip(b"OPTIONS sip:a SIP/2.0\r\n"));
        assert!(looks_like_sip(b"SIP/2.0 200 OK\r\n"));
        assert!(!looks_like_sip(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn serializer_emits_stable_order() {
        let req = parse_request(sample_request_bytes()).expect("parse");
        let text = String::from_utf8(serialize_request(&req).to_vec()).unwrap();
        let via_pos = text.find("Via:").unwrap();
        let from_pos = text.find("From:").unwrap();
        let to_pos = text.find("To:").unwrap();
        let call_id_pos = text.find("Call-ID:").unwrap();
        let cseq_pos = text.find("CSeq:").unwrap();
        let mf_pos = text.find("Max-Forwards:").unwrap();
        let cl_pos = text.find("Content-Length:").unwrap();
        assert!(via_pos < from_pos);
        assert!(from_pos < to_pos);
        assert!(to_pos < call_id_pos);
        assert!(call_id_pos < cseq_pos);
        assert!(cseq_pos < mf_pos);
        assert!(mf_pos < cl_pos);
    }

    #[test]
    fn serializer_recomputes_content_length() {
        let raw = b"MESSAGE sip:b@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
CSeq: 1 MESSAGE\r\n\
Content-Length: 2\r\n\r\nhi there";
        let mut req = parse_request(raw).expect("parse");
        req.body = Bytes::from_static(b"new body");
        let text = String::from_utf8(serialize_request(&req).to_vec()).unwrap();
        assert!(text.contains("Content-Length: 8\r\n"));
        assert_eq!(text.matches("Content-Length").count(), 1);
    }

    #[test]
    fn unknown_headers_round_trip_in_order() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
X-First: one\r\n\
X-Second: two\r\n\
X-First: three\r\n\
Content-Length: 0\r\n\r\n";
        let req = parse_request(raw).expect("parse");
        let out = serialize_request(&req);
        let reparsed = parse_request(&out).expect("reparse");
        let values: Vec<&str> = reparsed
            .header
            .unknown
            .iter()
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(values, vec!["one", "two", "three"]);
    }

    #[test]
    fn latin1_header_bytes_parse_when_configured() {
        let mut raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
Subject: caf".to_vec();
        raw.push(0xe9);
        raw.extend_from_slice(b"\r\nContent-Length: 0\r\n\r\n");

        assert!(parse_message(&raw).is_err());
        let msg = parse_message_with(&raw, TextEncoding::Latin1).expect("latin1 parse");
        assert_eq!(
            msg.header().get_unknown("Subject").map(|v| v.as_str()),
            Some("caf\u{e9}")
        );
    }

    proptest! {
        // Round-trip: parse(serialize(M)) == M up to canonical form.
        #[test]
        fn round_trips_random_requests(
            method_idx in 0usize..5,
            host in "[a-z]{1,8}",
            seq in 1u32..100_000,
            body in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let methods = [Method::Options, Method::Invite, Method::Bye, Method::Message, Method::Info];
            let method = methods[method_idx].clone();
            let mut header = Header::new();
            let mut via = Via::new("UDP", "client.example.com", Some(5060));
            via.branch = Some(SmolStr::new(format!("z9hG4bK{host}")));
            header.push_via(via);
            header.from = Some(NameAddr::parse("<sip:alice@example.com>;tag=1").unwrap());
            header.to = Some(NameAddr::parse("<sip:bob@example.com>").unwrap());
            header.call_id = Some(SmolStr::new(format!("{host}@example.com")));
            header.cseq = Some(CSeq::new(seq, method.clone()));
            header.max_forwards = Some(70);
            let req = Request::new(
                method,
                SipUri::parse(&format!("sip:{host}.example.com")).unwrap(),
                header,
                Bytes::from(body.clone()),
            );

            let bytes = serialize_request(&req);
            let reparsed = parse_request(&bytes).expect("reparse");
            prop_assert_eq!(&reparsed.method, &req.method);
            prop_assert_eq!(&reparsed.uri, &req.uri);
            prop_assert_eq!(reparsed.header.branch(), req.header.branch());
            prop_assert_eq!(reparsed.header.cseq.as_ref(), req.header.cseq.as_ref());
            prop_assert_eq!(reparsed.body.as_ref(), body.as_slice());
        }

        #[test]
        fn reserializing_is_stable(
            host in "[a-z]{1,8}",
        ) {
            let raw = format!(
                "OPTIONS sip:{host}.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP {host};branch=z9hG4bKp\r\n\
From: <sip:a@{host}>;tag=1\r\n\
To: <sip:b@{host}>\r\n\
Call-ID: x@{host}\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n"
            );
            let once = parse_request(raw.as_bytes()).expect("parse");
            let twice = parse_request(&serialize_request(&once)).expect("reparse");
            prop_assert_eq!(serialize_request(&once), serialize_request(&twice));
        }
    }
}
