// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Via header (RFC 3261 §20.42).
//!
//! The top Via identifies the sender of the current hop and carries the
//! branch token that names the transaction. `branch`, `received`, and
//! `rport` are first-class fields because the transport rewrites them on
//! receive and send; everything else rides in `params`.
//!
//! # Format
//!
//! ```text
//! Via: SIP/2.0/UDP host:port;branch=z9hG4bK776asdhds
//! Via: SIP/2.0/TCP [2001:db8::1]:5060;branch=z9hG4bK776;rport
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use smol_str::SmolStr;

/// RFC 3261 magic cookie prefixing every compliant branch token.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

const MAX_PARAMS: usize = 20;

/// The `rport` parameter tri-state (RFC 3581).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rport {
    /// No rport parameter present.
    #[default]
    Absent,
    /// Bare `;rport`: the sender asks us to fill in the source port.
    Requested,
    /// `;rport=N`, filled in by the receiving side.
    Value(u16),
}

/// Parsed representation of one Via header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token as sent (`UDP`, `TCP`, `TLS`, `WS`, `WSS`).
    pub transport: SmolStr,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub branch: Option<SmolStr>,
    pub received: Option<SmolStr>,
    pub rport: Rport,
    /// Remaining parameters, lowercased names, insertion-independent order.
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl Via {
    /// Creates a Via for the given transport and host, no parameters.
    pub fn new(transport: impl Into<SmolStr>, host: impl Into<SmolStr>, port: Option<u16>) -> Self {
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            branch: None,
            received: None,
            rport: Rport::Absent,
            params: BTreeMap::new(),
        }
    }

    /// Parses a single Via header value (`SIP/2.0/UDP host;params`).
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.chars().any(|c| c.is_control()) {
            return None;
        }

        let mut parts = trimmed.split(';');
        let value_part = parts.next()?.trim();

        let mut tokens = value_part.split_whitespace();
        let protocol = tokens.next()?;
        let sent_by = tokens.next()?;
        if tokens.next().is_some() {
            return None;
        }

        let mut proto_parts = protocol.split('/');
        if !proto_parts.next()?.eq_ignore_ascii_case("SIP") {
            return None;
        }
        if proto_parts.next()? != "2.0" {
            return None;
        }
        let transport = proto_parts.next()?;
        if transport.is_empty() || proto_parts.next().is_some() {
            return None;
        }

        let (host, port) = split_sent_by(sent_by)?;

        let mut via = Via::new(
            SmolStr::new(transport.to_ascii_uppercase()),
            SmolStr::new(host),
            port,
        );

        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if via.params.len() >= MAX_PARAMS {
                return None;
            }
            match param.split_once('=') {
                Some((k, v)) => {
                    let k = k.trim().to_ascii_lowercase();
                    let v = v.trim();
                    match k.as_str() {
                        "branch" => via.branch = Some(SmolStr::new(v)),
                        "received" => via.received = Some(SmolStr::new(v)),
                        "rport" => via.rport = Rport::Value(v.parse().ok()?),
                        _ => {
                            via.params.insert(SmolStr::new(k), Some(SmolStr::new(v)));
                        }
                    }
                }
                None => {
                    let k = param.to_ascii_lowercase();
                    if k == "rport" {
                        via.rport = Rport::Requested;
                    } else {
                        via.params.insert(SmolStr::new(k), None);
                    }
                }
            }
        }

        Some(via)
    }

    /// `true` when the branch starts with the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch
            .as_deref()
            .map(|b| b.starts_with(MAGIC_COOKIE))
            .unwrap_or(false)
    }

    /// The `host[:port]` token for transaction matching.
    pub fn sent_by(&self) -> SmolStr {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.to_string()
        };
        match self.port {
            Some(port) => SmolStr::new(format!("{}:{}", host, port)),
            None => SmolStr::new(host),
        }
    }

    /// `true` when the Via host is a wildcard placeholder to be rewritten
    /// with the selected local endpoint before sending.
    pub fn is_placeholder(&self) -> bool {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip.is_unspecified(),
            Err(_) => self.host == "::0",
        }
    }

    /// The address a response should be sent back to: `received` (with the
    /// rport port) when present, otherwise the sent-by host/port.
    pub fn response_target(&self) -> (SmolStr, u16) {
        let host = self
            .received
            .clone()
            .unwrap_or_else(|| self.host.clone());
        let port = match self.rport {
            Rport::Value(p) => p,
            _ => self.port.unwrap_or(5060),
        };
        (host, port)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by())?;
        if let Some(rec) = &self.received {
            write!(f, ";received={}", rec)?;
        }
        match self.rport {
            Rport::Absent => {}
            Rport::Requested => write!(f, ";rport")?,
            Rport::Value(p) => write!(f, ";rport={}", p)?,
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={}", branch)?;
        }
        for (key, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", key, v)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}

/// Splits `host`, `host:port`, or `[v6]:port` into host and optional port.
fn split_sent_by(input: &str) -> Option<(&str, Option<u16>)> {
    if input.starts_with('[') {
        let end = input.find(']')?;
        let host = &input[1..end];
        if host.is_empty() {
            return None;
        }
        let remainder = &input[end + 1..];
        if remainder.is_empty() {
            return Some((host, None));
        }
        let port = remainder.strip_prefix(':')?.parse().ok()?;
        return Some((host, Some(port)));
    }
    if input.contains('[') || input.contains(']') {
        return None;
    }
    if input.matches(':').count() > 1 {
        return None;
    }
    match input.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None if !input.is_empty() => Some((input, None)),
        None => None,
    }
}
