// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP URI (RFC 3261 §19) with the routing predicates the transport needs.
//!
//! Equality is scheme-sensitive and host-case-insensitive (hosts are folded
//! to lowercase at parse time). The `lr` parameter marks a loose router; a
//! wildcard host (`0.0.0.0` / `::`) marks a placeholder that must be
//! rewritten with the selected local endpoint before the message is sent.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// URI scheme carried by a [`SipUri`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
    /// RFC 3966 telephone URI, carried opaquely (`host` holds the number).
    Tel,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
        }
    }
}

/// Parsed representation of a SIP, SIPS, or tel URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<SmolStr>,
    pub password: Option<SmolStr>,
    /// Lowercased at parse time so derived equality is case-insensitive.
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
    pub headers: BTreeMap<SmolStr, SmolStr>,
}

impl SipUri {
    /// Constructs a `sip:` URI with the given host and default settings.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: None,
            password: None,
            host: host.into(),
            port: None,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Attempts to parse a SIP, SIPS, or tel URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme_str, rest) = input.trim().split_once(':')?;
        let scheme = if scheme_str.eq_ignore_ascii_case("sip") {
            Scheme::Sip
        } else if scheme_str.eq_ignore_ascii_case("sips") {
            Scheme::Sips
        } else if scheme_str.eq_ignore_ascii_case("tel") {
            Scheme::Tel
        } else {
            return None;
        };

        if scheme == Scheme::Tel {
            return Self::parse_tel(rest);
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut params = BTreeMap::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if let Some((k, v)) = param.split_once('=') {
                params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                );
            } else {
                params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
            }
        }

        let (userinfo, host_port) = match base.rsplit_once('@') {
            Some((userinfo, host)) => (Some(userinfo.trim()), host.trim()),
            None => (None, base.trim()),
        };

        let (user, password) = match userinfo {
            Some(info) => {
                let (user, password) = match info.split_once(':') {
                    Some((u, p)) => (u, Some(p)),
                    None => (info, None),
                };
                let user = percent_decode_str(user)
                    .decode_utf8()
                    .ok()
                    .map(|s| SmolStr::new(s.as_ref()))?;
                let password = match password {
                    Some(p) => Some(SmolStr::new(
                        percent_decode_str(p).decode_utf8().ok()?.as_ref(),
                    )),
                    None => None,
                };
                (Some(user), password)
            }
            None => (None, None),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        let host = percent_decode_str(host)
            .decode_utf8()
            .ok()?
            .to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        let mut headers = BTreeMap::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if pair.is_empty() {
                    continue;
                }
                if let Some((k, v)) = pair.split_once('=') {
                    headers.insert(SmolStr::new(k.trim()), SmolStr::new(v.trim()));
                }
            }
        }

        Some(Self {
            scheme,
            user,
            password,
            host: SmolStr::new(host),
            port,
            params,
            headers,
        })
    }

    fn parse_tel(rest: &str) -> Option<Self> {
        let mut parts = rest.split(';');
        let number = parts.next()?.trim();
        if number.is_empty() {
            return None;
        }
        let mut params = BTreeMap::new();
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if let Some((k, v)) = param.split_once('=') {
                params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                );
            } else {
                params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
            }
        }
        Some(Self {
            scheme: Scheme::Tel,
            user: None,
            password: None,
            host: SmolStr::new(number),
            port: None,
            params,
            headers: BTreeMap::new(),
        })
    }

    /// Looks up a URI parameter by lowercase name.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }

    /// Sets a URI parameter.
    pub fn set_param(&mut self, name: impl Into<SmolStr>, value: Option<SmolStr>) {
        let name = name.into();
        self.params
            .insert(SmolStr::new(name.to_ascii_lowercase()), value);
    }

    /// `true` when the URI carries the `lr` loose-routing parameter.
    pub fn is_loose_router(&self) -> bool {
        self.params.contains_key("lr")
    }

    /// `true` when the host is the wildcard IPv4/IPv6 address, meaning the
    /// URI is a placeholder to be filled in with a local endpoint at send
    /// time.
    pub fn is_placeholder(&self) -> bool {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip.is_unspecified(),
            Err(_) => self.host == "::0",
        }
    }

    /// Returns the host with the explicit or scheme-default port.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.scheme {
            Scheme::Sips => 5061,
            _ => 5060,
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }
        if self.host.contains(':') && self.scheme != Scheme::Tel {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        let mut first = true;
        for (name, value) in &self.headers {
            write!(f, "{}{}={}", if first { "?" } else { "&" }, name, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Splits a host[:port] or IPv6 literal "[host]:port" string.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if input.starts_with('[') {
        let end = input.find(']')?;
        let host = &input[1..end];
        let remainder = &input[end + 1..];
        if let Some(port_str) = remainder.strip_prefix(':') {
            Some((host, Some(port_str.parse().ok()?)))
        } else if remainder.is_empty() {
            Some((host, None))
        } else {
            None
        }
    } else if let Some(idx) = input.rfind(':') {
        if input.matches(':').count() > 1 {
            // Unbracketed IPv6 is rejected.
            return None;
        }
        let (host, port_str) = input.split_at(idx);
        let port = port_str[1..].parse().ok()?;
        Some((host, Some(port)))
    } else {
        Some((input, None))
    }
}
