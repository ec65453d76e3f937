// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `name-addr` / `addr-spec` values used by From, To, Contact, Route, and
//! Record-Route (RFC 3261 §20.10, §20.20, §20.30, §20.39).
//!
//! Display names may be quoted strings containing angle brackets and escaped
//! quotes. Parameters after the closing `>` belong to the header value, not
//! the URI.

use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

use crate::uri::SipUri;

/// A display-name + URI + header-parameter triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    /// Header parameters (e.g. `tag`, `expires`), lowercased names.
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl NameAddr {
    /// Wraps a bare URI with no display name or parameters.
    pub fn from_uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: BTreeMap::new(),
        }
    }

    /// Parses a `name-addr` or `addr-spec` header value.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (display_name, rest) = if trimmed.starts_with('"') {
            let (name, rest) = take_quoted_string(trimmed)?;
            (Some(SmolStr::new(name)), rest.trim_start())
        } else if let Some(open) = trimmed.find('<') {
            let name = trimmed[..open].trim();
            let display = if name.is_empty() {
                None
            } else {
                Some(SmolStr::new(name))
            };
            (display, &trimmed[open..])
        } else {
            (None, trimmed)
        };

        if let Some(rest) = rest.strip_prefix('<') {
            let close = rest.find('>')?;
            let uri = SipUri::parse(&rest[..close])?;
            let mut entry = Self {
                display_name,
                uri,
                params: BTreeMap::new(),
            };
            for param in rest[close + 1..].split(';') {
                let param = param.trim();
                if param.is_empty() {
                    continue;
                }
                match param.split_once('=') {
                    Some((k, v)) => entry.params.insert(
                        SmolStr::new(k.trim().to_ascii_lowercase()),
                        Some(SmolStr::new(v.trim())),
                    ),
                    None => entry
                        .params
                        .insert(SmolStr::new(param.to_ascii_lowercase()), None),
                };
            }
            Some(entry)
        } else {
            // addr-spec form: parameters after ';' belong to the header.
            if display_name.is_some() {
                return None;
            }
            let (uri_part, params_part) = match rest.split_once(';') {
                Some((uri, params)) => (uri, Some(params)),
                None => (rest, None),
            };
            let uri = SipUri::parse(uri_part.trim())?;
            let mut entry = Self::from_uri(uri);
            if let Some(params_part) = params_part {
                for param in params_part.split(';') {
                    let param = param.trim();
                    if param.is_empty() {
                        continue;
                    }
                    match param.split_once('=') {
                        Some((k, v)) => entry.params.insert(
                            SmolStr::new(k.trim().to_ascii_lowercase()),
                            Some(SmolStr::new(v.trim())),
                        ),
                        None => entry
                            .params
                            .insert(SmolStr::new(param.to_ascii_lowercase()), None),
                    };
                }
            }
            Some(entry)
        }
    }

    /// Returns the `tag` parameter (From/To).
    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").and_then(|v| v.as_deref())
    }

    /// Sets the `tag` parameter.
    pub fn set_tag(&mut self, tag: impl Into<SmolStr>) {
        self.params.insert(SmolStr::new("tag"), Some(tag.into()));
    }

    /// Looks up a header parameter by lowercase name.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }

    /// `true` when this entry names a loose router. Route entries written in
    /// addr-spec form put `lr` on the header value rather than the URI, so
    /// both spots are checked.
    pub fn is_loose_router(&self) -> bool {
        self.uri.is_loose_router() || self.params.contains_key("lr")
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name.replace('"', "\\\""))?;
        }
        write!(f, "<{}>", self.uri)?;
        for (key, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", key, v)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}

/// Takes a leading quoted string, handling `\"` escapes; returns the
/// unescaped content and the remainder after the closing quote.
fn take_quoted_string(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices();
    let (_, first) = chars.next()?;
    if first != '"' {
        return None;
    }
    let mut out = String::new();
    let mut escaped = false;
    for (idx, c) in chars {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some((out, &input[idx + 1..]));
        } else {
            out.push(c);
        }
    }
    None
}
