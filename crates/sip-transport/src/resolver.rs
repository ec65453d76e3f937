// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The resolver capability the transport consumes.
//!
//! DNS internals live outside this crate; the transport only needs a
//! non-blocking cache probe plus an awaitable lookup. `None` from the cache
//! means "unknown, try async"; [`ResolveOutcome::Empty`] is a negative
//! entry (do not retry soon).

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use sip_core::{Scheme, SipUri};
use tokio_util::sync::CancellationToken;

use crate::endpoint::SipEndpoint;
use crate::TransportKind;

/// Result of a name resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(SipEndpoint),
    /// Negative cache entry: the name is known not to resolve.
    Empty,
}

/// Name resolution capability consumed by the transport.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Non-blocking cache probe. `None` means the cache has no answer and
    /// an async lookup is worth starting.
    fn resolve_from_cache(&self, uri: &SipUri, prefer_ipv6: bool) -> Option<ResolveOutcome>;

    /// Full lookup; may take seconds. Implementations must observe `cancel`
    /// and return [`ResolveOutcome::Empty`] promptly when it fires.
    async fn resolve(
        &self,
        uri: &SipUri,
        prefer_ipv6: bool,
        cancel: CancellationToken,
    ) -> ResolveOutcome;
}

/// Derives the transport protocol a URI asks for: the `transport` parameter
/// when present, otherwise TLS for `sips:` and UDP for `sip:`.
pub fn uri_protocol(uri: &SipUri) -> TransportKind {
    if let Some(Some(token)) = uri.param("transport") {
        if let Some(kind) = TransportKind::parse(token) {
            return kind;
        }
    }
    if uri.scheme == Scheme::Sips {
        TransportKind::Tls
    } else {
        TransportKind::Udp
    }
}

/// Resolver that only answers IP-literal hosts, immediately. Names miss the
/// cache and resolve to [`ResolveOutcome::Empty`]; deployments plug a real
/// DNS-backed implementation in instead.
#[derive(Debug, Default)]
pub struct IpLiteralResolver;

impl IpLiteralResolver {
    fn literal(&self, uri: &SipUri) -> Option<SipEndpoint> {
        let ip: IpAddr = uri.host.parse().ok()?;
        let port = uri.port_or_default();
        Some(SipEndpoint::new(
            uri_protocol(uri),
            SocketAddr::new(ip, port),
        ))
    }
}

#[async_trait]
impl Resolver for IpLiteralResolver {
    fn resolve_from_cache(&self, uri: &SipUri, _prefer_ipv6: bool) -> Option<ResolveOutcome> {
        self.literal(uri).map(ResolveOutcome::Resolved)
    }

    async fn resolve(
        &self,
        uri: &SipUri,
        _prefer_ipv6: bool,
        _cancel: CancellationToken,
    ) -> ResolveOutcome {
        match self.literal(uri) {
            Some(ep) => ResolveOutcome::Resolved(ep),
            None => ResolveOutcome::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_protocol_follows_param_and_scheme() {
        let uri = SipUri::parse("sip:h.example;transport=tcp").unwrap();
        assert_eq!(uri_protocol(&uri), TransportKind::Tcp);
        let uri = SipUri::parse("sips:h.example").unwrap();
        assert_eq!(uri_protocol(&uri), TransportKind::Tls);
        let uri = SipUri::parse("sip:h.example").unwrap();
        assert_eq!(uri_protocol(&uri), TransportKind::Udp);
    }

    #[tokio::test]
    async fn literal_resolver_answers_ips_only() {
        let resolver = IpLiteralResolver;
        let uri = SipUri::parse("sip:192.0.2.5:5080").unwrap();
        let outcome = resolver.resolve_from_cache(&uri, false).unwrap();
        match outcome {
            ResolveOutcome::Resolved(ep) => {
                assert_eq!(ep.addr, "192.0.2.5:5080".parse::<SocketAddr>().unwrap());
                assert_eq!(ep.protocol, TransportKind::Udp);
            }
            ResolveOutcome::Empty => panic!("expected a hit"),
        }

        let name = SipUri::parse("sip:host.example.com").unwrap();
        assert!(resolver.resolve_from_cache(&name, false).is_none());
        assert_eq!(
            resolver
                .resolve(&name, false, CancellationToken::new())
                .await,
            ResolveOutcome::Empty
        );
    }
}
