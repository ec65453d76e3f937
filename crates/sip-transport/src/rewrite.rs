// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outbound header rewriting.
//!
//! Messages are composed before a local endpoint is known, so Via, From,
//! and Contact may carry the wildcard placeholder (`0.0.0.0` / `::`).
//! After channel selection the placeholders are substituted with the
//! selected local endpoint, and the Contact scheme/transport is coerced to
//! the protocol actually used. A pure function: `(local, header) ->
//! header'`.

use std::net::SocketAddr;
use std::sync::Arc;

use sip_core::{Header, Scheme, SipUri};
use smol_str::SmolStr;

use crate::endpoint::SipEndpoint;
use crate::TransportKind;

/// Optional user hook run before the default rewrite; returning a header
/// replaces the current one, and the default rewrite still runs after.
pub type HeaderHook =
    Arc<dyn Fn(&SipEndpoint, &SipEndpoint, &Header) -> Option<Header> + Send + Sync>;

/// Substitutes placeholders in Via/From/Contact with the selected local
/// endpoint and aligns the wire protocol hints.
pub fn rewrite_outbound(
    header: &mut Header,
    local: SocketAddr,
    protocol: TransportKind,
    contact_host: Option<&str>,
) {
    if let Some(via) = header.top_via_mut() {
        if via.is_placeholder() {
            via.host = host_string(local);
            via.port = Some(local.port());
        }
        via.transport = SmolStr::new(protocol.via_transport());
    }

    if let Some(from) = header.from.as_mut() {
        if from.uri.is_placeholder() {
            set_uri_host(&mut from.uri, local);
        }
    }

    for contact in header.contacts.iter_mut() {
        match contact_host {
            Some(host) => {
                // A configured contact host wins over the placeholder; when
                // it is an IP literal the local port is carried along.
                contact.uri.host = SmolStr::new(host.to_ascii_lowercase());
                if host.parse::<std::net::IpAddr>().is_ok() {
                    contact.uri.port = Some(local.port());
                } else {
                    contact.uri.port = None;
                }
            }
            None => {
                if contact.uri.is_placeholder() {
                    set_uri_host(&mut contact.uri, local);
                }
            }
        }
        coerce_contact_protocol(&mut contact.uri, protocol);
    }
}

fn host_string(addr: SocketAddr) -> SmolStr {
    SmolStr::new(addr.ip().to_string())
}

fn set_uri_host(uri: &mut SipUri, local: SocketAddr) {
    uri.host = host_string(local);
    uri.port = Some(local.port());
}

/// Aligns a Contact URI's scheme and `transport` parameter with the send
/// protocol.
fn coerce_contact_protocol(uri: &mut SipUri, protocol: TransportKind) {
    uri.scheme = if protocol.is_secure() {
        Scheme::Sips
    } else {
        Scheme::Sip
    };
    match protocol {
        TransportKind::Udp => {
            uri.params.remove("transport");
        }
        other => {
            uri.set_param("transport", Some(SmolStr::new(other.as_str())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::{NameAddr, Via};

    fn placeholder_header() -> Header {
        let mut header = Header::new();
        let mut via = Via::new("UDP", "0.0.0.0", Some(0));
        via.branch = Some(SmolStr::new("z9hG4bKrw"));
        header.push_via(via);
        header.from = Some(NameAddr::parse("<sip:alice@0.0.0.0>;tag=1").unwrap());
        header
            .contacts
            .push(NameAddr::parse("<sip:alice@0.0.0.0>").unwrap());
        header
    }

    #[test]
    fn placeholders_become_local_endpoint() {
        let mut header = placeholder_header();
        let local: SocketAddr = "192.0.2.8:5062".parse().unwrap();
        rewrite_outbound(&mut header, local, TransportKind::Udp, None);

        let via = header.top_via().unwrap();
        assert_eq!(via.host.as_str(), "192.0.2.8");
        assert_eq!(via.port, Some(5062));
        assert_eq!(via.transport.as_str(), "UDP");

        assert_eq!(
            header.from.as_ref().unwrap().uri.host.as_str(),
            "192.0.2.8"
        );
        assert_eq!(header.contacts[0].uri.host.as_str(), "192.0.2.8");
        assert_eq!(header.contacts[0].uri.port, Some(5062));
    }

    #[test]
    fn concrete_hosts_are_left_alone() {
        let mut header = Header::new();
        let mut via = Via::new("UDP", "203.0.113.4", Some(5060));
        via.branch = Some(SmolStr::new("z9hG4bKrw2"));
        header.push_via(via);
        header.from = Some(NameAddr::parse("<sip:a@203.0.113.4>;tag=2").unwrap());

        rewrite_outbound(
            &mut header,
            "192.0.2.8:5062".parse().unwrap(),
            TransportKind::Tcp,
            None,
        );
        let via = header.top_via().unwrap();
        assert_eq!(via.host.as_str(), "203.0.113.4");
        // Transport param still tracks the selected protocol.
        assert_eq!(via.transport.as_str(), "TCP");
        assert_eq!(header.from.as_ref().unwrap().uri.host.as_str(), "203.0.113.4");
    }

    #[test]
    fn contact_host_override_wins() {
        let mut header = placeholder_header();
        rewrite_outbound(
            &mut header,
            "192.0.2.8:5062".parse().unwrap(),
            TransportKind::Udp,
            Some("198.51.100.3"),
        );
        assert_eq!(header.contacts[0].uri.host.as_str(), "198.51.100.3");
        // IP override carries the local port.
        assert_eq!(header.contacts[0].uri.port, Some(5062));
    }

    #[test]
    fn contact_host_name_override_drops_port() {
        let mut header = placeholder_header();
        rewrite_outbound(
            &mut header,
            "192.0.2.8:5062".parse().unwrap(),
            TransportKind::Udp,
            Some("sip.example.com"),
        );
        assert_eq!(header.contacts[0].uri.host.as_str(), "sip.example.com");
        assert_eq!(header.contacts[0].uri.port, None);
    }

    #[test]
    fn contact_protocol_coercion() {
        let mut header = placeholder_header();
        rewrite_outbound(
            &mut header,
            "192.0.2.8:5061".parse().unwrap(),
            TransportKind::Tls,
            None,
        );
        assert_eq!(header.contacts[0].uri.scheme, Scheme::Sips);
        assert_eq!(
            header.contacts[0].uri.param("transport").and_then(|v| v.as_deref()),
            Some("tls")
        );

        let mut header = placeholder_header();
        rewrite_outbound(
            &mut header,
            "192.0.2.8:5060".parse().unwrap(),
            TransportKind::Udp,
            None,
        );
        assert_eq!(header.contacts[0].uri.scheme, Scheme::Sip);
        assert!(header.contacts[0].uri.param("transport").is_none());
    }

    #[test]
    fn ipv6_local_endpoint_formats_cleanly() {
        let mut header = placeholder_header();
        let local: SocketAddr = "[2001:db8::7]:5060".parse().unwrap();
        rewrite_outbound(&mut header, local, TransportKind::Udp, None);
        let via = header.top_via().unwrap();
        assert_eq!(via.host.as_str(), "2001:db8::7");
        assert_eq!(via.sent_by().as_str(), "[2001:db8::7]:5060");
    }
}
