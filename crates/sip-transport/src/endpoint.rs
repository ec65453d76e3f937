// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP endpoints: (protocol, address, port) plus optional channel and
//! connection identity, and the local-address helpers the routing logic
//! leans on.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use smol_str::SmolStr;

use crate::TransportKind;

/// One end of a SIP hop.
///
/// `channel_id` pins a specific local channel; `connection_id` pins a
/// specific connection-oriented session on that channel. An endpoint with a
/// wildcard address (`0.0.0.0` / `::`) is the *blackhole*: sends to it
/// succeed silently without wire activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipEndpoint {
    pub protocol: TransportKind,
    pub addr: SocketAddr,
    pub channel_id: Option<SmolStr>,
    pub connection_id: Option<SmolStr>,
}

impl SipEndpoint {
    pub fn new(protocol: TransportKind, addr: SocketAddr) -> Self {
        Self {
            protocol,
            addr,
            channel_id: None,
            connection_id: None,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<SmolStr>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<SmolStr>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// `true` for the wildcard destination: send succeeds, nothing hits the
    /// wire. Useful in tests and for muting a media description.
    pub fn is_blackhole(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for SipEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol.as_str(), self.addr)
    }
}

/// Enumerates the machine's unicast addresses. Used to expand
/// wildcard-bound channels and to answer "is this URI host one of ours".
pub fn machine_addresses() -> Vec<IpAddr> {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.into_iter().map(|i| i.ip()).collect(),
        Err(_) => Vec::new(),
    }
}

/// `true` when `host` names this machine: it parses to a local IP, or it is
/// the literal loopback name.
pub fn is_local_host(host: &str, extra: &[IpAddr]) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || extra.contains(&ip)
                || machine_addresses().contains(&ip)
        }
        Err(_) => false,
    }
}

/// Asks the OS routing table for the preferred local source address toward
/// `dst` by connecting an ephemeral UDP socket (no packets are sent).
pub fn preferred_source(dst: IpAddr) -> Option<IpAddr> {
    let bind: SocketAddr = if dst.is_ipv6() {
        "[::]:0".parse().ok()?
    } else {
        "0.0.0.0:0".parse().ok()?
    };
    let socket = std::net::UdpSocket::bind(bind).ok()?;
    socket.connect(SocketAddr::new(dst, 9)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// The OS's default outbound address for the given family, probed against a
/// well-known public destination.
pub fn default_outbound(ipv6: bool) -> Option<IpAddr> {
    let probe: IpAddr = if ipv6 {
        "2001:4860:4860::8888".parse().ok()?
    } else {
        "8.8.8.8".parse().ok()?
    };
    preferred_source(probe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blackhole_detection() {
        let ep = SipEndpoint::new(TransportKind::Udp, "0.0.0.0:5060".parse().unwrap());
        assert!(ep.is_blackhole());
        let ep = SipEndpoint::new(TransportKind::Udp, "[::]:5060".parse().unwrap());
        assert!(ep.is_blackhole());
        let ep = SipEndpoint::new(TransportKind::Udp, "127.0.0.1:5060".parse().unwrap());
        assert!(!ep.is_blackhole());
    }

    #[test]
    fn display_includes_protocol() {
        let ep = SipEndpoint::new(TransportKind::Tls, "192.0.2.7:5061".parse().unwrap());
        assert_eq!(ep.to_string(), "tls:192.0.2.7:5061");
    }

    #[test]
    fn loopback_counts_as_local() {
        assert!(is_local_host("127.0.0.1", &[]));
        assert!(is_local_host("localhost", &[]));
        assert!(is_local_host("::1", &[]));
        assert!(!is_local_host("203.0.113.9", &[]));
        assert!(!is_local_host("example.com", &[]));
    }

    #[test]
    fn preferred_source_toward_loopback_is_loopback() {
        let src = preferred_source("127.0.0.1".parse().unwrap()).expect("source");
        assert!(src.is_loopback());
    }
}
