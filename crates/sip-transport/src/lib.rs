// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Multi-channel SIP transport layer.
//!
//! The [`SipTransport`] hub owns a set of [`Channel`]s (UDP, TCP, TLS, WS),
//! routes outbound messages to the channel that best matches the
//! destination, demultiplexes inbound bytes into SIP vs STUN, rewrites
//! self-referential headers at send time, and feeds every parsed message
//! through the transaction engine before surfacing it to the application.
//!
//! # Example
//! ```no_run
//! use sip_transport::{SipTransport, TransportConfig};
//! # async fn example() -> anyhow::Result<()> {
//! let transport = SipTransport::new(TransportConfig::default());
//! transport.add_udp_channel("127.0.0.1:0".parse()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod resolver;
pub mod rewrite;
pub mod route;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
pub mod transport;
pub mod udp;
#[cfg(feature = "ws")]
pub mod ws;

pub use channel::{Channel, ChannelEvent, InboundQueue, InboundQueueRx, ReceivedPacket};
pub use endpoint::SipEndpoint;
pub use error::TransportError;
pub use resolver::{ResolveOutcome, Resolver};
pub use transport::{
    IncomingRequest, SendStatus, SipHandler, SipTransport, TraceEvent, TransportConfig,
};

use sip_transaction::Transport;

/// Transport protocols a channel can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    /// WebSocket transport (RFC 7118).
    Ws,
    /// Secure WebSocket transport (RFC 7118).
    Wss,
}

impl TransportKind {
    /// Lowercase transport string for logging and endpoint display.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }

    /// The Via header transport parameter value per RFC 3261/7118.
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
        }
    }

    /// Parses a transport token from a Via header or URI parameter.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            "ws" => Some(TransportKind::Ws),
            "wss" => Some(TransportKind::Wss),
            _ => None,
        }
    }

    /// Everything except UDP delivers reliably.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    /// TLS-protected transports back `sips:` URIs.
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }
}

impl From<TransportKind> for Transport {
    fn from(value: TransportKind) -> Self {
        match value {
            TransportKind::Udp => Transport::Udp,
            TransportKind::Tcp => Transport::Tcp,
            TransportKind::Tls => Transport::Tls,
            TransportKind::Ws => Transport::Ws,
            TransportKind::Wss => Transport::Wss,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_via_tokens() {
        for kind in [
            TransportKind::Udp,
            TransportKind::Tcp,
            TransportKind::Tls,
            TransportKind::Ws,
            TransportKind::Wss,
        ] {
            assert_eq!(TransportKind::parse(kind.via_transport()), Some(kind));
            assert_eq!(TransportKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransportKind::parse("sctp"), None);
    }

    #[test]
    fn reliability_and_security_split() {
        assert!(!TransportKind::Udp.is_reliable());
        assert!(TransportKind::Tcp.is_reliable());
        assert!(TransportKind::Wss.is_secure());
        assert!(!TransportKind::Ws.is_secure());
    }
}
