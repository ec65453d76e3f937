// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The channel contract shared by every transport implementation, plus the
//! bounded inbound queue all channels feed.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::warn;

use crate::endpoint::{machine_addresses, SipEndpoint};
use crate::error::TransportError;
use crate::TransportKind;

/// Raw bytes delivered by a channel with the endpoints they traveled
/// between.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub local: SipEndpoint,
    pub remote: SipEndpoint,
    pub payload: Bytes,
}

/// Events a channel pushes up to the transport.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Packet(ReceivedPacket),
    /// A connection-oriented session ended; cached connection ids pointing
    /// at it must be evicted.
    ConnectionClosed {
        channel_id: SmolStr,
        connection_id: SmolStr,
    },
}

/// Transport-specific endpoint: listens, connects, sends, and delivers
/// received frames into the transport's inbound queue.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> &SmolStr;

    fn protocol(&self) -> TransportKind;

    /// The bound local endpoint; may carry a wildcard address.
    fn listening_endpoint(&self) -> SipEndpoint;

    /// The bound endpoint expanded to concrete machine addresses when the
    /// bind is a wildcard.
    fn listening_endpoints(&self) -> Vec<SipEndpoint> {
        let ep = self.listening_endpoint();
        if !ep.addr.ip().is_unspecified() {
            return vec![ep];
        }
        let port = ep.addr.port();
        let v6 = ep.addr.is_ipv6();
        machine_addresses()
            .into_iter()
            .filter(|ip| ip.is_ipv6() == v6)
            .map(|ip| {
                SipEndpoint::new(self.protocol(), SocketAddr::new(ip, port))
                    .with_channel(self.id().clone())
            })
            .collect()
    }

    fn supports_protocol(&self, protocol: TransportKind) -> bool {
        protocol == self.protocol()
    }

    fn supports_ipv6(&self) -> bool {
        self.listening_endpoint().addr.is_ipv6()
    }

    fn is_reliable(&self) -> bool {
        self.protocol().is_reliable()
    }

    /// Sends bytes to `dst`. `can_initiate` permits opening a new
    /// connection on connection-oriented channels; `connection_hint` pins a
    /// specific cached session.
    async fn send(
        &self,
        dst: SocketAddr,
        payload: Bytes,
        can_initiate: bool,
        connection_hint: Option<&SmolStr>,
    ) -> Result<(), TransportError>;

    /// Stops the channel's tasks and closes its sockets.
    async fn close(&self);
}

/// Producer handle for the transport's inbound queue.
///
/// With a bound, saturation drops the **newest** event with a warning, per
/// the backpressure contract; the receive worker is the single consumer.
#[derive(Clone)]
pub struct InboundQueue {
    tx: QueueTx,
}

#[derive(Clone)]
enum QueueTx {
    Bounded(mpsc::Sender<ChannelEvent>),
    Unbounded(mpsc::UnboundedSender<ChannelEvent>),
}

/// Consumer half handed to the receive worker.
pub enum InboundQueueRx {
    Bounded(mpsc::Receiver<ChannelEvent>),
    Unbounded(mpsc::UnboundedReceiver<ChannelEvent>),
}

impl InboundQueue {
    /// A queue bounded at `capacity` events (capacity 0 means unbounded).
    pub fn new(capacity: usize) -> (Self, InboundQueueRx) {
        if capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    tx: QueueTx::Unbounded(tx),
                },
                InboundQueueRx::Unbounded(rx),
            )
        } else {
            let (tx, rx) = mpsc::channel(capacity);
            (
                Self {
                    tx: QueueTx::Bounded(tx),
                },
                InboundQueueRx::Bounded(rx),
            )
        }
    }

    /// Enqueues an event; the newest event is dropped (with a warning) when
    /// a bounded queue is saturated.
    pub fn push(&self, event: ChannelEvent) {
        match &self.tx {
            QueueTx::Bounded(tx) => {
                if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(event) {
                    if let ChannelEvent::Packet(packet) = dropped {
                        warn!(
                            remote = %packet.remote,
                            bytes = packet.payload.len(),
                            "inbound queue full; dropping newest message"
                        );
                    }
                }
            }
            QueueTx::Unbounded(tx) => {
                let _ = tx.send(event);
            }
        }
    }
}

impl InboundQueueRx {
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        match self {
            InboundQueueRx::Bounded(rx) => rx.recv().await,
            InboundQueueRx::Unbounded(rx) => rx.recv().await,
        }
    }
}
