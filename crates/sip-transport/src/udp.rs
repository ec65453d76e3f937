// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Connectionless UDP channel.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{Channel, ChannelEvent, InboundQueue, ReceivedPacket};
use crate::endpoint::SipEndpoint;
use crate::error::TransportError;
use crate::TransportKind;

/// A UDP channel: one socket, one receive task, no connection state.
pub struct UdpChannel {
    id: SmolStr,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    cancel: CancellationToken,
}

impl UdpChannel {
    /// Binds the socket and spawns the receive loop.
    pub async fn bind(
        addr: SocketAddr,
        queue: InboundQueue,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let id = SmolStr::new(format!("udp-{}", local));
        info!(%local, "listening (udp)");

        let channel = Arc::new(Self {
            id,
            socket: socket.clone(),
            local,
            cancel: cancel.clone(),
        });

        let recv_channel = channel.clone();
        tokio::spawn(async move {
            recv_channel.serve(queue).await;
        });
        Ok(channel)
    }

    async fn serve(&self, queue: InboundQueue) {
        let mut buf = vec![0u8; 65_535];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, peer)) => {
                            if n == buf.len() {
                                warn!(%peer, max = n, "udp datagram likely truncated");
                            }
                            let packet = ReceivedPacket {
                                local: self.listening_endpoint(),
                                remote: SipEndpoint::new(TransportKind::Udp, peer)
                                    .with_channel(self.id.clone()),
                                payload: Bytes::copy_from_slice(&buf[..n]),
                            };
                            queue.push(ChannelEvent::Packet(packet));
                        }
                        Err(e) => {
                            error!(%e, "udp recv_from error");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    fn id(&self) -> &SmolStr {
        &self.id
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn listening_endpoint(&self) -> SipEndpoint {
        SipEndpoint::new(TransportKind::Udp, self.local).with_channel(self.id.clone())
    }

    async fn send(
        &self,
        dst: SocketAddr,
        payload: Bytes,
        _can_initiate: bool,
        _connection_hint: Option<&SmolStr>,
    ) -> Result<(), TransportError> {
        self.socket.send_to(&payload, dst).await?;
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
