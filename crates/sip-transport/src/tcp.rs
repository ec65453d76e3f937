// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TCP channel: listener, per-connection framing sessions, and an outbound
//! connection pool keyed by remote endpoint.
//!
//! Sockets are opened with `SO_LINGER = 0` so closed sockets do not tie up
//! the port in TIME_WAIT. Note that on Linux (and WSL) a socket can still
//! linger in TIME_WAIT when another process held a duplicate of the fd;
//! that is an OS limitation this layer does not work around.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sip_parse::StreamScanner;
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelEvent, InboundQueue, ReceivedPacket};
use crate::endpoint::SipEndpoint;
use crate::error::TransportError;
use crate::TransportKind;

/// Timeout for outbound connection establishment, distinct from the
/// transaction retransmit schedule.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Close a session that stays silent this long.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct ConnectionHandle {
    writer: mpsc::Sender<Bytes>,
    peer: SocketAddr,
}

/// A TCP channel with a pool of established connections.
pub struct TcpChannel {
    id: SmolStr,
    local: SocketAddr,
    queue: InboundQueue,
    cancel: CancellationToken,
    connections: DashMap<SmolStr, ConnectionHandle>,
    by_peer: DashMap<SocketAddr, SmolStr>,
    /// Back-reference for session registration from `&self` contexts.
    self_ref: OnceCell<Weak<TcpChannel>>,
}

impl TcpChannel {
    /// Binds a listener and spawns the accept loop.
    pub async fn listen(
        addr: SocketAddr,
        queue: InboundQueue,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let listener = bind_listener(addr)?;
        let local = listener.local_addr()?;
        let id = SmolStr::new(format!("tcp-{}", local));
        info!(%local, "listening (tcp)");

        let channel = Arc::new(Self {
            id,
            local,
            queue,
            cancel: cancel.clone(),
            connections: DashMap::new(),
            by_peer: DashMap::new(),
            self_ref: OnceCell::new(),
        });
        let _ = channel.self_ref.set(Arc::downgrade(&channel));

        let accept_channel = channel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_channel.cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                set_linger_zero(&stream);
                                accept_channel.clone().register(stream, peer);
                            }
                            Err(e) => {
                                error!(%e, "tcp accept error");
                            }
                        }
                    }
                }
            }
        });
        Ok(channel)
    }

    fn register(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> SmolStr {
        let connection_id = SmolStr::new(format!("{}-{}", self.id, peer));
        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(32);

        self.connections.insert(
            connection_id.clone(),
            ConnectionHandle {
                writer: writer_tx,
                peer,
            },
        );
        self.by_peer.insert(peer, connection_id.clone());

        tokio::spawn(write_loop(writer, writer_rx));

        let session = self.clone();
        let session_id = connection_id.clone();
        tokio::spawn(async move {
            session.read_loop(reader, peer, session_id.clone()).await;
            session.evict(&session_id);
        });
        connection_id
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, peer: SocketAddr, conn_id: SmolStr) {
        let mut scanner = StreamScanner::new();
        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = tokio::time::timeout(SESSION_IDLE_TIMEOUT, reader.read(&mut chunk)) => read,
            };
            match read {
                Ok(Ok(0)) => {
                    debug!(%peer, "tcp connection closed by peer");
                    break;
                }
                Ok(Ok(n)) => match scanner.push(&chunk[..n]) {
                    Ok(frames) => {
                        for payload in frames {
                            let packet = ReceivedPacket {
                                local: self.listening_endpoint(),
                                remote: SipEndpoint::new(TransportKind::Tcp, peer)
                                    .with_channel(self.id.clone())
                                    .with_connection(conn_id.clone()),
                                payload,
                            };
                            self.queue.push(ChannelEvent::Packet(packet));
                        }
                    }
                    Err(e) => {
                        warn!(%peer, %e, "sip framing error, closing tcp connection");
                        break;
                    }
                },
                Ok(Err(e)) => {
                    error!(%peer, %e, "tcp read error");
                    break;
                }
                Err(_) => {
                    warn!(%peer, "tcp session idle timeout");
                    break;
                }
            }
        }
    }

    fn evict(&self, connection_id: &SmolStr) {
        if let Some((_, handle)) = self.connections.remove(connection_id) {
            self.by_peer.remove(&handle.peer);
        }
        self.queue.push(ChannelEvent::ConnectionClosed {
            channel_id: self.id.clone(),
            connection_id: connection_id.clone(),
        });
    }

    async fn write_to(&self, connection_id: &SmolStr, payload: Bytes) -> Result<(), TransportError> {
        let writer = self
            .connections
            .get(connection_id)
            .map(|h| h.writer.clone())
            .ok_or(TransportError::NotConnected)?;
        writer
            .send(payload)
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn connect(&self, dst: SocketAddr) -> Result<SmolStr, TransportError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(dst))
            .await
            .map_err(|_| TransportError::Timeout)??;
        set_linger_zero(&stream);
        debug!(peer = %dst, "tcp connection established");
        let this = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or(TransportError::Aborted)?;
        Ok(this.register(stream, dst))
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(buf) = rx.recv().await {
        if let Err(e) = writer.write_all(&buf).await {
            error!(%e, "tcp write error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

fn set_linger_zero(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_linger(Some(Duration::ZERO)) {
        warn!(%e, "failed to disable linger");
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn id(&self) -> &SmolStr {
        &self.id
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn listening_endpoint(&self) -> SipEndpoint {
        SipEndpoint::new(TransportKind::Tcp, self.local).with_channel(self.id.clone())
    }

    async fn send(
        &self,
        dst: SocketAddr,
        payload: Bytes,
        can_initiate: bool,
        connection_hint: Option<&SmolStr>,
    ) -> Result<(), TransportError> {
        if let Some(hint) = connection_hint {
            if self.connections.contains_key(hint) {
                return self.write_to(hint, payload).await;
            }
        }
        if let Some(conn_id) = self.by_peer.get(&dst).map(|id| id.clone()) {
            match self.write_to(&conn_id, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    // Stale entry; fall through to reconnect if permitted.
                    self.evict(&conn_id);
                }
            }
        }
        if !can_initiate {
            return Err(TransportError::NotConnected);
        }
        let conn_id = self.connect(dst).await?;
        self.write_to(&conn_id, payload).await
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.connections.clear();
        self.by_peer.clear();
    }
}
