// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! WebSocket channel (RFC 7118).
//!
//! The `sip` subprotocol is mandatory in both directions; peers that do not
//! offer it are rejected during the handshake. One SIP message travels per
//! complete WebSocket message; tungstenite reassembles fragmented frames
//! before we see them. Outbound SIP is sent as TEXT messages.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        self,
        handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse},
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelEvent, InboundQueue, ReceivedPacket};
use crate::endpoint::SipEndpoint;
use crate::error::TransportError;
use crate::tcp::CONNECT_TIMEOUT;
use crate::TransportKind;

struct ConnectionHandle {
    writer: mpsc::Sender<Bytes>,
    peer: SocketAddr,
}

/// A WebSocket channel, plain (`ws`) or TLS-terminated (`wss`).
pub struct WsChannel {
    id: SmolStr,
    local: SocketAddr,
    kind: TransportKind,
    #[cfg(feature = "tls")]
    tls: crate::tls::TlsSettings,
    queue: InboundQueue,
    cancel: CancellationToken,
    connections: DashMap<SmolStr, ConnectionHandle>,
    by_peer: DashMap<SocketAddr, SmolStr>,
    self_ref: OnceCell<Weak<WsChannel>>,
}

impl WsChannel {
    /// Binds a plain `ws://` listener and spawns the accept loop.
    pub async fn listen(
        addr: SocketAddr,
        queue: InboundQueue,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let id = SmolStr::new(format!("ws-{}", local));
        info!(%local, "listening (ws)");

        let channel = Arc::new(Self {
            id,
            local,
            kind: TransportKind::Ws,
            #[cfg(feature = "tls")]
            tls: crate::tls::TlsSettings::default(),
            queue,
            cancel,
            connections: DashMap::new(),
            by_peer: DashMap::new(),
            self_ref: OnceCell::new(),
        });
        let _ = channel.self_ref.set(Arc::downgrade(&channel));
        channel.spawn_accept(listener);
        Ok(channel)
    }

    /// Binds a `wss://` listener terminating TLS with the given settings.
    #[cfg(feature = "tls")]
    pub async fn listen_secure(
        addr: SocketAddr,
        tls: crate::tls::TlsSettings,
        queue: InboundQueue,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let id = SmolStr::new(format!("wss-{}", local));
        info!(%local, "listening (wss)");

        let channel = Arc::new(Self {
            id,
            local,
            kind: TransportKind::Wss,
            tls,
            queue,
            cancel,
            connections: DashMap::new(),
            by_peer: DashMap::new(),
            self_ref: OnceCell::new(),
        });
        let _ = channel.self_ref.set(Arc::downgrade(&channel));
        channel.spawn_accept(listener);
        Ok(channel)
    }

    fn spawn_accept(self: &Arc<Self>, listener: TcpListener) {
        let accept_channel = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_channel.cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!(%e, "ws accept error");
                                continue;
                            }
                        };
                        let session_channel = accept_channel.clone();
                        tokio::spawn(async move {
                            session_channel.accept_session(stream, peer).await;
                        });
                    }
                }
            }
        });
    }

    async fn accept_session(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        match self.kind {
            TransportKind::Ws => match ws_handshake(stream).await {
                Ok(ws_stream) => {
                    self.register(ws_stream, peer);
                }
                Err(e) => warn!(%peer, %e, "ws handshake failed"),
            },
            #[cfg(feature = "tls")]
            TransportKind::Wss => {
                let Some(server_config) = self.tls.server.clone() else {
                    warn!(%peer, "wss listener without server certificate");
                    return;
                };
                let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => match ws_handshake(tls_stream).await {
                        Ok(ws_stream) => {
                            self.register(ws_stream, peer);
                        }
                        Err(e) => warn!(%peer, %e, "wss handshake failed"),
                    },
                    Err(e) => warn!(%peer, %e, "wss tls accept failed"),
                }
            }
            _ => {}
        }
    }

    fn register<S>(self: Arc<Self>, ws_stream: WebSocketStream<S>, peer: SocketAddr) -> SmolStr
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = SmolStr::new(format!("{}-{}", self.id, peer));
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(64);

        self.connections.insert(
            connection_id.clone(),
            ConnectionHandle {
                writer: writer_tx,
                peer,
            },
        );
        self.by_peer.insert(peer, connection_id.clone());

        let session = self.clone();
        let session_id = connection_id.clone();
        tokio::spawn(async move {
            let (mut sink, mut stream) = ws_stream.split();
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    outbound = writer_rx.recv() => {
                        let Some(data) = outbound else { break };
                        // SIP over WebSocket goes out as a TEXT message.
                        let message = match String::from_utf8(data.to_vec()) {
                            Ok(text) => tungstenite::Message::Text(text),
                            Err(_) => tungstenite::Message::Binary(data.to_vec()),
                        };
                        if let Err(e) = sink.send(message).await {
                            warn!(%peer, %e, "websocket send error");
                            break;
                        }
                    }
                    inbound = stream.next() => {
                        match inbound {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                session.deliver(peer, &session_id, Bytes::from(text.into_bytes()));
                            }
                            Some(Ok(tungstenite::Message::Binary(data))) => {
                                session.deliver(peer, &session_id, Bytes::from(data));
                            }
                            Some(Ok(tungstenite::Message::Ping(payload))) => {
                                if sink.send(tungstenite::Message::Pong(payload)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(tungstenite::Message::Pong(_))) => {}
                            Some(Ok(tungstenite::Message::Close(_))) => break,
                            Some(Ok(tungstenite::Message::Frame(_))) => {}
                            Some(Err(e)) => {
                                warn!(%peer, %e, "websocket read error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            session.evict(&session_id);
        });
        connection_id
    }

    fn deliver(&self, peer: SocketAddr, connection_id: &SmolStr, payload: Bytes) {
        let packet = ReceivedPacket {
            local: self.listening_endpoint(),
            remote: SipEndpoint::new(self.kind, peer)
                .with_channel(self.id.clone())
                .with_connection(connection_id.clone()),
            payload,
        };
        self.queue.push(ChannelEvent::Packet(packet));
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
        use tungstenite::client::IntoClientRequest;
        use tungstenite::http::header::HeaderValue;

        let url = format!("{}://{}/", self.kind.as_str(), dst);
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));

        let connect = async {
            #[cfg(feature = "tls")]
            {
                let connector = self
                    .tls
                    .client
                    .clone()
                    .map(tokio_tungstenite::Connector::Rustls);
                tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                    .await
            }
            #[cfg(not(feature = "tls"))]
            {
                tokio_tungstenite::connect_async(request).await
            }
        };
        let (ws_stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(|p| p.eq_ignore_ascii_case("sip"))
            .unwrap_or(false);
        if !negotiated {
            return Err(TransportError::Io(
                "server did not negotiate Sec-WebSocket-Protocol: sip".to_owned(),
            ));
        }
        debug!(peer = %dst, "websocket connection established");

        let this = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or(TransportError::Aborted)?;
        Ok(this.register(ws_stream, dst))
    }
}

/// Accepts a WebSocket handshake, enforcing the RFC 7118 `sip` subprotocol.
async fn ws_handshake<S>(stream: S) -> tungstenite::Result<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    accept_hdr_async(stream, |req: &WsRequest, mut resp: WsResponse| {
        let offered_sip = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
            .map(|protocols| {
                protocols
                    .split(',')
                    .any(|p| p.trim().eq_ignore_ascii_case("sip"))
            })
            .unwrap_or(false);
        if !offered_sip {
            let mut error = ErrorResponse::new(Some(
                "Missing Sec-WebSocket-Protocol: sip".to_owned(),
            ));
            *error.status_mut() = tungstenite::http::StatusCode::BAD_REQUEST;
            return Err(error);
        }
        if let Ok(value) = "sip".parse() {
            resp.headers_mut().append("Sec-WebSocket-Protocol", value);
        }
        Ok(resp)
    })
    .await
}

#[async_trait]
impl Channel for WsChannel {
    fn id(&self) -> &SmolStr {
        &self.id
    }

    fn protocol(&self) -> TransportKind {
        self.kind
    }

    fn listening_endpoint(&self) -> SipEndpoint {
        SipEndpoint::new(self.kind, self.local).with_channel(self.id.clone())
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
                Err(_) => self.evict(&conn_id),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_handshake_without_sip_subprotocol() {
        let (queue, _rx) = InboundQueue::new(8);
        let channel = WsChannel::listen(
            "127.0.0.1:0".parse().unwrap(),
            queue,
            CancellationToken::new(),
        )
        .await
        .expect("listen");
        let addr = channel.listening_endpoint().addr;

        let url = format!("ws://{}/", addr);
        let result = tokio_tungstenite::connect_async(url).await;
        assert!(result.is_err(), "handshake without subprotocol must fail");
    }

    #[tokio::test]
    async fn round_trips_text_messages() {
        use tungstenite::client::IntoClientRequest;
        use tungstenite::http::header::HeaderValue;

        let (queue, mut rx) = InboundQueue::new(8);
        let channel = WsChannel::listen(
            "127.0.0.1:0".parse().unwrap(),
            queue,
            CancellationToken::new(),
        )
        .await
        .expect("listen");
        let addr = channel.listening_endpoint().addr;

        let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));
        let (mut client, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        client
            .send(tungstenite::Message::Text(
                "OPTIONS sip:a SIP/2.0\r\nContent-Length: 0\r\n\r\n".to_owned(),
            ))
            .await
            .unwrap();

        let event = rx.recv().await.expect("packet");
        let ChannelEvent::Packet(packet) = event else {
            panic!("expected packet");
        };
        assert!(packet.payload.starts_with(b"OPTIONS"));
        assert_eq!(packet.remote.protocol, TransportKind::Ws);

        // Reply through the channel and observe it client-side as TEXT.
        channel
            .send(
                packet.remote.addr,
                Bytes::from_static(b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n"),
                false,
                packet.remote.connection_id.as_ref(),
            )
            .await
            .expect("send");

        let reply = client.next().await.expect("reply").expect("frame");
        match reply {
            tungstenite::Message::Text(text) => assert!(text.starts_with("SIP/2.0 200")),
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}
