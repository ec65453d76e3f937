// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transport hub.
//!
//! Owns the channel set, the transaction engine, the bounded inbound queue,
//! and the outbound header rewriter. Inbound bytes are classified (STUN vs
//! SIP vs junk), parsed, route-preprocessed, offered to the transaction
//! engine, and only then surfaced to the application handler. Outbound
//! messages pick the best-fitting channel, get their placeholder headers
//! rewritten, and are recorded by the engine for reliable retransmission.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sip_core::{
    Header, Method, NameAddr, Request, Response, SipMessage, SipUri, TextEncoding,
};
use sip_parse::{
    is_keepalive, looks_like_sip, parse_message_with, serialize_request_with,
    serialize_response_with,
};
use sip_transaction::{
    EngineConfig, EngineError, RequestDisposition, ServerTransactionHandle, TransactionEngine,
    TransactionId, TransactionUser, TransportContext,
};
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, InboundQueue, InboundQueueRx, ReceivedPacket};
use crate::endpoint::{default_outbound, is_local_host, preferred_source, SipEndpoint};
use crate::error::TransportError;
use crate::resolver::{IpLiteralResolver, ResolveOutcome, Resolver};
use crate::rewrite::{rewrite_outbound, HeaderHook};
use crate::route::{preprocess_request, RoutePreprocess};
use crate::tcp::TcpChannel;
use crate::udp::UdpChannel;
use crate::TransportKind;

/// Transport configuration (see the individual fields; every knob has a
/// deployable default).
#[derive(Clone)]
pub struct TransportConfig {
    /// Prefer AAAA results when resolving names.
    pub prefer_ipv6_name_resolution: bool,
    /// Allow on-demand client channel creation when no channel matches the
    /// destination's protocol/family.
    pub can_create_missing_channels: bool,
    /// Bounded inbound queue capacity; 0 means unlimited.
    pub max_in_message_queue: usize,
    /// Overrides the Contact URI host on outbound messages.
    pub contact_host: Option<SmolStr>,
    /// Run retransmit timers but keep retransmissions off the wire.
    pub disable_retransmit_sending: bool,
    /// Soft cap on concurrently tracked transactions.
    pub max_pending_transactions: usize,
    /// Inbound messages above this many bytes are answered with 413.
    pub max_receive_length: usize,
    pub header_encoding: TextEncoding,
    pub body_encoding: TextEncoding,
    /// `false` runs dispatch concurrently per message instead of through
    /// the serializing worker (for stateless cores that must not block on a
    /// slow handler).
    pub queue_incoming: bool,
    /// Extra host names that count as "this stack" for Route processing.
    pub local_domains: Vec<SmolStr>,
    /// Require-header extensions this stack understands.
    pub supported_extensions: Vec<SmolStr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefer_ipv6_name_resolution: false,
            can_create_missing_channels: true,
            max_in_message_queue: 2_000,
            contact_host: None,
            disable_retransmit_sending: false,
            max_pending_transactions: 5_000,
            max_receive_length: 16 * 1024,
            header_encoding: TextEncoding::Utf8,
            body_encoding: TextEncoding::Utf8,
            queue_incoming: true,
            local_domains: Vec::new(),
            supported_extensions: vec![SmolStr::new("100rel")],
        }
    }
}

/// Result of a send call that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// A DNS lookup was started; the retransmit schedule will re-drive the
    /// send against a warm cache.
    InProgress,
}

/// A parsed request surfaced to the application.
pub struct IncomingRequest {
    pub local: SipEndpoint,
    pub remote: SipEndpoint,
    pub request: Request,
    /// Route entry addressed to this stack, consumed during preprocessing.
    pub received_route: Vec<NameAddr>,
    /// `None` for ACKs that belong to the dialog layer.
    pub transaction: Option<ServerTransactionHandle>,
}

/// Application surface: one handler for unmatched requests and responses.
#[async_trait]
pub trait SipHandler: Send + Sync + 'static {
    async fn on_request(&self, incoming: IncomingRequest);
    async fn on_response(&self, local: SipEndpoint, remote: SipEndpoint, response: Response);
}

/// Hook invoked for STUN traffic sharing the SIP sockets.
pub type StunHook = Arc<dyn Fn(SipEndpoint, SipEndpoint, Bytes) + Send + Sync>;

/// Wire-level trace events for diagnostics.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    RequestIn { remote: SipEndpoint, method: Method },
    RequestOut { dst: SocketAddr, method: Method },
    ResponseIn { remote: SipEndpoint, status: u16 },
    ResponseOut { dst: SocketAddr, status: u16 },
    BadRequest { remote: SipEndpoint, reason: SmolStr },
    BadResponse { remote: SipEndpoint, reason: SmolStr },
    RequestRetransmit { dst: SocketAddr },
    ResponseRetransmit { dst: SocketAddr },
}

pub type TraceListener = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

struct Core {
    config: TransportConfig,
    channels: DashMap<SmolStr, Arc<dyn Channel>>,
    queue: InboundQueue,
    handler: RwLock<Option<Arc<dyn SipHandler>>>,
    stun_hook: RwLock<Option<StunHook>>,
    request_header_hook: RwLock<Option<HeaderHook>>,
    response_header_hook: RwLock<Option<HeaderHook>>,
    trace: RwLock<Vec<TraceListener>>,
    resolver: RwLock<Arc<dyn Resolver>>,
    cancel: CancellationToken,
}

impl Core {
    fn emit(&self, event: TraceEvent) {
        let listeners = self.trace.read().expect("trace lock").clone();
        for listener in listeners {
            listener(&event);
        }
    }

    fn resolver(&self) -> Arc<dyn Resolver> {
        self.resolver.read().expect("resolver lock").clone()
    }

    /// Outbound channel selection, steps 2-7: hint, wildcard bind, exact
    /// bind, OS-preferred source, default outbound address, any match.
    fn select_channel(
        &self,
        protocol: TransportKind,
        dst: &SocketAddr,
        hint: Option<&SmolStr>,
    ) -> Option<Arc<dyn Channel>> {
        if let Some(hint) = hint {
            if let Some(channel) = self.channels.get(hint) {
                if channel.supports_protocol(protocol) {
                    return Some(channel.value().clone());
                }
            }
        }

        let candidates: Vec<Arc<dyn Channel>> = self
            .channels
            .iter()
            .filter(|c| {
                c.supports_protocol(protocol) && c.supports_ipv6() == dst.is_ipv6()
            })
            .map(|c| c.value().clone())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // A wildcard bind can route via any interface, maximizing the odds
        // the peer can route back to the Via we stamp.
        if let Some(channel) = candidates
            .iter()
            .find(|c| c.listening_endpoint().addr.ip().is_unspecified())
        {
            return Some(channel.clone());
        }
        if let Some(channel) = candidates
            .iter()
            .find(|c| c.listening_endpoint().addr.ip() == dst.ip())
        {
            return Some(channel.clone());
        }
        if let Some(source) = preferred_source(dst.ip()) {
            if let Some(channel) = candidates
                .iter()
                .find(|c| c.listening_endpoint().addr.ip() == source)
            {
                return Some(channel.clone());
            }
        }
        if let Some(default) = default_outbound(dst.is_ipv6()) {
            if let Some(channel) = candidates
                .iter()
                .find(|c| c.listening_endpoint().addr.ip() == default)
            {
                return Some(channel.clone());
            }
        }
        candidates.into_iter().next()
    }

    /// `true` when the URI names one of this stack's endpoints. Wildcard
    /// binds match any machine-local address.
    fn uri_is_ours(&self, uri: &SipUri) -> bool {
        if self
            .config
            .local_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&uri.host))
        {
            return true;
        }
        let channel_ips: Vec<std::net::IpAddr> = self
            .channels
            .iter()
            .flat_map(|c| {
                c.listening_endpoints()
                    .into_iter()
                    .map(|ep| ep.addr.ip())
                    .collect::<Vec<_>>()
            })
            .collect();
        is_local_host(&uri.host, &channel_ips)
    }

    async fn send_via_channel(
        &self,
        protocol: TransportKind,
        dst: &SipEndpoint,
        payload: Bytes,
        can_initiate: bool,
    ) -> Result<(), TransportError> {
        let channel = self
            .select_channel(protocol, &dst.addr, dst.channel_id.as_ref())
            .ok_or(TransportError::NoMatchingChannel)?;
        channel
            .send(dst.addr, payload, can_initiate, dst.connection_id.as_ref())
            .await
    }
}

/// Dispatcher the transaction engine uses to reach the wire.
struct CoreDispatcher {
    core: Arc<Core>,
}

#[async_trait]
impl sip_transaction::TransportDispatcher for CoreDispatcher {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        let protocol = kind_from_transport(ctx.transport);
        let mut dst = SipEndpoint::new(protocol, ctx.peer);
        dst.channel_id = ctx.channel_id.clone();
        dst.connection_id = ctx.connection_id.clone();
        self.core
            .send_via_channel(protocol, &dst, payload, true)
            .await
            .map_err(|e| anyhow!("dispatch failed: {e}"))
    }

    async fn dispatch_retransmit(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        let event = if payload.starts_with(b"SIP/2.0") {
            TraceEvent::ResponseRetransmit { dst: ctx.peer }
        } else {
            TraceEvent::RequestRetransmit { dst: ctx.peer }
        };
        self.core.emit(event);
        self.dispatch(ctx, payload).await
    }
}

fn kind_from_transport(transport: sip_transaction::Transport) -> TransportKind {
    match transport {
        sip_transaction::Transport::Udp => TransportKind::Udp,
        sip_transaction::Transport::Tcp => TransportKind::Tcp,
        sip_transaction::Transport::Tls => TransportKind::Tls,
        sip_transaction::Transport::Ws => TransportKind::Ws,
        sip_transaction::Transport::Wss => TransportKind::Wss,
    }
}

/// The transport hub. Cheap to clone; all clones share the channel set and
/// engine.
#[derive(Clone)]
pub struct SipTransport {
    core: Arc<Core>,
    engine: TransactionEngine,
}

impl SipTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (queue, queue_rx) = InboundQueue::new(config.max_in_message_queue);
        let core = Arc::new(Core {
            config: config.clone(),
            channels: DashMap::new(),
            queue,
            handler: RwLock::new(None),
            stun_hook: RwLock::new(None),
            request_header_hook: RwLock::new(None),
            response_header_hook: RwLock::new(None),
            trace: RwLock::new(Vec::new()),
            resolver: RwLock::new(Arc::new(IpLiteralResolver)),
            cancel: CancellationToken::new(),
        });
        let engine = TransactionEngine::with_config(
            Arc::new(CoreDispatcher { core: core.clone() }),
            EngineConfig {
                max_pending_transactions: config.max_pending_transactions,
                disable_retransmit_sending: config.disable_retransmit_sending,
                ..EngineConfig::default()
            },
        );
        let transport = Self { core, engine };
        transport.spawn_worker(queue_rx);
        transport
    }

    /// The transaction engine driving this transport.
    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    pub fn set_handler(&self, handler: Arc<dyn SipHandler>) {
        *self.core.handler.write().expect("handler lock") = Some(handler);
    }

    /// Installs the hook invoked with raw STUN traffic arriving on SIP
    /// sockets.
    pub fn set_stun_hook(&self, hook: StunHook) {
        *self.core.stun_hook.write().expect("stun lock") = Some(hook);
    }

    pub fn set_request_header_hook(&self, hook: HeaderHook) {
        *self.core.request_header_hook.write().expect("hook lock") = Some(hook);
    }

    pub fn set_response_header_hook(&self, hook: HeaderHook) {
        *self.core.response_header_hook.write().expect("hook lock") = Some(hook);
    }

    pub fn add_trace_listener(&self, listener: TraceListener) {
        self.core.trace.write().expect("trace lock").push(listener);
    }

    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *self.core.resolver.write().expect("resolver lock") = resolver;
    }

    /// Binds a UDP channel and registers it with the hub.
    pub async fn add_udp_channel(&self, addr: SocketAddr) -> Result<SipEndpoint> {
        let channel = UdpChannel::bind(
            addr,
            self.core.queue.clone(),
            self.core.cancel.child_token(),
        )
        .await?;
        let endpoint = channel.listening_endpoint();
        self.core.channels.insert(channel.id().clone(), channel);
        Ok(endpoint)
    }

    /// Binds a TCP listener channel and registers it with the hub.
    pub async fn add_tcp_channel(&self, addr: SocketAddr) -> Result<SipEndpoint> {
        let channel = TcpChannel::listen(
            addr,
            self.core.queue.clone(),
            self.core.cancel.child_token(),
        )
        .await?;
        let endpoint = channel.listening_endpoint();
        self.core.channels.insert(channel.id().clone(), channel);
        Ok(endpoint)
    }

    /// Binds a TLS listener channel with the given certificate material.
    #[cfg(feature = "tls")]
    pub async fn add_tls_channel(
        &self,
        addr: SocketAddr,
        settings: crate::tls::TlsSettings,
    ) -> Result<SipEndpoint> {
        let channel = crate::tls::TlsChannel::listen(
            addr,
            settings,
            self.core.queue.clone(),
            self.core.cancel.child_token(),
        )
        .await?;
        let endpoint = channel.listening_endpoint();
        self.core.channels.insert(channel.id().clone(), channel);
        Ok(endpoint)
    }

    /// Binds a plain WebSocket listener channel.
    #[cfg(feature = "ws")]
    pub async fn add_ws_channel(&self, addr: SocketAddr) -> Result<SipEndpoint> {
        let channel = crate::ws::WsChannel::listen(
            addr,
            self.core.queue.clone(),
            self.core.cancel.child_token(),
        )
        .await?;
        let endpoint = channel.listening_endpoint();
        self.core.channels.insert(channel.id().clone(), channel);
        Ok(endpoint)
    }

    /// Binds a secure WebSocket listener channel.
    #[cfg(all(feature = "ws", feature = "tls"))]
    pub async fn add_wss_channel(
        &self,
        addr: SocketAddr,
        settings: crate::tls::TlsSettings,
    ) -> Result<SipEndpoint> {
        let channel = crate::ws::WsChannel::listen_secure(
            addr,
            settings,
            self.core.queue.clone(),
            self.core.cancel.child_token(),
        )
        .await?;
        let endpoint = channel.listening_endpoint();
        self.core.channels.insert(channel.id().clone(), channel);
        Ok(endpoint)
    }

    /// The listening endpoints of every registered channel.
    pub fn local_endpoints(&self) -> Vec<SipEndpoint> {
        self.core
            .channels
            .iter()
            .map(|c| c.listening_endpoint())
            .collect()
    }

    /// Resolves the destination for a request: an explicit endpoint wins,
    /// otherwise the top loose Route, otherwise the Request-URI.
    async fn resolve_destination(
        &self,
        request: &Request,
        dst: Option<SipEndpoint>,
        wait_for_dns: bool,
    ) -> Result<Option<SipEndpoint>, TransportError> {
        if let Some(dst) = dst {
            return Ok(Some(dst));
        }
        let uri = request
            .header
            .routes
            .first()
            .filter(|r| r.is_loose_router())
            .map(|r| r.uri.clone())
            .unwrap_or_else(|| request.uri.clone());

        let resolver = self.core.resolver();
        let prefer_v6 = self.core.config.prefer_ipv6_name_resolution;
        match resolver.resolve_from_cache(&uri, prefer_v6) {
            Some(ResolveOutcome::Resolved(ep)) => Ok(Some(ep)),
            Some(ResolveOutcome::Empty) => Err(TransportError::HostNotFound),
            None if wait_for_dns => {
                let cancel = self.core.cancel.child_token();
                match resolver.resolve(&uri, prefer_v6, cancel).await {
                    ResolveOutcome::Resolved(ep) => Ok(Some(ep)),
                    ResolveOutcome::Empty => Err(TransportError::HostNotFound),
                }
            }
            None => {
                // Happy path: warm the cache in the background; the
                // retransmit schedule re-drives the send.
                let cancel = self.core.cancel.child_token();
                tokio::spawn(async move {
                    let _ = resolver.resolve(&uri, prefer_v6, cancel).await;
                });
                Ok(None)
            }
        }
    }

    /// Applies the customize hook and the default placeholder rewrite.
    fn rewrite_for_send(
        &self,
        header: &mut Header,
        local: SocketAddr,
        remote: &SipEndpoint,
        protocol: TransportKind,
        is_request: bool,
    ) {
        let hook = if is_request {
            self.core.request_header_hook.read().expect("hook lock").clone()
        } else {
            self.core.response_header_hook.read().expect("hook lock").clone()
        };
        if let Some(hook) = hook {
            let local_ep = SipEndpoint::new(protocol, local);
            if let Some(replacement) = hook(&local_ep, remote, header) {
                *header = replacement;
            }
        }
        rewrite_outbound(
            header,
            local,
            protocol,
            self.core.config.contact_host.as_deref(),
        );
    }

    /// Concrete local address a channel will use toward `dst` (wildcard
    /// binds resolve through the OS routing table).
    fn concrete_local(&self, channel: &Arc<dyn Channel>, dst: &SocketAddr) -> SocketAddr {
        let bound = channel.listening_endpoint().addr;
        if !bound.ip().is_unspecified() {
            return bound;
        }
        let ip = preferred_source(dst.ip())
            .or_else(|| default_outbound(dst.is_ipv6()))
            .unwrap_or_else(|| bound.ip());
        SocketAddr::new(ip, bound.port())
    }

    /// Sends a request statelessly (no transaction). Placeholder headers
    /// are rewritten against the selected channel; a `wait_for_dns` of
    /// `false` returns [`SendStatus::InProgress`] on a cache miss.
    pub async fn send_request(
        &self,
        mut request: Request,
        dst: Option<SipEndpoint>,
        wait_for_dns: bool,
    ) -> Result<SendStatus, TransportError> {
        let Some(dst) = self.resolve_destination(&request, dst, wait_for_dns).await? else {
            return Ok(SendStatus::InProgress);
        };
        if dst.is_blackhole() {
            debug!(%dst, "blackhole destination; send succeeds silently");
            return Ok(SendStatus::Sent);
        }
        let protocol = dst.protocol;
        let channel = match self.channel_for(protocol, &dst).await? {
            Some(channel) => channel,
            None => return Err(TransportError::NoMatchingChannel),
        };
        let local = self.concrete_local(&channel, &dst.addr);
        self.rewrite_for_send(&mut request.header, local, &dst, protocol, true);

        let payload =
            serialize_request_with(&request, self.core.config.header_encoding);
        self.core.emit(TraceEvent::RequestOut {
            dst: dst.addr,
            method: request.method.clone(),
        });
        channel
            .send(dst.addr, payload, true, dst.connection_id.as_ref())
            .await?;
        Ok(SendStatus::Sent)
    }

    /// Sends a request inside a new client transaction. The engine owns
    /// retransmission; responses arrive on the supplied `tu`.
    pub async fn send_request_transaction(
        &self,
        mut request: Request,
        dst: Option<SipEndpoint>,
        wait_for_dns: bool,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<TransactionId> {
        let dst = self
            .resolve_destination(&request, dst, wait_for_dns)
            .await
            .map_err(|e| anyhow!("resolve failed: {e}"))?
            .ok_or_else(|| anyhow!("{}", TransportError::InProgress))?;
        let protocol = dst.protocol;
        let channel = self
            .channel_for(protocol, &dst)
            .await
            .map_err(|e| anyhow!("{e}"))?
            .ok_or_else(|| anyhow!("{}", TransportError::NoMatchingChannel))?;
        let local = self.concrete_local(&channel, &dst.addr);
        self.rewrite_for_send(&mut request.header, local, &dst, protocol, true);

        self.core.emit(TraceEvent::RequestOut {
            dst: dst.addr,
            method: request.method.clone(),
        });
        let mut ctx = TransportContext::new(protocol.into(), dst.addr).with_local(local);
        ctx.channel_id = Some(channel.id().clone());
        ctx.connection_id = dst.connection_id.clone();
        self.engine
            .start_client(request, ctx, tu)
            .await
            .map_err(|e| anyhow!("{e}"))
    }

    /// Sends a response, routed by the top Via (`received`/`rport` aware).
    pub async fn send_response(
        &self,
        mut response: Response,
        remote: Option<SipEndpoint>,
    ) -> Result<SendStatus, TransportError> {
        let dst = match remote {
            Some(ep) => ep,
            None => {
                let via = response
                    .header
                    .top_via()
                    .ok_or(TransportError::NoMatchingChannel)?;
                let protocol =
                    TransportKind::parse(&via.transport).unwrap_or(TransportKind::Udp);
                let (host, port) = via.response_target();
                let ip = host
                    .parse()
                    .map_err(|_| TransportError::HostNotFound)?;
                SipEndpoint::new(protocol, SocketAddr::new(ip, port))
            }
        };
        if dst.is_blackhole() {
            return Ok(SendStatus::Sent);
        }
        let protocol = dst.protocol;
        let channel = self
            .core
            .select_channel(protocol, &dst.addr, dst.channel_id.as_ref())
            .ok_or(TransportError::NoMatchingChannel)?;
        let local = self.concrete_local(&channel, &dst.addr);
        self.rewrite_for_send(&mut response.header, local, &dst, protocol, false);

        let payload =
            serialize_response_with(&response, self.core.config.header_encoding);
        self.core.emit(TraceEvent::ResponseOut {
            dst: dst.addr,
            status: response.status,
        });
        // Responses never open connections (RFC 3261 §18.2.2).
        channel
            .send(dst.addr, payload, false, dst.connection_id.as_ref())
            .await?;
        Ok(SendStatus::Sent)
    }

    async fn channel_for(
        &self,
        protocol: TransportKind,
        dst: &SipEndpoint,
    ) -> Result<Option<Arc<dyn Channel>>, TransportError> {
        if let Some(channel) =
            self.core
                .select_channel(protocol, &dst.addr, dst.channel_id.as_ref())
        {
            return Ok(Some(channel));
        }
        if !self.core.config.can_create_missing_channels {
            return Ok(None);
        }
        // Client-side channel created on demand for the missing
        // protocol/family combination.
        let bind: SocketAddr = if dst.addr.is_ipv6() {
            "[::]:0".parse().expect("literal")
        } else {
            "0.0.0.0:0".parse().expect("literal")
        };
        let created: Option<Arc<dyn Channel>> = match protocol {
            TransportKind::Udp => {
                let channel = UdpChannel::bind(
                    bind,
                    self.core.queue.clone(),
                    self.core.cancel.child_token(),
                )
                .await?;
                Some(channel as Arc<dyn Channel>)
            }
            TransportKind::Tcp => {
                let channel = TcpChannel::listen(
                    bind,
                    self.core.queue.clone(),
                    self.core.cancel.child_token(),
                )
                .await?;
                Some(channel as Arc<dyn Channel>)
            }
            // TLS/WS need certificate material or URL context; they cannot
            // be conjured on demand.
            _ => None,
        };
        match created {
            Some(channel) => {
                info!(channel = %channel.id(), "created missing channel on demand");
                self.core
                    .channels
                    .insert(channel.id().clone(), channel.clone());
                Ok(Some(channel))
            }
            None => Ok(None),
        }
    }

    fn spawn_worker(&self, mut rx: InboundQueueRx) {
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = transport.core.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if transport.core.config.queue_incoming {
                    // Serialized dispatch: per-peer ordering, and a fault in
                    // one message never stops the worker.
                    transport.handle_event(event).await;
                } else {
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        transport.handle_event(event).await;
                    });
                }
            }
            debug!("inbound worker stopped");
        });
    }

    async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Packet(packet) => self.handle_packet(packet).await,
            ChannelEvent::ConnectionClosed {
                channel_id,
                connection_id,
            } => {
                debug!(%channel_id, %connection_id, "connection closed");
            }
        }
    }

    /// The receive pipeline: classify, decode, parse, preprocess, match.
    async fn handle_packet(&self, packet: ReceivedPacket) {
        let ReceivedPacket {
            local,
            remote,
            payload,
        } = packet;

        // 1. STUN demux: never let multiplexed traffic near the SIP parser.
        if sip_stun::is_stun(&payload) {
            let hook = self.core.stun_hook.read().expect("stun lock").clone();
            if let Some(hook) = hook {
                hook(local, remote, payload);
            } else {
                debug!(%remote, "stun packet dropped (no hook installed)");
            }
            return;
        }

        // 2. Size gate.
        if payload.len() > self.core.config.max_receive_length {
            warn!(%remote, bytes = payload.len(), "oversized message");
            self.reject_raw(&local, &remote, &payload, 413, "Message Too Large")
                .await;
            return;
        }

        // 3. Keep-alive pings are dropped silently.
        if payload.is_empty() || is_keepalive(&payload) {
            return;
        }

        // 4. Cheap junk filter before parsing.
        if !looks_like_sip(&payload) {
            self.core.emit(TraceEvent::BadRequest {
                remote: remote.clone(),
                reason: SmolStr::new("payload does not look like SIP"),
            });
            return;
        }

        // 5. Parse; a request that fails validation earns the mapped 4xx.
        let message = match parse_message_with(&payload, self.core.config.header_encoding) {
            Ok(message) => message,
            Err(err) => {
                let is_response = payload.starts_with(b"SIP/2.0");
                if is_response {
                    self.core.emit(TraceEvent::BadResponse {
                        remote: remote.clone(),
                        reason: SmolStr::new(err.to_string()),
                    });
                } else {
                    self.core.emit(TraceEvent::BadRequest {
                        remote: remote.clone(),
                        reason: SmolStr::new(err.to_string()),
                    });
                    let reason = default_reason(err.status);
                    self.reject_raw(&local, &remote, &payload, err.status, reason)
                        .await;
                }
                return;
            }
        };

        // 6. Dispatch. A fault in one message must not stop the worker;
        //    everything below returns instead of propagating.
        match message {
            SipMessage::Request(request) => {
                self.dispatch_request(local, remote, request).await;
            }
            SipMessage::Response(response) => {
                self.core.emit(TraceEvent::ResponseIn {
                    remote: remote.clone(),
                    status: response.status,
                });
                if !self.engine.receive_response(response.clone()).await {
                    let handler = self.core.handler.read().expect("handler lock").clone();
                    if let Some(handler) = handler {
                        handler.on_response(local, remote, response).await;
                    }
                }
            }
        }
    }

    async fn dispatch_request(
        &self,
        local: SipEndpoint,
        remote: SipEndpoint,
        mut request: Request,
    ) {
        self.core.emit(TraceEvent::RequestIn {
            remote: remote.clone(),
            method: request.method.clone(),
        });

        // Policy gates: hop count and Require extensions.
        if request.header.max_forwards == Some(0)
            && request.method != Method::Options
            && request.method != Method::Ack
        {
            self.respond_policy(&remote, &request, 483, "Too Many Hops", Vec::new())
                .await;
            return;
        }
        let unsupported: Vec<SmolStr> = request
            .header
            .require
            .iter()
            .filter(|token| {
                !self
                    .core
                    .config
                    .supported_extensions
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(token))
            })
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            self.respond_policy(&remote, &request, 420, "Bad Extension", unsupported)
                .await;
            return;
        }

        // Route preprocessing (strict router fixups, own-route consumption).
        let core = self.core.clone();
        let RoutePreprocess { received_route } =
            preprocess_request(&mut request, |uri| core.uri_is_ours(uri));

        let ctx = {
            let mut ctx =
                TransportContext::new(remote.protocol.into(), remote.addr)
                    .with_local(local.addr);
            ctx.channel_id = remote.channel_id.clone().or(local.channel_id.clone());
            ctx.connection_id = remote.connection_id.clone();
            ctx
        };
        match self.engine.receive_request(request.clone(), ctx).await {
            Ok(RequestDisposition::New(handle)) => {
                let handler = self.core.handler.read().expect("handler lock").clone();
                if let Some(handler) = handler {
                    handler
                        .on_request(IncomingRequest {
                            local,
                            remote,
                            request,
                            received_route,
                            transaction: Some(handle),
                        })
                        .await;
                }
            }
            Ok(RequestDisposition::StrayAck) => {
                let handler = self.core.handler.read().expect("handler lock").clone();
                if let Some(handler) = handler {
                    handler
                        .on_request(IncomingRequest {
                            local,
                            remote,
                            request,
                            received_route,
                            transaction: None,
                        })
                        .await;
                }
            }
            Ok(RequestDisposition::Consumed) => {}
            Err(EngineError::TooManyTransactions { limit }) => {
                warn!(limit, "transaction table full; rejecting request");
                self.respond_policy(&remote, &request, 503, "Service Unavailable", Vec::new())
                    .await;
            }
            Err(e) => {
                warn!(%e, "engine rejected request");
            }
        }
    }

    /// Sends a policy rejection outside any transaction.
    async fn respond_policy(
        &self,
        remote: &SipEndpoint,
        request: &Request,
        status: u16,
        reason: &str,
        unsupported: Vec<SmolStr>,
    ) {
        let mut response = Response::for_request(status, reason, request);
        response.header.unsupported = unsupported;
        let dst = remote.clone();
        if let Err(e) = self.send_response(response, Some(dst)).await {
            warn!(%e, %remote, "failed to send policy rejection");
        }
    }

    /// Best-effort error response for a message that failed to parse: the
    /// response envelope is recovered verbatim from the raw header lines.
    async fn reject_raw(
        &self,
        local: &SipEndpoint,
        remote: &SipEndpoint,
        raw: &[u8],
        status: u16,
        reason: &str,
    ) {
        let Some(payload) = error_response_from_raw(raw, status, reason) else {
            return;
        };
        let channel_id = local.channel_id.clone().or(remote.channel_id.clone());
        let channel = self
            .core
            .select_channel(remote.protocol, &remote.addr, channel_id.as_ref());
        if let Some(channel) = channel {
            if let Err(e) = channel
                .send(remote.addr, payload, false, remote.connection_id.as_ref())
                .await
            {
                debug!(%e, %remote, "failed to send error response");
            }
        }
    }

    /// Cancels every task, closes channels, and clears the engine. Receive
    /// loops, the worker, timers, and in-flight DNS observe the token.
    pub async fn shutdown(&self) {
        info!("transport shutting down");
        self.core.cancel.cancel();
        let channels: Vec<Arc<dyn Channel>> = self
            .core
            .channels
            .iter()
            .map(|c| c.value().clone())
            .collect();
        for channel in channels {
            channel.close().await;
        }
        self.core.channels.clear();
        self.engine.shutdown();
    }
}

/// Recovers a minimal response envelope (Via/From/To/Call-ID/CSeq copied
/// verbatim) from raw bytes that failed full parsing.
fn error_response_from_raw(raw: &[u8], status: u16, reason: &str) -> Option<Bytes> {
    let head_end = memchr::memmem::find(raw, b"\r\n\r\n").unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..head_end]);
    let mut lines = head.lines();
    let start_line = lines.next()?;
    if start_line.starts_with("SIP/2.0") {
        return None;
    }

    let mut out = format!("SIP/2.0 {} {}\r\n", status, reason);
    let mut copied = false;
    for line in lines {
        let Some((name, _)) = line.split_once(':') else {
            continue;
        };
        let lower = name.trim().to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "via" | "v" | "from" | "f" | "to" | "t" | "call-id" | "i" | "cseq"
        ) {
            out.push_str(line.trim_end());
            out.push_str("\r\n");
            copied = true;
        }
    }
    if !copied {
        return None;
    }
    out.push_str("Content-Length: 0\r\n\r\n");
    Some(Bytes::from(out))
}

fn default_reason(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        413 => "Message Too Large",
        420 => "Bad Extension",
        483 => "Too Many Hops",
        488 => "Not Acceptable Here",
        _ => "Bad Request",
    }
}
