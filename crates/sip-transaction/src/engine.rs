// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction engine: owns the transaction tables, drives the state
//! machines, schedules retransmit timers, and matches inbound messages.
//!
//! The engine talks to the wire through the [`TransportDispatcher`]
//! capability and never holds a reference to the transport itself; the
//! transport owns the engine, not the other way around. Timer expirations
//! and transport faults are funneled through an internal command channel so
//! every state mutation happens under the table's exclusive entry access.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sip_core::{CSeq, Header, Method, Request, Response};
use sip_parse::serialize_request;
use smol_str::SmolStr;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::{debug, error, warn};

use crate::{
    fsm::{
        ClientInviteAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteAction,
        ClientNonInviteEvent, ClientNonInviteFsm, ServerInviteAction, ServerInviteEvent,
        ServerInviteFsm, ServerNonInviteAction, ServerNonInviteEvent, ServerNonInviteFsm,
    },
    key::TransactionId,
    timers::{TimerDefaults, Transport, TransportAwareTimers},
    TransactionTimer,
};

/// Context captured per transaction so retransmissions reuse the transport
/// path the first transmission took.
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub transport: Transport,
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    /// Channel the message arrived on / should leave through.
    pub channel_id: Option<SmolStr>,
    /// Connection-oriented session on that channel.
    pub connection_id: Option<SmolStr>,
}

impl TransportContext {
    pub fn new(transport: Transport, peer: SocketAddr) -> Self {
        Self {
            transport,
            peer,
            local: None,
            channel_id: None,
            connection_id: None,
        }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<SmolStr>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}

/// Dispatches outbound payloads generated by the engine.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()>;

    /// Wire retransmission; default forwards to [`dispatch`]. The transport
    /// overrides this to emit retransmit trace events.
    async fn dispatch_retransmit(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        self.dispatch(ctx, payload).await
    }
}

/// Application callbacks for client transaction progress.
#[async_trait]
pub trait TransactionUser: Send + Sync + 'static {
    async fn on_provisional(&self, id: &TransactionId, response: &Response);
    async fn on_final(&self, id: &TransactionId, response: &Response);
    async fn on_terminated(&self, id: &TransactionId, reason: &str);
    async fn on_transport_error(&self, id: &TransactionId);
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timer_defaults: TimerDefaults,
    /// Soft cap on concurrently tracked transactions.
    pub max_pending_transactions: usize,
    /// Run the timer schedule but keep retransmissions off the wire, for
    /// peers that misinterpret retransmits.
    pub disable_retransmit_sending: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer_defaults: TimerDefaults::default(),
            max_pending_transactions: 5_000,
            disable_retransmit_sending: false,
        }
    }
}

/// Errors surfaced to engine callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The transaction table reached `max_pending_transactions`. The caller
    /// decides what to shed; the engine never evicts silently.
    TooManyTransactions { limit: usize },
    /// The message carries no top Via to derive a transaction ID from.
    MissingVia,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::TooManyTransactions { limit } => {
                write!(f, "transaction table full (limit {})", limit)
            }
            EngineError::MissingVia => write!(f, "message has no top Via"),
        }
    }
}

impl std::error::Error for EngineError {}

/// How the engine disposed of an inbound request.
#[derive(Debug)]
pub enum RequestDisposition {
    /// A new server transaction was created; surface the request to the
    /// application together with this handle.
    New(ServerTransactionHandle),
    /// Absorbed by an existing transaction (retransmit replay, ACK to a
    /// non-2xx final, CANCEL pairing).
    Consumed,
    /// An ACK matching no transaction; the ACK for a 2xx travels on a new
    /// branch and belongs to the dialog layer.
    StrayAck,
}

enum Command {
    ClientTimer {
        id: TransactionId,
        timer: TransactionTimer,
    },
    ServerTimer {
        id: TransactionId,
        timer: TransactionTimer,
    },
    ClientTransportError {
        id: TransactionId,
    },
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    ctx: TransportContext,
    tu: Arc<dyn TransactionUser>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    /// Original request, kept for ACK construction.
    request: Request,
    /// Serialized ACK for re-ACKing retransmitted finals.
    ack_template: Option<Bytes>,
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ServerEntry {
    kind: ServerKind,
    ctx: TransportContext,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    /// Original request, kept for CANCEL-driven 487 generation.
    request: Request,
}

impl ClientEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

impl ServerEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

struct EngineInner {
    dispatcher: Arc<dyn TransportDispatcher>,
    client: DashMap<TransactionId, ClientEntry>,
    server: DashMap<TransactionId, ServerEntry>,
    config: EngineConfig,
}

/// Owns SIP transactions and drives their timers and retransmissions.
#[derive(Clone)]
pub struct TransactionEngine {
    inner: Arc<EngineInner>,
    cmd_tx: mpsc::Sender<Command>,
}

impl TransactionEngine {
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>) -> Self {
        Self::with_config(dispatcher, EngineConfig::default())
    }

    pub fn with_config(dispatcher: Arc<dyn TransportDispatcher>, config: EngineConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let engine = Self {
            inner: Arc::new(EngineInner {
                dispatcher,
                client: DashMap::new(),
                server: DashMap::new(),
                config,
            }),
            cmd_tx,
        };
        engine.spawn_command_loop(cmd_rx);
        engine
    }

    /// Number of transactions currently tracked.
    pub fn len(&self) -> usize {
        self.inner.client.len() + self.inner.server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of a server INVITE transaction, if one exists.
    pub fn server_invite_state(&self, id: &TransactionId) -> Option<crate::ServerInviteState> {
        self.inner.server.get(id).and_then(|e| match &e.kind {
            ServerKind::Invite(fsm) => Some(fsm.state),
            ServerKind::NonInvite(_) => None,
        })
    }

    /// Current state of a client INVITE transaction, if one exists.
    pub fn client_invite_state(&self, id: &TransactionId) -> Option<crate::ClientInviteState> {
        self.inner.client.get(id).and_then(|e| match &e.kind {
            ClientKind::Invite(fsm) => Some(fsm.state),
            ClientKind::NonInvite(_) => None,
        })
    }

    fn timers_for(&self, transport: Transport) -> TransportAwareTimers {
        TransportAwareTimers::with_defaults(transport, self.inner.config.timer_defaults)
    }

    fn check_capacity(&self) -> Result<(), EngineError> {
        let limit = self.inner.config.max_pending_transactions;
        if limit > 0 && self.len() >= limit {
            return Err(EngineError::TooManyTransactions { limit });
        }
        Ok(())
    }

    fn spawn_command_loop(&self, mut rx: mpsc::Receiver<Command>) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::ClientTimer { id, timer } => {
                        engine.handle_client_timer(id, timer).await
                    }
                    Command::ServerTimer { id, timer } => {
                        engine.handle_server_timer(id, timer).await
                    }
                    Command::ClientTransportError { id } => {
                        engine.handle_client_transport_error(id).await
                    }
                }
            }
        });
    }

    /// Starts a client transaction and transmits the request.
    pub async fn start_client(
        &self,
        request: Request,
        ctx: TransportContext,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<TransactionId, EngineError> {
        let id = TransactionId::from_request(&request).ok_or(EngineError::MissingVia)?;
        self.check_capacity()?;

        debug!(id = ?id, method = %request.method, "starting client transaction");
        let timers = self.timers_for(ctx.transport);
        let entry = if request.method.is_invite() {
            let fsm = ClientInviteFsm::new(timers);
            ClientEntry {
                kind: ClientKind::Invite(fsm),
                ctx,
                tu,
                timers: HashMap::new(),
                request: request.clone(),
                ack_template: None,
            }
        } else {
            let fsm = ClientNonInviteFsm::new(timers);
            ClientEntry {
                kind: ClientKind::NonInvite(fsm),
                ctx,
                tu,
                timers: HashMap::new(),
                request: request.clone(),
                ack_template: None,
            }
        };
        self.inner.client.insert(id.clone(), entry);

        let actions = {
            let mut entry = self
                .inner
                .client
                .get_mut(&id)
                .expect("entry inserted above");
            match &mut entry.kind {
                ClientKind::Invite(fsm) => {
                    ClientActions::Invite(fsm.on_event(ClientInviteEvent::SendInvite(request)))
                }
                ClientKind::NonInvite(fsm) => ClientActions::NonInvite(
                    fsm.on_event(ClientNonInviteEvent::SendRequest(request)),
                ),
            }
        };
        self.apply_client_actions(&id, actions).await;
        Ok(id)
    }

    /// Registers an inbound request with the engine.
    pub async fn receive_request(
        &self,
        request: Request,
        ctx: TransportContext,
    ) -> Result<RequestDisposition, EngineError> {
        let id = TransactionId::from_request(&request).ok_or(EngineError::MissingVia)?;

        // ACK folds onto the INVITE id; Completed -> Confirmed, later -> drop.
        if request.method == Method::Ack {
            if let Some(mut entry) = self.inner.server.get_mut(&id) {
                let actions = match &mut entry.kind {
                    ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::ReceiveAck),
                    ServerKind::NonInvite(_) => Vec::new(),
                };
                drop(entry);
                self.apply_server_actions(&id, actions).await;
                return Ok(RequestDisposition::Consumed);
            }
            return Ok(RequestDisposition::StrayAck);
        }

        // Duplicate of a known transaction: replay the buffered response.
        if let Some(entry) = self.inner.server.get(&id) {
            let actions = match &entry.kind {
                ServerKind::Invite(fsm) => fsm.on_retransmit(),
                ServerKind::NonInvite(fsm) => map_non_invite(fsm.on_retransmit()),
            };
            drop(entry);
            debug!(id = ?id, "request retransmission absorbed");
            self.apply_server_retransmit(&id, actions).await;
            return Ok(RequestDisposition::Consumed);
        }

        // Unmatched CANCEL: pair it with the INVITE sharing its branch.
        if request.method == Method::Cancel {
            let invite_id = id.invite_peer();
            if self.inner.server.contains_key(&invite_id) {
                return self.cancel_invite(request, ctx, id, invite_id).await;
            }
        }

        self.check_capacity()?;
        let timers = self.timers_for(ctx.transport);
        let entry = if request.method.is_invite() {
            ServerEntry {
                kind: ServerKind::Invite(ServerInviteFsm::new(timers)),
                ctx,
                timers: HashMap::new(),
                request: request.clone(),
            }
        } else {
            ServerEntry {
                kind: ServerKind::NonInvite(ServerNonInviteFsm::new(timers)),
                ctx,
                timers: HashMap::new(),
                request: request.clone(),
            }
        };
        self.inner.server.insert(id.clone(), entry);

        let actions = {
            let mut entry = self
                .inner
                .server
                .get_mut(&id)
                .expect("entry inserted above");
            match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::ReceiveInvite(request)),
                ServerKind::NonInvite(fsm) => {
                    map_non_invite(fsm.on_event(ServerNonInviteEvent::ReceiveRequest(request)))
                }
            }
        };
        self.apply_server_actions(&id, actions).await;

        Ok(RequestDisposition::New(ServerTransactionHandle {
            engine: self.clone(),
            id,
        }))
    }

    /// CANCEL of a live INVITE: 487 on the INVITE's UAS transaction, 200 OK
    /// on a fresh UAS transaction for the CANCEL itself.
    async fn cancel_invite(
        &self,
        cancel: Request,
        ctx: TransportContext,
        cancel_id: TransactionId,
        invite_id: TransactionId,
    ) -> Result<RequestDisposition, EngineError> {
        // The CANCEL gets its own table entry, so the cap applies here the
        // same as on any other insertion.
        self.check_capacity()?;
        debug!(invite = ?invite_id, "CANCEL matched a pending INVITE");

        let timers = self.timers_for(ctx.transport);
        let entry = ServerEntry {
            kind: ServerKind::NonInvite(ServerNonInviteFsm::new(timers)),
            ctx,
            timers: HashMap::new(),
            request: cancel.clone(),
        };
        self.inner.server.insert(cancel_id.clone(), entry);

        let ok = Response::for_request(200, "OK", &cancel);
        self.send_final(&cancel_id, ok).await;

        let invite_request = self
            .inner
            .server
            .get(&invite_id)
            .map(|entry| entry.request.clone());
        if let Some(invite_request) = invite_request {
            let terminated = Response::for_request(487, "Request Terminated", &invite_request);
            self.send_final(&invite_id, terminated).await;
        }

        Ok(RequestDisposition::Consumed)
    }

    /// Feeds a network response into the matching client transaction.
    /// Returns `false` when no transaction matches (the transport surfaces
    /// the response to the application instead).
    pub async fn receive_response(&self, response: Response) -> bool {
        let Some(id) = TransactionId::from_response(&response) else {
            debug!("response without derivable transaction id");
            return false;
        };
        if !self.inner.client.contains_key(&id) {
            debug!(id = ?id, status = response.status, "no matching client transaction");
            return false;
        }

        let actions = {
            let mut entry = self.inner.client.get_mut(&id).expect("checked above");
            let provisional = response.is_provisional();
            match (&mut entry.kind, provisional) {
                (ClientKind::Invite(fsm), true) => ClientActions::Invite(
                    fsm.on_event(ClientInviteEvent::ReceiveProvisional(response)),
                ),
                (ClientKind::Invite(fsm), false) => {
                    ClientActions::Invite(fsm.on_event(ClientInviteEvent::ReceiveFinal(response)))
                }
                (ClientKind::NonInvite(fsm), true) => ClientActions::NonInvite(
                    fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(response)),
                ),
                (ClientKind::NonInvite(fsm), false) => ClientActions::NonInvite(
                    fsm.on_event(ClientNonInviteEvent::ReceiveFinal(response)),
                ),
            }
        };
        self.apply_client_actions(&id, actions).await;
        true
    }

    /// Sends a provisional response on a server transaction.
    pub async fn send_provisional(&self, id: &TransactionId, response: Response) {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(id) else {
                return;
            };
            match &mut entry.kind {
                ServerKind::Invite(fsm) => {
                    fsm.on_event(ServerInviteEvent::SendProvisional(response))
                }
                ServerKind::NonInvite(fsm) => {
                    map_non_invite(fsm.on_event(ServerNonInviteEvent::SendProvisional(response)))
                }
            }
        };
        self.apply_server_actions(id, actions).await;
    }

    /// Sends the final response on a server transaction. The transaction
    /// retransmits it until the ACK arrives (INVITE) or Timer J expires.
    pub async fn send_final(&self, id: &TransactionId, response: Response) {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(id) else {
                return;
            };
            match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::SendFinal(response)),
                ServerKind::NonInvite(fsm) => {
                    map_non_invite(fsm.on_event(ServerNonInviteEvent::SendFinal(response)))
                }
            }
        };
        self.apply_server_actions(id, actions).await;
    }

    /// TU-driven cancellation: moves the client transaction to `Terminated`
    /// and cancels its timers.
    pub async fn cancel_client(&self, id: &TransactionId) {
        if let Some((_, mut entry)) = self.inner.client.remove(id) {
            entry.cancel_all();
            entry.tu.on_terminated(id, "cancelled by TU").await;
        }
    }

    /// Cancels every timer and clears the tables. Used at transport
    /// shutdown; in-flight commands drain harmlessly against empty tables.
    pub fn shutdown(&self) {
        for mut entry in self.inner.client.iter_mut() {
            entry.cancel_all();
        }
        for mut entry in self.inner.server.iter_mut() {
            entry.cancel_all();
        }
        self.inner.client.clear();
        self.inner.server.clear();
    }

    async fn handle_client_timer(&self, id: TransactionId, timer: TransactionTimer) {
        let actions = {
            let Some(mut entry) = self.inner.client.get_mut(&id) else {
                return;
            };
            entry.cancel_timer(timer);
            match &mut entry.kind {
                ClientKind::Invite(fsm) => {
                    ClientActions::Invite(fsm.on_event(ClientInviteEvent::TimerFired(timer)))
                }
                ClientKind::NonInvite(fsm) => ClientActions::NonInvite(
                    fsm.on_event(ClientNonInviteEvent::TimerFired(timer)),
                ),
            }
        };
        self.apply_client_actions(&id, actions).await;
    }

    async fn handle_server_timer(&self, id: TransactionId, timer: TransactionTimer) {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(&id) else {
                return;
            };
            entry.cancel_timer(timer);
            match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::TimerFired(timer)),
                ServerKind::NonInvite(fsm) => {
                    map_non_invite(fsm.on_event(ServerNonInviteEvent::TimerFired(timer)))
                }
            }
        };
        self.apply_server_actions(&id, actions).await;
    }

    async fn handle_client_transport_error(&self, id: TransactionId) {
        let (actions, tu) = {
            let Some(mut entry) = self.inner.client.get_mut(&id) else {
                return;
            };
            let actions = match &mut entry.kind {
                ClientKind::Invite(fsm) => {
                    ClientActions::Invite(fsm.on_event(ClientInviteEvent::TransportError))
                }
                ClientKind::NonInvite(fsm) => {
                    ClientActions::NonInvite(fsm.on_event(ClientNonInviteEvent::TransportError))
                }
            };
            (actions, entry.tu.clone())
        };
        tu.on_transport_error(&id).await;
        self.apply_client_actions(&id, actions).await;
    }

    async fn apply_client_actions(&self, id: &TransactionId, actions: ClientActions) {
        match actions {
            ClientActions::Invite(actions) => {
                for action in actions {
                    self.apply_client_invite_action(id, action).await;
                }
            }
            ClientActions::NonInvite(actions) => {
                for action in actions {
                    self.apply_client_non_invite_action(id, action).await;
                }
            }
        }
    }

    async fn apply_client_invite_action(&self, id: &TransactionId, action: ClientInviteAction) {
        match action {
            ClientInviteAction::Transmit { bytes, retransmit } => {
                self.transmit_client(id, bytes, retransmit).await;
            }
            ClientInviteAction::Deliver(response) => {
                let Some(tu) = self.client_tu(id) else { return };
                if response.is_provisional() {
                    tu.on_provisional(id, &response).await;
                } else {
                    tu.on_final(id, &response).await;
                }
            }
            ClientInviteAction::GenerateAck(response) => {
                let Some((request, ctx)) = self
                    .inner
                    .client
                    .get(id)
                    .map(|e| (e.request.clone(), e.ctx.clone()))
                else {
                    return;
                };
                let ack = build_ack(&request, &response);
                let bytes = serialize_request(&ack);
                if let Some(mut entry) = self.inner.client.get_mut(id) {
                    entry.ack_template = Some(bytes.clone());
                }
                if let Err(e) = self.inner.dispatcher.dispatch(&ctx, bytes).await {
                    warn!(%e, id = ?id, "ACK dispatch failed");
                }
            }
            ClientInviteAction::RetransmitAck => {
                if self.inner.config.disable_retransmit_sending {
                    return;
                }
                let Some((template, ctx)) = self
                    .inner
                    .client
                    .get(id)
                    .and_then(|e| e.ack_template.clone().map(|t| (t, e.ctx.clone())))
                else {
                    return;
                };
                if let Err(e) = self.inner.dispatcher.dispatch_retransmit(&ctx, template).await {
                    warn!(%e, id = ?id, "re-ACK dispatch failed");
                }
            }
            ClientInviteAction::Schedule { timer, duration } => {
                self.schedule_client_timer(id.clone(), timer, duration);
            }
            ClientInviteAction::CancelTimer(timer) => {
                if let Some(mut entry) = self.inner.client.get_mut(id) {
                    entry.cancel_timer(timer);
                }
            }
            ClientInviteAction::Terminate { reason } => {
                self.terminate_client(id, &reason).await;
            }
        }
    }

    async fn apply_client_non_invite_action(
        &self,
        id: &TransactionId,
        action: ClientNonInviteAction,
    ) {
        match action {
            ClientNonInviteAction::Transmit { bytes, retransmit } => {
                self.transmit_client(id, bytes, retransmit).await;
            }
            ClientNonInviteAction::Deliver(response) => {
                let Some(tu) = self.client_tu(id) else { return };
                if response.is_provisional() {
                    tu.on_provisional(id, &response).await;
                } else {
                    tu.on_final(id, &response).await;
                }
            }
            ClientNonInviteAction::Schedule { timer, duration } => {
                self.schedule_client_timer(id.clone(), timer, duration);
            }
            ClientNonInviteAction::CancelTimer(timer) => {
                if let Some(mut entry) = self.inner.client.get_mut(id) {
                    entry.cancel_timer(timer);
                }
            }
            ClientNonInviteAction::Terminate { reason } => {
                self.terminate_client(id, &reason).await;
            }
        }
    }

    async fn transmit_client(&self, id: &TransactionId, bytes: Bytes, retransmit: bool) {
        if retransmit && self.inner.config.disable_retransmit_sending {
            debug!(id = ?id, "retransmission suppressed by configuration");
            return;
        }
        let Some(ctx) = self.inner.client.get(id).map(|e| e.ctx.clone()) else {
            return;
        };
        let result = if retransmit {
            self.inner.dispatcher.dispatch_retransmit(&ctx, bytes).await
        } else {
            self.inner.dispatcher.dispatch(&ctx, bytes).await
        };
        if let Err(e) = result {
            error!(%e, id = ?id, "client transport dispatch failed");
            let _ = self
                .cmd_tx
                .send(Command::ClientTransportError { id: id.clone() })
                .await;
        }
    }

    fn client_tu(&self, id: &TransactionId) -> Option<Arc<dyn TransactionUser>> {
        self.inner.client.get(id).map(|e| e.tu.clone())
    }

    async fn terminate_client(&self, id: &TransactionId, reason: &str) {
        if let Some((_, mut entry)) = self.inner.client.remove(id) {
            entry.cancel_all();
            entry.tu.on_terminated(id, reason).await;
        }
    }

    async fn apply_server_actions(&self, id: &TransactionId, actions: Vec<ServerInviteAction>) {
        for action in actions {
            match action {
                ServerInviteAction::Transmit { bytes, retransmit } => {
                    self.transmit_server(id, bytes, retransmit).await;
                }
                ServerInviteAction::Schedule { timer, duration } => {
                    self.schedule_server_timer(id.clone(), timer, duration);
                }
                ServerInviteAction::CancelTimer(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(id) {
                        entry.cancel_timer(timer);
                    }
                }
                ServerInviteAction::Terminate { reason } => {
                    debug!(id = ?id, %reason, "server transaction terminated");
                    if let Some((_, mut entry)) = self.inner.server.remove(id) {
                        entry.cancel_all();
                    }
                }
            }
        }
    }

    /// Replays buffered responses for duplicate requests. Kept apart from
    /// [`apply_server_actions`] so schedule/terminate never sneak in.
    async fn apply_server_retransmit(&self, id: &TransactionId, actions: Vec<ServerInviteAction>) {
        for action in actions {
            if let ServerInviteAction::Transmit { bytes, retransmit } = action {
                self.transmit_server(id, bytes, retransmit).await;
            }
        }
    }

    async fn transmit_server(&self, id: &TransactionId, bytes: Bytes, retransmit: bool) {
        if retransmit && self.inner.config.disable_retransmit_sending {
            debug!(id = ?id, "retransmission suppressed by configuration");
            return;
        }
        let Some(ctx) = self.inner.server.get(id).map(|e| e.ctx.clone()) else {
            return;
        };
        let result = if retransmit {
            self.inner.dispatcher.dispatch_retransmit(&ctx, bytes).await
        } else {
            self.inner.dispatcher.dispatch(&ctx, bytes).await
        };
        if let Err(e) = result {
            error!(%e, id = ?id, "server transport dispatch failed");
            let actions = {
                let Some(mut entry) = self.inner.server.get_mut(id) else {
                    return;
                };
                match &mut entry.kind {
                    ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::TransportError),
                    ServerKind::NonInvite(fsm) => {
                        map_non_invite(fsm.on_event(ServerNonInviteEvent::TransportError))
                    }
                }
            };
            // Only cancel/terminate come back from a transport error, so
            // recursion stops here.
            for action in actions {
                match action {
                    ServerInviteAction::CancelTimer(timer) => {
                        if let Some(mut entry) = self.inner.server.get_mut(id) {
                            entry.cancel_timer(timer);
                        }
                    }
                    ServerInviteAction::Terminate { .. } => {
                        if let Some((_, mut entry)) = self.inner.server.remove(id) {
                            entry.cancel_all();
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn schedule_client_timer(&self, id: TransactionId, timer: TransactionTimer, duration: Duration) {
        if duration.is_zero() {
            if self.inner.client.contains_key(&id) {
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = cmd_tx.send(Command::ClientTimer { id, timer }).await;
                });
            }
            return;
        }
        let Some(mut entry) = self.inner.client.get_mut(&id) else {
            return;
        };
        entry.cancel_timer(timer);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        drop(entry);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(Command::ClientTimer { id, timer }).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    fn schedule_server_timer(&self, id: TransactionId, timer: TransactionTimer, duration: Duration) {
        if duration.is_zero() {
            if self.inner.server.contains_key(&id) {
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = cmd_tx.send(Command::ServerTimer { id, timer }).await;
                });
            }
            return;
        }
        let Some(mut entry) = self.inner.server.get_mut(&id) else {
            return;
        };
        entry.cancel_timer(timer);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        drop(entry);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(Command::ServerTimer { id, timer }).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }
}

enum ClientActions {
    Invite(Vec<ClientInviteAction>),
    NonInvite(Vec<ClientNonInviteAction>),
}

fn map_non_invite(actions: Vec<ServerNonInviteAction>) -> Vec<ServerInviteAction> {
    actions
        .into_iter()
        .map(|action| match action {
            ServerNonInviteAction::Transmit { bytes, retransmit } => {
                ServerInviteAction::Transmit { bytes, retransmit }
            }
            ServerNonInviteAction::Schedule { timer, duration } => {
                ServerInviteAction::Schedule { timer, duration }
            }
            ServerNonInviteAction::CancelTimer(timer) => ServerInviteAction::CancelTimer(timer),
            ServerNonInviteAction::Terminate { reason } => ServerInviteAction::Terminate { reason },
        })
        .collect()
}

/// Builds the ACK for a non-2xx final response (RFC 3261 §17.1.1.3): same
/// request-URI, branch, From, Call-ID and Route set as the INVITE, the To
/// from the response, CSeq renumbered to ACK.
fn build_ack(invite: &Request, response: &Response) -> Request {
    let mut header = Header::new();
    if let Some(via) = invite.header.top_via() {
        header.push_via(via.clone());
    }
    header.from = invite.header.from.clone();
    header.to = response
        .header
        .to
        .clone()
        .or_else(|| invite.header.to.clone());
    header.call_id = invite.header.call_id.clone();
    if let Some(cseq) = &invite.header.cseq {
        header.cseq = Some(CSeq::new(cseq.seq, Method::Ack));
    }
    header.routes = invite.header.routes.clone();
    header.max_forwards = Some(70);
    Request::new(Method::Ack, invite.uri.clone(), header, Bytes::new())
}

/// Handle for answering on a server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    engine: TransactionEngine,
    id: TransactionId,
}

impl std::fmt::Debug for ServerTransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransactionHandle")
            .field("id", &self.id)
            .finish()
    }
}

impl ServerTransactionHandle {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub async fn send_provisional(&self, response: Response) {
        self.engine.send_provisional(&self.id, response).await;
    }

    pub async fn send_final(&self, response: Response) {
        self.engine.send_final(&self.id, response).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::{NameAddr, SipUri, Via};
    use tokio::sync::Mutex;

    struct TestDispatcher {
        sent: Mutex<Vec<(Bytes, bool)>>,
    }

    impl TestDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        async fn sent_count(&self) -> usize {
            self.sent.lock().await.len()
        }

        async fn payloads(&self) -> Vec<Bytes> {
            self.sent.lock().await.iter().map(|(b, _)| b.clone()).collect()
        }
    }

    #[async_trait]
    impl TransportDispatcher for TestDispatcher {
        async fn dispatch(&self, _ctx: &TransportContext, payload: Bytes) -> Result<()> {
            self.sent.lock().await.push((payload, false));
            Ok(())
        }

        async fn dispatch_retransmit(
            &self,
            _ctx: &TransportContext,
            payload: Bytes,
        ) -> Result<()> {
            self.sent.lock().await.push((payload, true));
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestTu {
        provisionals: Mutex<Vec<u16>>,
        finals: Mutex<Vec<u16>>,
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TransactionUser for TestTu {
        async fn on_provisional(&self, _id: &TransactionId, response: &Response) {
            self.provisionals.lock().await.push(response.status);
        }

        async fn on_final(&self, _id: &TransactionId, response: &Response) {
            self.finals.lock().await.push(response.status);
        }

        async fn on_terminated(&self, _id: &TransactionId, reason: &str) {
            self.terminated.lock().await.push(reason.to_owned());
        }

        async fn on_transport_error(&self, _id: &TransactionId) {}
    }

    fn request(method: Method, branch: &str) -> Request {
        let mut header = Header::new();
        let mut via = Via::new("UDP", "client.example.com", Some(5060));
        via.branch = Some(SmolStr::new(branch));
        header.push_via(via);
        header.from = Some(NameAddr::parse("<sip:alice@example.com>;tag=77").unwrap());
        header.to = Some(NameAddr::parse("<sip:bob@example.com>").unwrap());
        header.call_id = Some(SmolStr::new("engine@test"));
        header.cseq = Some(CSeq::new(1, method.clone()));
        header.max_forwards = Some(70);
        Request::new(
            method,
            SipUri::parse("sip:bob@example.com").unwrap(),
            header,
            Bytes::new(),
        )
    }

    fn ctx() -> TransportContext {
        TransportContext::new(Transport::Udp, "127.0.0.1:5060".parse().unwrap())
    }

    #[tokio::test]
    async fn client_invite_completes_on_603_and_acks() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::new(dispatcher.clone());
        let tu = Arc::new(TestTu::default());

        let invite = request(Method::Invite, "z9hG4bKtest603");
        let id = engine
            .start_client(invite.clone(), ctx(), tu.clone())
            .await
            .expect("start");
        assert_eq!(dispatcher.sent_count().await, 1);

        let decline = Response::for_request(603, "Decline", &invite);
        assert!(engine.receive_response(decline).await);

        assert_eq!(tu.finals.lock().await.as_slice(), &[603]);
        // INVITE + ACK on the wire.
        let payloads = dispatcher.payloads().await;
        assert_eq!(payloads.len(), 2);
        let ack_text = String::from_utf8(payloads[1].to_vec()).unwrap();
        assert!(ack_text.starts_with("ACK "));
        assert!(ack_text.contains("branch=z9hG4bKtest603"));
        assert!(ack_text.contains("CSeq: 1 ACK"));
        let _ = id;
    }

    #[tokio::test]
    async fn response_without_match_is_not_consumed() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::new(dispatcher);
        let invite = request(Method::Invite, "z9hG4bKnomatch");
        let resp = Response::for_request(200, "OK", &invite);
        assert!(!engine.receive_response(resp).await);
    }

    #[tokio::test]
    async fn server_absorbs_duplicate_request_and_replays_final() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::new(dispatcher.clone());

        let options = request(Method::Options, "z9hG4bKdup");
        let disposition = engine
            .receive_request(options.clone(), ctx())
            .await
            .expect("receive");
        let handle = match disposition {
            RequestDisposition::New(handle) => handle,
            other => panic!("expected new transaction, got {:?}", other),
        };

        handle
            .send_final(Response::for_request(200, "OK", &options))
            .await;
        assert_eq!(dispatcher.sent_count().await, 1);

        // Duplicate request: engine replays the byte-identical final.
        let disposition = engine
            .receive_request(options, ctx())
            .await
            .expect("duplicate");
        assert!(matches!(disposition, RequestDisposition::Consumed));
        let payloads = dispatcher.payloads().await;
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], payloads[1]);
    }

    #[tokio::test]
    async fn ack_moves_server_invite_to_confirmed_and_is_consumed() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::new(dispatcher.clone());

        let invite = request(Method::Invite, "z9hG4bKack");
        let disposition = engine
            .receive_request(invite.clone(), ctx())
            .await
            .expect("receive");
        let handle = match disposition {
            RequestDisposition::New(handle) => handle,
            other => panic!("unexpected {:?}", other),
        };
        handle
            .send_final(Response::for_request(486, "Busy Here", &invite))
            .await;

        let mut ack = request(Method::Ack, "z9hG4bKack");
        ack.header.cseq = Some(CSeq::new(1, Method::Ack));
        let disposition = engine.receive_request(ack, ctx()).await.expect("ack");
        assert!(matches!(disposition, RequestDisposition::Consumed));
    }

    #[tokio::test]
    async fn stray_ack_surfaces_to_dialog_layer() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::new(dispatcher);
        let mut ack = request(Method::Ack, "z9hG4bKstray");
        ack.header.cseq = Some(CSeq::new(1, Method::Ack));
        let disposition = engine.receive_request(ack, ctx()).await.expect("ack");
        assert!(matches!(disposition, RequestDisposition::StrayAck));
    }

    #[tokio::test]
    async fn cancel_pairs_with_invite_and_answers_both() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::new(dispatcher.clone());

        let invite = request(Method::Invite, "z9hG4bKcxl");
        engine
            .receive_request(invite, ctx())
            .await
            .expect("invite");

        let cancel = request(Method::Cancel, "z9hG4bKcxl");
        let disposition = engine
            .receive_request(cancel, ctx())
            .await
            .expect("cancel");
        assert!(matches!(disposition, RequestDisposition::Consumed));

        let texts: Vec<String> = dispatcher
            .payloads()
            .await
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert!(
            texts.iter().any(|t| t.starts_with("SIP/2.0 200 OK")
                && t.contains("CSeq: 1 CANCEL")),
            "missing 200 for CANCEL: {texts:?}"
        );
        assert!(
            texts.iter().any(|t| t.starts_with("SIP/2.0 487")
                && t.contains("CSeq: 1 INVITE")),
            "missing 487 for INVITE: {texts:?}"
        );
    }

    #[tokio::test]
    async fn capacity_overflow_is_an_error_not_an_eviction() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::with_config(
            dispatcher,
            EngineConfig {
                max_pending_transactions: 1,
                ..EngineConfig::default()
            },
        );

        engine
            .receive_request(request(Method::Options, "z9hG4bKfirst"), ctx())
            .await
            .expect("first fits");
        assert_eq!(engine.len(), 1);

        let err = engine
            .receive_request(request(Method::Options, "z9hG4bKsecond"), ctx())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::TooManyTransactions { limit: 1 });
        // The first transaction is untouched.
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn cancel_of_existing_invite_respects_capacity() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::with_config(
            dispatcher.clone(),
            EngineConfig {
                max_pending_transactions: 1,
                ..EngineConfig::default()
            },
        );

        engine
            .receive_request(request(Method::Invite, "z9hG4bKcapcxl"), ctx())
            .await
            .expect("invite fits");
        assert_eq!(engine.len(), 1);

        // The paired CANCEL needs its own table entry; at the cap it must
        // fail loudly rather than grow the table past the limit.
        let err = engine
            .receive_request(request(Method::Cancel, "z9hG4bKcapcxl"), ctx())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::TooManyTransactions { limit: 1 });
        assert_eq!(engine.len(), 1);
        // The INVITE was not answered with 487 behind the caller's back.
        assert_eq!(dispatcher.sent_count().await, 0);
    }

    #[tokio::test]
    async fn disable_retransmit_sending_suppresses_wire_retransmits() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::with_config(
            dispatcher.clone(),
            EngineConfig {
                timer_defaults: TimerDefaults {
                    t1: Duration::from_millis(10),
                    t2: Duration::from_millis(80),
                    t4: Duration::from_millis(100),
                },
                disable_retransmit_sending: true,
                ..EngineConfig::default()
            },
        );
        let tu = Arc::new(TestTu::default());
        engine
            .start_client(request(Method::Options, "z9hG4bKquiet"), ctx(), tu)
            .await
            .expect("start");

        time::sleep(Duration::from_millis(120)).await;
        // Only the initial transmission hit the wire.
        assert_eq!(dispatcher.sent_count().await, 1);
    }

    #[tokio::test]
    async fn udp_client_retransmits_until_final() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::with_config(
            dispatcher.clone(),
            EngineConfig {
                timer_defaults: TimerDefaults {
                    t1: Duration::from_millis(10),
                    t2: Duration::from_millis(40),
                    t4: Duration::from_millis(50),
                },
                ..EngineConfig::default()
            },
        );
        let tu = Arc::new(TestTu::default());
        let options = request(Method::Options, "z9hG4bKrtx");
        engine
            .start_client(options.clone(), ctx(), tu.clone())
            .await
            .expect("start");

        time::sleep(Duration::from_millis(60)).await;
        let before = dispatcher.sent_count().await;
        assert!(before >= 2, "expected retransmissions, saw {before}");

        engine
            .receive_response(Response::for_request(200, "OK", &options))
            .await;
        let after_final = dispatcher.sent_count().await;
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            dispatcher.sent_count().await,
            after_final,
            "retransmissions must stop after the final response"
        );
        assert_eq!(tu.finals.lock().await.as_slice(), &[200]);
    }

    #[tokio::test]
    async fn timer_f_terminates_unanswered_client() {
        let dispatcher = TestDispatcher::new();
        let engine = TransactionEngine::with_config(
            dispatcher,
            EngineConfig {
                timer_defaults: TimerDefaults {
                    t1: Duration::from_millis(2),
                    t2: Duration::from_millis(8),
                    t4: Duration::from_millis(10),
                },
                ..EngineConfig::default()
            },
        );
        let tu = Arc::new(TestTu::default());
        engine
            .start_client(request(Method::Options, "z9hG4bKtimeout"), ctx(), tu.clone())
            .await
            .expect("start");

        // Timer F = 64 * 2ms = 128ms.
        time::sleep(Duration::from_millis(250)).await;
        let reasons = tu.terminated.lock().await.clone();
        assert!(
            reasons.iter().any(|r| r.contains("Timer F")),
            "expected Timer F termination, got {reasons:?}"
        );
        assert!(engine.is_empty());
    }
}
