//! The four RFC 3261 §17 transaction state machines.
//!
//! Each machine is pure: it consumes an event and returns the actions the
//! runtime must perform (transmit, schedule or cancel a timer, deliver a
//! response, terminate). The engine owns the wire and the clock; nothing in
//! here blocks or spawns.
//!
//! Retransmission intervals follow the UDP schedule
//! `T1, 2·T1, 4·T1, … min(2^n·T1, T2)` and stop after [`MAX_RETRANSMITS`]
//! attempts; the transaction timeout timers (B/F/H at 64·T1) put the final
//! bound on a transaction's life.

use std::time::Duration;

use bytes::Bytes;
use sip_core::{Request, Response};
use sip_parse::{serialize_request, serialize_response};
use smol_str::SmolStr;

use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
    TransactionTimer, TransportAwareTimers,
};

/// Upper bound on wire retransmissions of a single message (~32 s at the
/// default T1/T2).
pub const MAX_RETRANSMITS: u32 = 11;

/// Events that drive the client INVITE machine (RFC 3261 §17.1.1).
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the client INVITE machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInviteAction {
    Transmit { bytes: Bytes, retransmit: bool },
    Deliver(Response),
    /// Build and send the ACK for a non-2xx final; the engine stores the
    /// serialized ACK as the re-ACK template.
    GenerateAck(Response),
    /// A retransmitted final arrived in `Completed`: resend the stored ACK.
    RetransmitAck,
    Schedule { timer: TransactionTimer, duration: Duration },
    CancelTimer(TransactionTimer),
    Terminate { reason: SmolStr },
}

/// Implements RFC 3261 Figure 5 (client INVITE).
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TransportAwareTimers,
    a_interval: Duration,
    attempts: u32,
    last_invite: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.t1(),
            timers,
            attempts: 0,
            last_invite: None,
        }
    }

    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<ClientInviteAction> {
        use ClientInviteState::*;
        match (&self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) => self.handle_send(invite),
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (Completed, ClientInviteEvent::ReceiveFinal(response)) => {
                // Final response retransmission: re-ACK from the template.
                let _ = response;
                vec![ClientInviteAction::RetransmitAck]
            }
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::A)) => self.handle_timer_a(),
            (Calling | Proceeding, ClientInviteEvent::TimerFired(TransactionTimer::B)) => {
                self.terminate("Timer B expired", Some(TransactionTimer::A))
            }
            (Completed, ClientInviteEvent::TimerFired(TransactionTimer::D)) => {
                self.terminate("Timer D expired", None)
            }
            (_, ClientInviteEvent::TransportError) => self.terminate("transport error", None),
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, invite: Request) -> Vec<ClientInviteAction> {
        let bytes = serialize_request(&invite);
        self.last_invite = Some(bytes.clone());
        let mut actions = vec![ClientInviteAction::Transmit {
            bytes,
            retransmit: false,
        }];
        if self.timers.should_retransmit() {
            actions.push(ClientInviteAction::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            });
        }
        actions.push(ClientInviteAction::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientInviteAction> {
        self.state = ClientInviteState::Proceeding;
        vec![
            ClientInviteAction::CancelTimer(TransactionTimer::A),
            ClientInviteAction::Deliver(response),
        ]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientInviteAction> {
        let mut actions = vec![
            ClientInviteAction::CancelTimer(TransactionTimer::A),
            ClientInviteAction::CancelTimer(TransactionTimer::B),
            ClientInviteAction::Deliver(response.clone()),
        ];
        if response.is_success() {
            // 2xx terminates immediately; the ACK belongs to the dialog
            // layer.
            self.state = ClientInviteState::Terminated;
            actions.push(ClientInviteAction::Terminate {
                reason: SmolStr::new("2xx received"),
            });
        } else {
            self.state = ClientInviteState::Completed;
            actions.push(ClientInviteAction::GenerateAck(response));
            actions.push(ClientInviteAction::Schedule {
                timer: TransactionTimer::D,
                duration: self.timers.duration(TransactionTimer::D),
            });
        }
        actions
    }

    fn handle_timer_a(&mut self) -> Vec<ClientInviteAction> {
        self.attempts += 1;
        if self.attempts >= MAX_RETRANSMITS {
            return Vec::new();
        }
        let Some(invite) = &self.last_invite else {
            return Vec::new();
        };
        self.a_interval = (self.a_interval * 2).min(self.timers.t2());
        vec![
            ClientInviteAction::Transmit {
                bytes: invite.clone(),
                retransmit: true,
            },
            ClientInviteAction::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            },
        ]
    }

    fn terminate(
        &mut self,
        reason: &str,
        cancel: Option<TransactionTimer>,
    ) -> Vec<ClientInviteAction> {
        if matches!(self.state, ClientInviteState::Terminated) {
            return Vec::new();
        }
        self.state = ClientInviteState::Terminated;
        let mut actions = Vec::new();
        if let Some(timer) = cancel {
            actions.push(ClientInviteAction::CancelTimer(timer));
        }
        actions.push(ClientInviteAction::Terminate {
            reason: SmolStr::new(reason),
        });
        actions
    }
}

/// Events that drive the server INVITE machine (RFC 3261 §17.2.1).
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    ReceiveInvite(Request),
    SendProvisional(Response),
    SendFinal(Response),
    ReceiveAck,
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the server INVITE machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInviteAction {
    Transmit { bytes: Bytes, retransmit: bool },
    Schedule { timer: TransactionTimer, duration: Duration },
    CancelTimer(TransactionTimer),
    Terminate { reason: SmolStr },
}

/// Implements RFC 3261 Figure 6 (server INVITE).
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    timers: TransportAwareTimers,
    g_interval: Duration,
    attempts: u32,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.t1(),
            timers,
            attempts: 0,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<ServerInviteAction> {
        use ServerInviteState::*;
        match (&self.state, event) {
            (Proceeding, ServerInviteEvent::ReceiveInvite(_)) => {
                // Initial INVITE; any 100 Trying is the TU's decision.
                Vec::new()
            }
            (Proceeding, ServerInviteEvent::SendProvisional(resp)) => self.send_provisional(resp),
            (Proceeding, ServerInviteEvent::SendFinal(resp)) => self.send_final(resp),
            (Completed, ServerInviteEvent::ReceiveAck) => self.handle_ack(),
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::G)) => {
                self.handle_timer_g()
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::H)) => {
                self.terminate("Timer H expired")
            }
            (Confirmed, ServerInviteEvent::TimerFired(TransactionTimer::I)) => {
                self.terminate("Timer I expired")
            }
            (_, ServerInviteEvent::TransportError) => self.terminate("transport error"),
            _ => Vec::new(),
        }
    }

    /// Replays the buffered response for a duplicate INVITE.
    pub fn on_retransmit(&self) -> Vec<ServerInviteAction> {
        let bytes = match self.state {
            ServerInviteState::Proceeding => self.last_provisional.clone(),
            ServerInviteState::Completed => self.last_final.clone(),
            _ => None,
        };
        match bytes {
            Some(bytes) => vec![ServerInviteAction::Transmit {
                bytes,
                retransmit: true,
            }],
            None => Vec::new(),
        }
    }

    fn send_provisional(&mut self, response: Response) -> Vec<ServerInviteAction> {
        let bytes = serialize_response(&response);
        self.last_provisional = Some(bytes.clone());
        vec![ServerInviteAction::Transmit {
            bytes,
            retransmit: false,
        }]
    }

    fn send_final(&mut self, response: Response) -> Vec<ServerInviteAction> {
        let bytes = serialize_response(&response);
        if response.is_success() {
            // 2xx retransmission is the TU's concern (RFC 3261 §13.3.1.4).
            self.state = ServerInviteState::Terminated;
            return vec![
                ServerInviteAction::Transmit {
                    bytes,
                    retransmit: false,
                },
                ServerInviteAction::Terminate {
                    reason: SmolStr::new("2xx sent"),
                },
            ];
        }
        self.state = ServerInviteState::Completed;
        self.last_final = Some(bytes.clone());
        self.g_interval = self.timers.t1();
        let mut actions = vec![ServerInviteAction::Transmit {
            bytes,
            retransmit: false,
        }];
        if self.timers.should_retransmit() {
            actions.push(ServerInviteAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            });
        }
        actions.push(ServerInviteAction::Schedule {
            timer: TransactionTimer::H,
            duration: self.timers.duration(TransactionTimer::H),
        });
        actions
    }

    fn handle_ack(&mut self) -> Vec<ServerInviteAction> {
        self.state = ServerInviteState::Confirmed;
        vec![
            ServerInviteAction::CancelTimer(TransactionTimer::G),
            ServerInviteAction::CancelTimer(TransactionTimer::H),
            ServerInviteAction::Schedule {
                timer: TransactionTimer::I,
                duration: self.timers.duration(TransactionTimer::I),
            },
        ]
    }

    fn handle_timer_g(&mut self) -> Vec<ServerInviteAction> {
        self.attempts += 1;
        if self.attempts >= MAX_RETRANSMITS {
            return Vec::new();
        }
        let Some(bytes) = self.last_final.clone() else {
            return Vec::new();
        };
        self.g_interval = (self.g_interval * 2).min(self.timers.t2());
        vec![
            ServerInviteAction::Transmit {
                bytes,
                retransmit: true,
            },
            ServerInviteAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            },
        ]
    }

    fn terminate(&mut self, reason: &str) -> Vec<ServerInviteAction> {
        if matches!(self.state, ServerInviteState::Terminated) {
            return Vec::new();
        }
        self.state = ServerInviteState::Terminated;
        vec![
            ServerInviteAction::CancelTimer(TransactionTimer::G),
            ServerInviteAction::CancelTimer(TransactionTimer::H),
            ServerInviteAction::CancelTimer(TransactionTimer::I),
            ServerInviteAction::Terminate {
                reason: SmolStr::new(reason),
            },
        ]
    }
}

/// Events that drive the client non-INVITE machine (RFC 3261 §17.1.2).
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the non-INVITE client machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNonInviteAction {
    Transmit { bytes: Bytes, retransmit: bool },
    Deliver(Response),
    Schedule { timer: TransactionTimer, duration: Duration },
    CancelTimer(TransactionTimer),
    Terminate { reason: SmolStr },
}

/// Implements RFC 3261 Figure 7 (client non-INVITE).
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    timers: TransportAwareTimers,
    e_interval: Duration,
    attempts: u32,
    last_request: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.t1(),
            timers,
            attempts: 0,
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<ClientNonInviteAction> {
        use ClientNonInviteState::*;
        match (&self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) => self.handle_send(request),
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::E)) => {
                self.handle_timer_e()
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::F)) => {
                self.terminate("Timer F expired", Some(TransactionTimer::E))
            }
            (Completed, ClientNonInviteEvent::TimerFired(TransactionTimer::K)) => {
                self.terminate("Timer K expired", None)
            }
            (_, ClientNonInviteEvent::TransportError) => self.terminate("transport error", None),
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<ClientNonInviteAction> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        let mut actions = vec![ClientNonInviteAction::Transmit {
            bytes,
            retransmit: false,
        }];
        if self.timers.should_retransmit() {
            actions.push(ClientNonInviteAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            });
        }
        actions.push(ClientNonInviteAction::Schedule {
            timer: TransactionTimer::F,
            duration: self.timers.duration(TransactionTimer::F),
        });
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientNonInviteAction> {
        self.state = ClientNonInviteState::Proceeding;
        // In Proceeding the retransmit interval pins to T2 (§17.1.2.2).
        self.e_interval = self.timers.t2();
        vec![ClientNonInviteAction::Deliver(response)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientNonInviteAction> {
        self.state = ClientNonInviteState::Completed;
        vec![
            ClientNonInviteAction::Deliver(response),
            ClientNonInviteAction::CancelTimer(TransactionTimer::E),
            ClientNonInviteAction::CancelTimer(TransactionTimer::F),
            ClientNonInviteAction::Schedule {
                timer: TransactionTimer::K,
                duration: self.timers.duration(TransactionTimer::K),
            },
        ]
    }

    fn handle_timer_e(&mut self) -> Vec<ClientNonInviteAction> {
        self.attempts += 1;
        if self.attempts >= MAX_RETRANSMITS {
            return Vec::new();
        }
        let Some(payload) = &self.last_request else {
            return Vec::new();
        };
        self.e_interval = (self.e_interval * 2).min(self.timers.t2());
        vec![
            ClientNonInviteAction::Transmit {
                bytes: payload.clone(),
                retransmit: true,
            },
            ClientNonInviteAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            },
        ]
    }

    fn terminate(
        &mut self,
        reason: &str,
        cancel: Option<TransactionTimer>,
    ) -> Vec<ClientNonInviteAction> {
        if matches!(self.state, ClientNonInviteState::Terminated) {
            return Vec::new();
        }
        self.state = ClientNonInviteState::Terminated;
        let mut actions = Vec::new();
        if let Some(timer) = cancel {
            actions.push(ClientNonInviteAction::CancelTimer(timer));
        }
        actions.push(ClientNonInviteAction::Terminate {
            reason: SmolStr::new(reason),
        });
        actions
    }
}

/// Events that drive the server non-INVITE machine (RFC 3261 §17.2.2).
#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    ReceiveRequest(Request),
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the non-INVITE server machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNonInviteAction {
    Transmit { bytes: Bytes, retransmit: bool },
    Schedule { timer: TransactionTimer, duration: Duration },
    CancelTimer(TransactionTimer),
    Terminate { reason: SmolStr },
}

/// Implements RFC 3261 Figure 8 (server non-INVITE).
pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    timers: TransportAwareTimers,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<ServerNonInviteAction> {
        use ServerNonInviteState::*;
        match (&self.state, event) {
            (Trying, ServerNonInviteEvent::ReceiveRequest(_)) => Vec::new(),
            (Trying | Proceeding, ServerNonInviteEvent::SendProvisional(resp)) => {
                self.send_provisional(resp)
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(resp)) => self.send_final(resp),
            (Completed, ServerNonInviteEvent::TimerFired(TransactionTimer::J)) => {
                self.terminate("Timer J expired")
            }
            (_, ServerNonInviteEvent::TransportError) => self.terminate("transport error"),
            _ => Vec::new(),
        }
    }

    /// Replays the buffered response for a duplicate request.
    pub fn on_retransmit(&self) -> Vec<ServerNonInviteAction> {
        let bytes = match self.state {
            ServerNonInviteState::Proceeding => self.last_provisional.clone(),
            ServerNonInviteState::Completed => self.last_final.clone(),
            _ => None,
        };
        match bytes {
            Some(bytes) => vec![ServerNonInviteAction::Transmit {
                bytes,
                retransmit: true,
            }],
            None => Vec::new(),
        }
    }

    fn send_provisional(&mut self, response: Response) -> Vec<ServerNonInviteAction> {
        self.state = ServerNonInviteState::Proceeding;
        let bytes = serialize_response(&response);
        self.last_provisional = Some(bytes.clone());
        vec![ServerNonInviteAction::Transmit {
            bytes,
            retransmit: false,
        }]
    }

    fn send_final(&mut self, response: Response) -> Vec<ServerNonInviteAction> {
        self.state = ServerNonInviteState::Completed;
        let bytes = serialize_response(&response);
        self.last_final = Some(bytes.clone());
        vec![
            ServerNonInviteAction::Transmit {
                bytes,
                retransmit: false,
            },
            ServerNonInviteAction::Schedule {
                timer: TransactionTimer::J,
                duration: self.timers.duration(TransactionTimer::J),
            },
        ]
    }

    fn terminate(&mut self, reason: &str) -> Vec<ServerNonInviteAction> {
        if matches!(self.state, ServerNonInviteState::Terminated) {
            return Vec::new();
        }
        self.state = ServerNonInviteState::Terminated;
        vec![
            ServerNonInviteAction::CancelTimer(TransactionTimer::J),
            ServerNonInviteAction::Terminate {
                reason: SmolStr::new(reason),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;
    use bytes::Bytes;
    use sip_core::{CSeq, Header, Method, NameAddr, SipUri, Via};

    fn udp_timers() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Udp)
    }

    fn tcp_timers() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Tcp)
    }

    fn sample_request(method: Method) -> Request {
        let mut header = Header::new();
        let mut via = Via::new("UDP", "client.example.com", Some(5060));
        via.branch = Some(SmolStr::new("z9hG4bKfsm"));
        header.push_via(via);
        header.from = Some(NameAddr::parse("<sip:alice@example.com>;tag=1").unwrap());
        header.to = Some(NameAddr::parse("<sip:bob@example.com>").unwrap());
        header.call_id = Some(SmolStr::new("fsm@test"));
        header.cseq = Some(CSeq::new(1, method.clone()));
        Request::new(
            method,
            SipUri::parse("sip:bob@example.com").unwrap(),
            header,
            Bytes::new(),
        )
    }

    fn sample_response(status: u16) -> Response {
        Response::for_request(status, "Test", &sample_request(Method::Invite))
    }

    #[test]
    fn client_invite_2xx_terminates_without_ack() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_request(Method::Invite)));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(200)));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Deliver(_))));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::GenerateAck(_))));
    }

    #[test]
    fn client_invite_non2xx_generates_ack_and_timer_d() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_request(Method::Invite)));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(603)));
        assert_eq!(fsm.state, ClientInviteState::Completed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::GenerateAck(_))));
        assert!(actions.iter().any(|a| matches!(
            a,
            ClientInviteAction::Schedule {
                timer: TransactionTimer::D,
                duration
            } if *duration == Duration::from_secs(32)
        )));

        // Retransmitted final in Completed triggers a re-ACK.
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(603)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::RetransmitAck)));

        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::D));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Terminate { .. })));
    }

    #[test]
    fn client_invite_timer_a_backs_off_capped_at_t2() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_request(Method::Invite)));
        let mut intervals = Vec::new();
        for _ in 0..6 {
            let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::A));
            for action in actions {
                if let ClientInviteAction::Schedule {
                    timer: TransactionTimer::A,
                    duration,
                } = action
                {
                    intervals.push(duration);
                }
            }
        }
        // Non-decreasing and capped at T2.
        for pair in intervals.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(*intervals.last().unwrap(), Duration::from_secs(4));
    }

    #[test]
    fn client_invite_stops_retransmitting_after_cap() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_request(Method::Invite)));
        let mut transmissions = 0;
        for _ in 0..MAX_RETRANSMITS + 5 {
            let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::A));
            transmissions += actions
                .iter()
                .filter(|a| matches!(a, ClientInviteAction::Transmit { .. }))
                .count();
        }
        assert!(transmissions < MAX_RETRANSMITS as usize);
    }

    #[test]
    fn client_invite_reliable_transport_schedules_no_timer_a() {
        let mut fsm = ClientInviteFsm::new(tcp_timers());
        let actions = fsm.on_event(ClientInviteEvent::SendInvite(sample_request(Method::Invite)));
        assert!(!actions.iter().any(|a| matches!(
            a,
            ClientInviteAction::Schedule {
                timer: TransactionTimer::A,
                ..
            }
        )));
    }

    #[test]
    fn client_invite_timer_b_times_out() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_request(Method::Invite)));
        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::B));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.iter().any(
            |a| matches!(a, ClientInviteAction::Terminate { reason } if reason.contains("Timer B"))
        ));
    }

    #[test]
    fn server_invite_non2xx_waits_for_ack() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_request(Method::Invite)));
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        assert_eq!(fsm.state, ServerInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerInviteAction::Schedule {
                timer: TransactionTimer::G,
                ..
            }
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerInviteAction::Schedule {
                timer: TransactionTimer::H,
                ..
            }
        )));

        let actions = fsm.on_event(ServerInviteEvent::ReceiveAck);
        assert_eq!(fsm.state, ServerInviteState::Confirmed);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerInviteAction::Schedule {
                timer: TransactionTimer::I,
                ..
            }
        )));

        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TransactionTimer::I));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerInviteAction::Terminate { .. })));
    }

    #[test]
    fn server_invite_retransmits_identical_final() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_request(Method::Invite)));
        fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        let first = fsm.on_event(ServerInviteEvent::TimerFired(TransactionTimer::G));
        let second = fsm.on_event(ServerInviteEvent::TimerFired(TransactionTimer::G));
        let payload = |actions: &[ServerInviteAction]| {
            actions.iter().find_map(|a| match a {
                ServerInviteAction::Transmit { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
        };
        let a = payload(&first).expect("first retransmit");
        let b = payload(&second).expect("second retransmit");
        // At-most-once final response: retransmits are byte-identical.
        assert_eq!(a, b);
    }

    #[test]
    fn server_invite_replays_provisional_for_duplicate_invite() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_request(Method::Invite)));
        assert!(fsm.on_retransmit().is_empty());
        fsm.on_event(ServerInviteEvent::SendProvisional(sample_response(180)));
        let actions = fsm.on_retransmit();
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerInviteAction::Transmit { retransmit: true, .. })));
    }

    #[test]
    fn server_invite_timer_h_gives_up_without_ack() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_request(Method::Invite)));
        fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TransactionTimer::H));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions.iter().any(
            |a| matches!(a, ServerInviteAction::Terminate { reason } if reason.contains("Timer H"))
        ));
    }

    #[test]
    fn server_invite_2xx_terminates_immediately() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_request(Method::Invite)));
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerInviteAction::Transmit { .. })));
    }

    #[test]
    fn client_non_invite_full_path() {
        let mut fsm = ClientNonInviteFsm::new(udp_timers());
        let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(
            Method::Options,
        )));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientNonInviteAction::Transmit { .. })));

        fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(sample_response(100)));
        assert_eq!(fsm.state, ClientNonInviteState::Proceeding);

        let actions = fsm.on_event(ClientNonInviteEvent::ReceiveFinal(sample_response(200)));
        assert_eq!(fsm.state, ClientNonInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(
            a,
            ClientNonInviteAction::Schedule {
                timer: TransactionTimer::K,
                ..
            }
        )));

        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::K));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientNonInviteAction::Terminate { .. })));
    }

    #[test]
    fn client_non_invite_retransmit_intervals_monotonic_and_capped() {
        let mut fsm = ClientNonInviteFsm::new(udp_timers());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(Method::Options)));
        let mut intervals = Vec::new();
        for _ in 0..6 {
            for action in fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::E)) {
                if let ClientNonInviteAction::Schedule {
                    timer: TransactionTimer::E,
                    duration,
                } = action
                {
                    intervals.push(duration);
                }
            }
        }
        for pair in intervals.windows(2) {
            assert!(pair[0] <= pair[1], "intervals must be non-decreasing");
        }
        assert!(intervals.iter().all(|d| *d <= Duration::from_secs(4)));
    }

    #[test]
    fn client_non_invite_timer_f_times_out() {
        let mut fsm = ClientNonInviteFsm::new(udp_timers());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(Method::Options)));
        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::F));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientNonInviteAction::Terminate { .. })));
    }

    #[test]
    fn server_non_invite_buffers_and_replays_final() {
        let mut fsm = ServerNonInviteFsm::new(udp_timers());
        fsm.on_event(ServerNonInviteEvent::ReceiveRequest(sample_request(
            Method::Options,
        )));
        fsm.on_event(ServerNonInviteEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state, ServerNonInviteState::Completed);

        let first = fsm.on_retransmit();
        let second = fsm.on_retransmit();
        assert_eq!(first, second);
        assert!(first
            .iter()
            .any(|a| matches!(a, ServerNonInviteAction::Transmit { retransmit: true, .. })));

        let actions = fsm.on_event(ServerNonInviteEvent::TimerFired(TransactionTimer::J));
        assert_eq!(fsm.state, ServerNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerNonInviteAction::Terminate { .. })));
    }

    #[test]
    fn transport_error_terminates_all_machines() {
        let mut ci = ClientInviteFsm::new(udp_timers());
        ci.on_event(ClientInviteEvent::TransportError);
        assert_eq!(ci.state, ClientInviteState::Terminated);

        let mut si = ServerInviteFsm::new(udp_timers());
        si.on_event(ServerInviteEvent::TransportError);
        assert_eq!(si.state, ServerInviteState::Terminated);

        let mut cn = ClientNonInviteFsm::new(udp_timers());
        cn.on_event(ClientNonInviteEvent::TransportError);
        assert_eq!(cn.state, ClientNonInviteState::Terminated);

        let mut sn = ServerNonInviteFsm::new(udp_timers());
        sn.on_event(ServerNonInviteEvent::TransportError);
        assert_eq!(sn.state, ServerNonInviteState::Terminated);
    }
}
