// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 transaction layer: the four state machines (§17), transport-aware
//! timers, and the matching engine that pairs inbound messages with extant
//! transactions.
//!
//! The state machines in [`fsm`] are pure (events in, actions out) and the
//! [`engine::TransactionEngine`] owns the tables, timers, and wire I/O
//! delegation. The transport hands every parsed message to the engine first;
//! only unmatched traffic surfaces to the application.

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{Request, Via, MAGIC_COOKIE};
use smol_str::SmolStr;

pub mod engine;
pub mod fsm;
pub mod key;
pub mod timers;

pub use engine::{
    EngineConfig, EngineError, RequestDisposition, ServerTransactionHandle, TransactionEngine,
    TransactionUser, TransportContext, TransportDispatcher,
};
pub use fsm::{
    ClientInviteAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteAction,
    ClientNonInviteEvent, ClientNonInviteFsm, ServerInviteAction, ServerInviteEvent,
    ServerInviteFsm, ServerNonInviteAction, ServerNonInviteEvent, ServerNonInviteFsm,
};
pub use key::TransactionId;
pub use timers::{TimerDefaults, Transport, TransportAwareTimers};

/// Timers referenced by the SIP transaction state machines (RFC 3261 §17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Returns the branch token from a request's top Via.
pub fn request_branch(req: &Request) -> Option<&SmolStr> {
    req.header.branch()
}

/// Returns `true` when the top Via carries an RFC 3261 magic-cookie branch.
pub fn has_rfc3261_branch(via: &Via) -> bool {
    via.has_rfc3261_branch()
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", MAGIC_COOKIE, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_branch_has_magic_cookie() {
        let branch = generate_branch_id();
        assert!(branch.starts_with(MAGIC_COOKIE));
        assert!(branch.len() > MAGIC_COOKIE.len());
    }

    #[test]
    fn generated_branches_are_unique() {
        assert_ne!(generate_branch_id(), generate_branch_id());
    }
}
