// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Route-header preprocessing on receive (RFC 3261 §12.2.1.1 / §16.4).
//!
//! Three fixups run before a request is dispatched:
//! 1. The previous hop was a strict router (our URI with `lr` landed in the
//!    Request-URI): the bottom Route entry is popped back into the
//!    Request-URI.
//! 2. A top Route naming this stack is consumed into `received_route`.
//! 3. The next hop is a strict router (top Route without `lr`): the top
//!    Route is swapped into the Request-URI and the old Request-URI pushed
//!    to the bottom of the Route set.
//!
//! With no Route headers present, all of this is a no-op.

use sip_core::{NameAddr, Request, SipUri};

/// What preprocessing extracted from the request.
#[derive(Debug, Default)]
pub struct RoutePreprocess {
    /// The Route entry addressed to this stack, popped off the set.
    pub received_route: Vec<NameAddr>,
}

/// Applies §16.4 route fixups in place. `is_ours` decides whether a URI
/// names one of this stack's endpoints (wildcard-bound channels must match
/// any machine-local address).
pub fn preprocess_request(
    request: &mut Request,
    is_ours: impl Fn(&SipUri) -> bool,
) -> RoutePreprocess {
    let mut outcome = RoutePreprocess::default();

    // 1. Strict router behind us: it consumed the Request-URI and our URI
    //    (with lr) sits there now. Restore the real target from the bottom
    //    Route entry.
    if request.uri.is_loose_router() && is_ours(&request.uri) {
        if let Some(last) = request.header.routes.pop() {
            request.uri = last.uri;
        }
    }

    // 2. Top Route addressed to us: consume it.
    if let Some(top) = request.header.routes.first() {
        if is_ours(&top.uri) {
            outcome.received_route.push(request.header.routes.remove(0));
        }
    }

    // 3. Strict router ahead: swap the top Route into the Request-URI and
    //    park the old Request-URI at the bottom of the set.
    if let Some(top) = request.header.routes.first() {
        if !top.is_loose_router() {
            let strict_hop = request.header.routes.remove(0);
            let old_uri = std::mem::replace(&mut request.uri, strict_hop.uri);
            request
                .header
                .routes
                .push(NameAddr::from_uri(old_uri));
        }
    }

    outcome
}
