// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_parse::{parse_request, serialize_request};

fuzz_target!(|data: &[u8]| {
    if data.len() < 16 || data.len() > 2048 {
        return;
    }

    // Whatever parses must serialize and re-parse without panicking, and
    // key fields must survive the trip.
    if let Ok(request) = parse_request(data) {
        let serialized = serialize_request(&request);
        if let Ok(reparsed) = parse_request(&serialized) {
            assert_eq!(request.method, reparsed.method);
            assert_eq!(request.uri, reparsed.uri);
            assert_eq!(request.body.len(), reparsed.body.len());
        }
    }
});
