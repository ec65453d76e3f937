#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_parse::parse_request;

fuzz_target!(|data: &[u8]| {
    // Ignore obviously tiny payloads.
    if data.len() < 4 {
        return;
    }
    let _ = parse_request(data);
});
