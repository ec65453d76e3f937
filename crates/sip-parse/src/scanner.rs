// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tolerant stream scanner for TCP/TLS framing.
//!
//! A stream connection delivers arbitrary fragments; the scanner accumulates
//! them and yields complete SIP messages delimited by CRLF-CRLF plus exactly
//! `Content-Length` body bytes. Partial buffers are retained until the next
//! read. Leading CRLF keep-alives are consumed and counted, never surfaced.

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

/// Maximum size of SIP headers before \r\n\r\n. Typical SIP messages carry
/// 2-4 KB of headers; the limit bounds peers that never send the separator.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum body size the scanner will wait for.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Framing faults. Each one is fatal for the connection: once the byte
/// stream desynchronizes there is no way to find the next message boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    HeadersTooLarge { limit: usize },
    BodyTooLarge { declared: usize, limit: usize },
    BadContentLength,
    ConflictingContentLength,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::HeadersTooLarge { limit } => {
                write!(f, "SIP headers exceed {} bytes", limit)
            }
            ScanError::BodyTooLarge { declared, limit } => {
                write!(f, "Content-Length {} exceeds {} byte limit", declared, limit)
            }
            ScanError::BadContentLength => write!(f, "unparseable Content-Length"),
            ScanError::ConflictingContentLength => {
                write!(f, "multiple Content-Length headers with different values")
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// Accumulating frame scanner, one per stream connection.
#[derive(Debug, Default)]
pub struct StreamScanner {
    buf: BytesMut,
}

impl StreamScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes awaiting a complete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends newly received bytes and drains every complete message.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, ScanError> {
        self.buf.extend_from_slice(data);
        self.drain()
    }

    fn drain(&mut self) -> Result<Vec<Bytes>, ScanError> {
        let mut frames = Vec::new();
        loop {
            // CRLF keep-alive pings (RFC 5626) between messages.
            consume_leading_crlf(&mut self.buf);
            if self.buf.is_empty() {
                break;
            }

            let head_end = match memchr::memmem::find(self.buf.as_ref(), b"\r\n\r\n") {
                Some(pos) => pos,
                None => {
                    if self.buf.len() > MAX_HEADER_SIZE {
                        return Err(ScanError::HeadersTooLarge {
                            limit: MAX_HEADER_SIZE,
                        });
                    }
                    break;
                }
            };
            if head_end > MAX_HEADER_SIZE {
                return Err(ScanError::HeadersTooLarge {
                    limit: MAX_HEADER_SIZE,
                });
            }

            // RFC 3261 §18.3: Content-Length is mandatory on streams. A
            // missing header is treated as a zero-length body rather than
            // desynchronizing the connection.
            let body_length = parse_content_length(&self.buf[..head_end])?.unwrap_or(0);
            if body_length > MAX_BODY_SIZE {
                return Err(ScanError::BodyTooLarge {
                    declared: body_length,
                    limit: MAX_BODY_SIZE,
                });
            }

            let needed = head_end + 4 + body_length;
            if self.buf.len() < needed {
                break;
            }
            frames.push(self.buf.split_to(needed).freeze());
        }
        Ok(frames)
    }
}

fn consume_leading_crlf(buf: &mut BytesMut) {
    while buf.first().is_some_and(|b| *b == b'\r' || *b == b'\n') {
        // Stop at "\r\n\r..." only if it is not the start of a message; a
        // lone CR/LF run can never begin a valid start line, so it is safe
        // to discard byte by byte.
        buf.advance(1);
    }
}

/// Scans header bytes for Content-Length (including the compact form `l`)
/// without requiring the whole head to be valid UTF-8.
fn parse_content_length(headers: &[u8]) -> Result<Option<usize>, ScanError> {
    let mut found: Option<usize> = None;
    for line in headers.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = memchr::memchr(b':', line) else {
            continue;
        };
        let name = trim_ascii(&line[..colon]);
        if !eq_ignore_case(name, b"content-length") && !eq_ignore_case(name, b"l") {
            continue;
        }
        let value = trim_ascii(&line[colon + 1..]);
        let parsed = parse_ascii_usize(value).ok_or(ScanError::BadContentLength)?;
        match found {
            Some(existing) if existing != parsed => {
                return Err(ScanError::ConflictingContentLength)
            }
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

fn trim_ascii(input: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = input.len();
    while start < end && input[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && input[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &input[start..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

fn parse_ascii_usize(value: &[u8]) -> Option<usize> {
    if value.is_empty() {
        return None;
    }
    let mut acc: usize = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return None;
        }
        acc = acc
            .checked_mul(10)?
            .checked_add((b - b'0') as usize)?;
    }
    Some(acc)
}
