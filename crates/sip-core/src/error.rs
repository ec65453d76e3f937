// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Validation errors raised by the message codec.
//!
//! Every parse failure is tagged with the header field that caused it and the
//! SIP status code the transport should answer with, so receive-path callers
//! can emit a precise 4xx without re-inspecting the raw message.

use std::fmt;

use smol_str::SmolStr;

/// The message field a validation error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseField {
    StartLine,
    From,
    To,
    CallId,
    CSeq,
    Via,
    Contact,
    Route,
    ContentLength,
    Require,
    Unknown,
}

impl ParseField {
    /// Returns the lowercase tag used in traces and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseField::StartLine => "start-line",
            ParseField::From => "from",
            ParseField::To => "to",
            ParseField::CallId => "call-id",
            ParseField::CSeq => "cseq",
            ParseField::Via => "via",
            ParseField::Contact => "contact",
            ParseField::Route => "route",
            ParseField::ContentLength => "content-length",
            ParseField::Require => "require",
            ParseField::Unknown => "unknown",
        }
    }

    /// Default SIP status code a request failing on this field maps to.
    ///
    /// 413 (oversize) and 483 (Max-Forwards exhausted) are policy statuses
    /// set explicitly by the transport via [`ParseError::with_status`].
    pub fn default_status(&self) -> u16 {
        match self {
            ParseField::Require => 420,
            _ => 400,
        }
    }
}

/// A validation error tagged with the offending field and response status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub field: ParseField,
    pub status: u16,
    pub detail: SmolStr,
}

impl ParseError {
    /// Creates an error with the field's default status mapping.
    pub fn new(field: ParseField, detail: impl Into<SmolStr>) -> Self {
        Self {
            field,
            status: field.default_status(),
            detail: detail.into(),
        }
    }

    /// Overrides the mapped status (413 oversize, 483 too many hops, 488).
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field.as_str(), self.detail)
    }
}

impl std::error::Error for ParseError {}
