// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types for the Ferrite signaling stack.
//!
//! This crate provides the data model shared by the codec, transport, and
//! transaction layers:
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **URIs**: [`SipUri`] (sip/sips/tel) with loose-routing and placeholder
//!   detection
//! - **Headers**: the typed [`Header`] envelope plus an insertion-ordered
//!   unknown-header bag
//! - **Via**: [`Via`] with first-class `branch`/`received`/`rport` handling
//! - **Methods**: [`Method`] enum (INVITE, REGISTER, SUBSCRIBE, etc.)
//!
//! All types are designed for cheap cloning, using [`SmolStr`](smol_str::SmolStr)
//! and [`Bytes`](bytes::Bytes) for string and binary data.
//!
//! # Examples
//!
//! ```
//! # use sip_core::*;
//! let uri = SipUri::parse("sip:alice@example.com;lr").unwrap();
//! assert!(uri.is_loose_router());
//! ```

pub mod encoding;
pub mod error;
pub mod header;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod uri;
pub mod via;

pub use encoding::TextEncoding;
pub use error::{ParseError, ParseField};
pub use header::{CSeq, Header};
pub use method::Method;
pub use msg::{Request, Response, SipMessage};
pub use name_addr::NameAddr;
pub use uri::{Scheme, SipUri};
pub use via::{Rport, Via, MAGIC_COOKIE};
