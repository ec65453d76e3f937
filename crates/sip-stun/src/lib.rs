// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! STUN message codec for traffic multiplexed on SIP sockets.
//!
//! Implements enough of RFC 5389 (STUN), RFC 8445 (ICE), and RFC 5766/6156
//! (TURN, including IPv6 relays) for the signaling transport to demultiplex
//! and answer NAT keep-alive and connectivity-check traffic arriving on the
//! same sockets as SIP. The codec does no socket I/O: the transport detects
//! STUN with [`is_stun`] and hands raw bytes to its STUN hook.
//!
//! # Wire format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Transaction ID (96 bits)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

mod attr;

pub use attr::{StunAttribute, ATTR_FINGERPRINT, ATTR_MESSAGE_INTEGRITY};

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389 §6).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Fixed STUN header size: type + length + cookie + transaction ID.
pub const HEADER_SIZE: usize = 20;

/// FINGERPRINT XOR constant ("STUN") per RFC 5389 §15.5.
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// STUN method codes used alongside SIP.
pub const METHOD_BINDING: u16 = 0x001;
pub const METHOD_ALLOCATE: u16 = 0x003;
pub const METHOD_REFRESH: u16 = 0x004;
pub const METHOD_SEND: u16 = 0x006;
pub const METHOD_DATA: u16 = 0x007;
pub const METHOD_CREATE_PERMISSION: u16 = 0x008;
pub const METHOD_CHANNEL_BIND: u16 = 0x009;

/// Returns `true` when the datagram is STUN rather than SIP: first byte
/// `0x00`/`0x01`, at least a full header, the magic cookie at offset 4, and
/// a declared length consistent with the buffer.
pub fn is_stun(buf: &[u8]) -> bool {
    if buf.len() < HEADER_SIZE {
        return false;
    }
    if buf[0] & 0xC0 != 0 {
        return false;
    }
    if u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) != MAGIC_COOKIE {
        return false;
    }
    let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    declared % 4 == 0 && HEADER_SIZE + declared <= buf.len()
}

/// STUN message class (RFC 5389 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

/// Codec faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    Truncated,
    NotStun,
    BadAttribute { attr_type: u16 },
    IntegrityMismatch,
    FingerprintMismatch,
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StunError::Truncated => write!(f, "truncated STUN message"),
            StunError::NotStun => write!(f, "not a STUN message"),
            StunError::BadAttribute { attr_type } => {
                write!(f, "malformed attribute 0x{:04x}", attr_type)
            }
            StunError::IntegrityMismatch => write!(f, "MESSAGE-INTEGRITY mismatch"),
            StunError::FingerprintMismatch => write!(f, "FINGERPRINT mismatch"),
        }
    }
}

impl std::error::Error for StunError {}

/// A decoded STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub class: MessageClass,
    pub method: u16,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Creates a message with a fresh random transaction ID.
    pub fn new(class: MessageClass, method: u16) -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Creates a response to this message (same method and transaction ID).
    pub fn response(&self, class: MessageClass) -> Self {
        Self {
            class,
            method: self.method,
            transaction_id: self.transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attr: StunAttribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// First attribute matching the predicate.
    pub fn attribute<F>(&self, pred: F) -> Option<&StunAttribute>
    where
        F: Fn(&StunAttribute) -> bool,
    {
        self.attributes.iter().find(|a| pred(a))
    }

    /// Decodes a STUN message, validating header framing.
    pub fn decode(buf: &[u8]) -> Result<Self, StunError> {
        if buf.len() < HEADER_SIZE {
            return Err(StunError::Truncated);
        }
        if !is_stun(buf) {
            return Err(StunError::NotStun);
        }
        let message_type = u16::from_be_bytes([buf[0], buf[1]]);
        let class = MessageClass::from_bits(((message_type >> 4) & 0b01) | ((message_type >> 7) & 0b10));
        let method = (message_type & 0x000F)
            | ((message_type & 0x00E0) >> 1)
            | ((message_type & 0x3E00) >> 2);
        let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        let end = HEADER_SIZE + declared;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let value_end = offset + 4 + attr_len;
            if value_end > end {
                return Err(StunError::Truncated);
            }
            let value = &buf[offset + 4..value_end];
            attributes.push(StunAttribute::decode(attr_type, value, &transaction_id)?);
            offset = value_end + pad4(attr_len);
        }

        Ok(Self {
            class,
            method,
            transaction_id,
            attributes,
        })
    }

    /// Encodes the message, computing attribute padding and header length.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        for attr in &self.attributes {
            attr.encode(&mut body, &self.transaction_id);
        }
        let mut out = BytesMut::with_capacity(HEADER_SIZE + body.len());
        out.put_u16(self.message_type());
        out.put_u16(body.len() as u16);
        out.put_u32(MAGIC_COOKIE);
        out.put_slice(&self.transaction_id);
        out.put_slice(&body);
        out.freeze()
    }

    /// Encodes and appends MESSAGE-INTEGRITY keyed with `key`, then
    /// FINGERPRINT, per RFC 5389 §15.4/§15.5.
    pub fn encode_with_integrity(&self, key: &[u8]) -> Bytes {
        let mut body = BytesMut::new();
        for attr in &self.attributes {
            attr.encode(&mut body, &self.transaction_id);
        }

        // MESSAGE-INTEGRITY is computed over the message with the header
        // length already counting the integrity attribute itself.
        let integrity_len = body.len() + 24;
        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_u16(self.message_type());
        header.put_u16(integrity_len as u16);
        header.put_u32(MAGIC_COOKIE);
        header.put_slice(&self.transaction_id);

        let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(&header);
        mac.update(&body);
        let digest = mac.finalize().into_bytes();

        body.put_u16(ATTR_MESSAGE_INTEGRITY);
        body.put_u16(20);
        body.put_slice(&digest);

        // FINGERPRINT covers everything before it, with the final length.
        let final_len = body.len() + 8;
        let mut out = BytesMut::with_capacity(HEADER_SIZE + final_len);
        out.put_u16(self.message_type());
        out.put_u16(final_len as u16);
        out.put_u32(MAGIC_COOKIE);
        out.put_slice(&self.transaction_id);
        out.put_slice(&body);

        let crc = crc32fast::hash(&out) ^ FINGERPRINT_XOR;
        out.put_u16(ATTR_FINGERPRINT);
        out.put_u16(4);
        out.put_u32(crc);
        out.freeze()
    }

    /// Verifies a trailing FINGERPRINT attribute on a raw message.
    pub fn verify_fingerprint(buf: &[u8]) -> Result<(), StunError> {
        if buf.len() < HEADER_SIZE + 8 {
            return Err(StunError::Truncated);
        }
        let fp_offset = buf.len() - 8;
        let attr_type = u16::from_be_bytes([buf[fp_offset], buf[fp_offset + 1]]);
        if attr_type != ATTR_FINGERPRINT {
            return Err(StunError::FingerprintMismatch);
        }
        let declared = u32::from_be_bytes([
            buf[fp_offset + 4],
            buf[fp_offset + 5],
            buf[fp_offset + 6],
            buf[fp_offset + 7],
        ]);
        let computed = crc32fast::hash(&buf[..fp_offset]) ^ FINGERPRINT_XOR;
        if computed == declared {
            Ok(())
        } else {
            Err(StunError::FingerprintMismatch)
        }
    }

    fn message_type(&self) -> u16 {
        let class = self.class.bits();
        let m = self.method;
        (m & 0x000F)
            | ((m & 0x0070) << 1)
            | ((m & 0x0F80) << 2)
            | ((class & 0b01) << 4)
            | ((class & 0b10) << 7)
    }
}

pub(crate) fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}
