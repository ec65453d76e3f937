// ferrite-sip - The Ferrite SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed STUN attributes (RFC 5389 §15, RFC 8445 §7.1, RFC 5766 §14).
//!
//! Each attribute is `type:2 | length:2 | value:length | padding-to-4`.
//! XOR-prefixed addresses are obfuscated with the magic cookie (port and
//! IPv4) plus the transaction ID (IPv6), per RFC 5389 §15.2.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use smol_str::SmolStr;

use crate::{pad4, StunError, MAGIC_COOKIE};

// RFC 5389 comprehension-required range.
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
// RFC 5766 (TURN).
pub const ATTR_CHANNEL_NUMBER: u16 = 0x000C;
pub const ATTR_LIFETIME: u16 = 0x000D;
pub const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
pub const ATTR_DATA: u16 = 0x0013;
pub const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const ATTR_EVEN_PORT: u16 = 0x0018;
pub const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
pub const ATTR_DONT_FRAGMENT: u16 = 0x001A;
pub const ATTR_RESERVATION_TOKEN: u16 = 0x0022;
// RFC 8445 (ICE).
pub const ATTR_PRIORITY: u16 = 0x0024;
pub const ATTR_USE_CANDIDATE: u16 = 0x0025;
// Comprehension-optional range.
pub const ATTR_FINGERPRINT: u16 = 0x8028;
pub const ATTR_ICE_CONTROLLED: u16 = 0x8029;
pub const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// A typed STUN attribute; unrecognized types are preserved raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    Username(SmolStr),
    ErrorCode { code: u16, reason: SmolStr },
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    Priority(u32),
    UseCandidate,
    IceControlled(u64),
    IceControlling(u64),
    ChannelNumber(u16),
    Lifetime(u32),
    XorPeerAddress(SocketAddr),
    Data(Bytes),
    XorRelayedAddress(SocketAddr),
    RequestedTransport(u8),
    EvenPort(bool),
    DontFragment,
    ReservationToken([u8; 8]),
    Unknown { attr_type: u16, value: Bytes },
}

impl StunAttribute {
    /// Decodes one attribute value. `transaction_id` is needed to un-XOR
    /// IPv6 addresses.
    pub fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &[u8; 12],
    ) -> Result<Self, StunError> {
        let bad = || StunError::BadAttribute { attr_type };
        match attr_type {
            ATTR_MAPPED_ADDRESS => Ok(StunAttribute::MappedAddress(decode_address(value, None)
                .ok_or_else(bad)?)),
            ATTR_XOR_MAPPED_ADDRESS => Ok(StunAttribute::XorMappedAddress(
                decode_address(value, Some(transaction_id)).ok_or_else(bad)?,
            )),
            ATTR_XOR_PEER_ADDRESS => Ok(StunAttribute::XorPeerAddress(
                decode_address(value, Some(transaction_id)).ok_or_else(bad)?,
            )),
            ATTR_XOR_RELAYED_ADDRESS => Ok(StunAttribute::XorRelayedAddress(
                decode_address(value, Some(transaction_id)).ok_or_else(bad)?,
            )),
            ATTR_USERNAME => {
                let s = std::str::from_utf8(value).map_err(|_| bad())?;
                Ok(StunAttribute::Username(SmolStr::new(s)))
            }
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(bad());
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                let reason = std::str::from_utf8(&value[4..]).map_err(|_| bad())?;
                Ok(StunAttribute::ErrorCode {
                    code: class * 100 + number,
                    reason: SmolStr::new(reason),
                })
            }
            ATTR_MESSAGE_INTEGRITY => {
                let digest: [u8; 20] = value.try_into().map_err(|_| bad())?;
                Ok(StunAttribute::MessageIntegrity(digest))
            }
            ATTR_FINGERPRINT => {
                let crc: [u8; 4] = value.try_into().map_err(|_| bad())?;
                Ok(StunAttribute::Fingerprint(u32::from_be_bytes(crc)))
            }
            ATTR_PRIORITY => {
                let v: [u8; 4] = value.try_into().map_err(|_| bad())?;
                Ok(StunAttribute::Priority(u32::from_be_bytes(v)))
            }
            ATTR_USE_CANDIDATE => {
                if value.is_empty() {
                    Ok(StunAttribute::UseCandidate)
                } else {
                    Err(bad())
                }
            }
            ATTR_ICE_CONTROLLED => {
                let v: [u8; 8] = value.try_into().map_err(|_| bad())?;
                Ok(StunAttribute::IceControlled(u64::from_be_bytes(v)))
            }
            ATTR_ICE_CONTROLLING => {
                let v: [u8; 8] = value.try_into().map_err(|_| bad())?;
                Ok(StunAttribute::IceControlling(u64::from_be_bytes(v)))
            }
            ATTR_CHANNEL_NUMBER => {
                if value.len() != 4 {
                    return Err(bad());
                }
                Ok(StunAttribute::ChannelNumber(u16::from_be_bytes([
                    value[0], value[1],
                ])))
            }
            ATTR_LIFETIME => {
                let v: [u8; 4] = value.try_into().map_err(|_| bad())?;
                Ok(StunAttribute::Lifetime(u32::from_be_bytes(v)))
            }
            ATTR_DATA => Ok(StunAttribute::Data(Bytes::copy_from_slice(value))),
            ATTR_REQUESTED_TRANSPORT => {
                if value.len() != 4 {
                    return Err(bad());
                }
                Ok(StunAttribute::RequestedTransport(value[0]))
            }
            ATTR_EVEN_PORT => {
                if value.len() != 1 {
                    return Err(bad());
                }
                Ok(StunAttribute::EvenPort(value[0] & 0x80 != 0))
            }
            ATTR_DONT_FRAGMENT => {
                if value.is_empty() {
                    Ok(StunAttribute::DontFragment)
                } else {
                    Err(bad())
                }
            }
            ATTR_RESERVATION_TOKEN => {
                let token: [u8; 8] = value.try_into().map_err(|_| bad())?;
                Ok(StunAttribute::ReservationToken(token))
            }
            _ => Ok(StunAttribute::Unknown {
                attr_type,
                value: Bytes::copy_from_slice(value),
            }),
        }
    }

    /// Appends this attribute (header, value, padding) to `out`.
    pub fn encode(&self, out: &mut BytesMut, transaction_id: &[u8; 12]) {
        match self {
            StunAttribute::MappedAddress(addr) => {
                let value = encode_address(*addr, None);
                put_attr(out, ATTR_MAPPED_ADDRESS, &value);
            }
            StunAttribute::XorMappedAddress(addr) => {
                let value = encode_address(*addr, Some(transaction_id));
                put_attr(out, ATTR_XOR_MAPPED_ADDRESS, &value);
            }
            StunAttribute::XorPeerAddress(addr) => {
                let value = encode_address(*addr, Some(transaction_id));
                put_attr(out, ATTR_XOR_PEER_ADDRESS, &value);
            }
            StunAttribute::XorRelayedAddress(addr) => {
                let value = encode_address(*addr, Some(transaction_id));
                put_attr(out, ATTR_XOR_RELAYED_ADDRESS, &value);
            }
            StunAttribute::Username(name) => put_attr(out, ATTR_USERNAME, name.as_bytes()),
            StunAttribute::ErrorCode { code, reason } => {
                let mut value = Vec::with_capacity(4 + reason.len());
                value.push(0);
                value.push(0);
                value.push((code / 100) as u8);
                value.push((code % 100) as u8);
                value.extend_from_slice(reason.as_bytes());
                put_attr(out, ATTR_ERROR_CODE, &value);
            }
            StunAttribute::MessageIntegrity(digest) => {
                put_attr(out, ATTR_MESSAGE_INTEGRITY, digest)
            }
            StunAttribute::Fingerprint(crc) => {
                put_attr(out, ATTR_FINGERPRINT, &crc.to_be_bytes())
            }
            StunAttribute::Priority(p) => put_attr(out, ATTR_PRIORITY, &p.to_be_bytes()),
            StunAttribute::UseCandidate => put_attr(out, ATTR_USE_CANDIDATE, &[]),
            StunAttribute::IceControlled(tiebreak) => {
                put_attr(out, ATTR_ICE_CONTROLLED, &tiebreak.to_be_bytes())
            }
            StunAttribute::IceControlling(tiebreak) => {
                put_attr(out, ATTR_ICE_CONTROLLING, &tiebreak.to_be_bytes())
            }
            StunAttribute::ChannelNumber(n) => {
                let mut value = [0u8; 4];
                value[..2].copy_from_slice(&n.to_be_bytes());
                put_attr(out, ATTR_CHANNEL_NUMBER, &value);
            }
            StunAttribute::Lifetime(seconds) => {
                put_attr(out, ATTR_LIFETIME, &seconds.to_be_bytes())
            }
            StunAttribute::Data(data) => put_attr(out, ATTR_DATA, data),
            StunAttribute::RequestedTransport(proto) => {
                put_attr(out, ATTR_REQUESTED_TRANSPORT, &[*proto, 0, 0, 0])
            }
            StunAttribute::EvenPort(reserve) => {
                put_attr(out, ATTR_EVEN_PORT, &[if *reserve { 0x80 } else { 0 }])
            }
            StunAttribute::DontFragment => put_attr(out, ATTR_DONT_FRAGMENT, &[]),
            StunAttribute::ReservationToken(token) => {
                put_attr(out, ATTR_RESERVATION_TOKEN, token)
            }
            StunAttribute::Unknown { attr_type, value } => put_attr(out, *attr_type, value),
        }
    }
}

fn put_attr(out: &mut BytesMut, attr_type: u16, value: &[u8]) {
    out.put_u16(attr_type);
    out.put_u16(value.len() as u16);
    out.put_slice(value);
    out.put_bytes(0, pad4(value.len()));
}

/// Encodes an address value, XORing with the cookie/transaction ID when
/// `transaction_id` is provided.
fn encode_address(addr: SocketAddr, transaction_id: Option<&[u8; 12]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.push(0);
    let port = match transaction_id {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.insert(1, FAMILY_IPV4);
            out.extend_from_slice(&port.to_be_bytes());
            let bits = match transaction_id {
                Some(_) => u32::from(ip) ^ MAGIC_COOKIE,
                None => u32::from(ip),
            };
            out.extend_from_slice(&bits.to_be_bytes());
        }
        IpAddr::V6(ip) => {
            out.insert(1, FAMILY_IPV6);
            out.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if let Some(tid) = transaction_id {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(tid);
                for (o, m) in octets.iter_mut().zip(mask) {
                    *o ^= m;
                }
            }
            out.extend_from_slice(&octets);
        }
    }
    out
}

/// Decodes an address value, un-XORing when `transaction_id` is provided.
fn decode_address(value: &[u8], transaction_id: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = match transaction_id {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };
    match family {
        FAMILY_IPV4 => {
            if value.len() != 8 {
                return None;
            }
            let bits = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let bits = match transaction_id {
                Some(_) => bits ^ MAGIC_COOKIE,
                None => bits,
            };
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(bits)), port))
        }
        FAMILY_IPV6 => {
            if value.len() != 20 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(tid) = transaction_id {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(tid);
                for (o, m) in octets.iter_mut().zip(mask) {
                    *o ^= m;
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}
