//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Implementation of RTP/SRTP. See https://tools.ietf.org/html/rfc3550 and
//! https://tools.ietf.org/html/rfc7714. Assumes AES-GCM 128.

mod extension;
mod nack;
mod packet;
mod rtcp;
mod srtp;
mod stats;
mod types;

use std::ops::RangeInclusive;

pub use extension::{ExtensionKind, ExtensionMap};
pub use nack::{write_nack, Nack, NackTracker};
pub use packet::{decrypt_srtp, Extension, HeaderExtensionsProfile, Packet};
pub use rtcp::*;
pub use srtp::*;
pub use stats::{LossReport, ReceiveStats, ReceiverRtt, SendStats};
pub use types::*;

const VERSION: u8 = 2;
const RTCP_PAYLOAD_TYPES: RangeInclusive<u8> = 64..=95;
const STUN_FIRST_BYTES: RangeInclusive<u8> = 0..=3;
const DTLS_FIRST_BYTES: RangeInclusive<u8> = 20..=63;
const RTP_FIRST_BYTES: RangeInclusive<u8> = 128..=191;
const RTP_MIN_LEN: usize = 12;
const RTCP_MIN_LEN: usize = 8;

/// What a datagram arriving on the selected socket carries, going by its first bytes
/// (RFC 7983).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum DatagramKind {
    Stun,
    Dtls,
    Rtp,
    Rtcp,
    Unknown,
}

pub fn classify_datagram(datagram: &[u8]) -> DatagramKind {
    match datagram.first() {
        Some(b) if STUN_FIRST_BYTES.contains(b) => DatagramKind::Stun,
        Some(b) if DTLS_FIRST_BYTES.contains(b) => DatagramKind::Dtls,
        Some(b) if RTP_FIRST_BYTES.contains(b) => {
            if looks_like_rtcp(datagram) {
                DatagramKind::Rtcp
            } else if looks_like_rtp(datagram) {
                DatagramKind::Rtp
            } else {
                DatagramKind::Unknown
            }
        }
        _ => DatagramKind::Unknown,
    }
}

pub fn looks_like_rtp(packet: &[u8]) -> bool {
    packet.len() >= RTP_MIN_LEN
        && (packet[0] >> 6) == VERSION
        && !RTCP_PAYLOAD_TYPES.contains(&(packet[1] & 0b01111111))
}

pub fn looks_like_rtcp(packet: &[u8]) -> bool {
    packet.len() >= RTCP_MIN_LEN
        && (packet[0] >> 6) == VERSION
        && RTCP_PAYLOAD_TYPES.contains(&(packet[1] & 0b01111111))
}
