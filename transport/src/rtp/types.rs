//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Names for the numbers in RTP headers.

pub type Ssrc = u32;
pub type PayloadType = u8;
/// Ticks per second of a track's RTP timestamps.
pub type ClockRate = u32;
pub type TruncatedTimestamp = u32;
/// As carried in the header.
pub type TruncatedSequenceNumber = u16;
/// Extended by the count of rollovers; the SRTP index only has 48 bits of it.
pub type FullSequenceNumber = u64;
