//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

/// Extends a 16-bit seqnum to the 64-bit value closest to `max`, the largest seen so far,
/// and raises `max` if the result is newer. A seqnum more than half the range behind `max`
/// has rolled over; one shortly ahead of a rollover is a late packet from the cycle before.
pub fn expand_seqnum(truncated: u16, max: &mut u64) -> u64 {
    let distance = truncated.wrapping_sub(*max as u16) as i16;
    // Going back past zero means there was no earlier cycle.
    let full = max
        .checked_add_signed(distance as i64)
        .unwrap_or(truncated as u64);
    *max = (*max).max(full);
    full
}
