//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common functionality for rtp, rtcp, srtp and the transport.

mod counters;
mod integers;
mod key_sorted_cache;
mod serialize;
mod time;

use std::convert::TryInto;

pub use counters::*;
pub use integers::*;
pub use key_sorted_cache::*;
pub use serialize::*;
pub use time::*;

// Callers must check the length first.
pub fn parse_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes(bytes[0..2].try_into().unwrap())
}

pub fn parse_u24(bytes: &[u8]) -> U24 {
    U24::from_be_bytes(bytes[0..U24::SIZE].try_into().unwrap())
}

pub fn parse_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes[0..4].try_into().unwrap())
}

pub fn parse_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes[0..8].try_into().unwrap())
}

pub trait CheckedSplitAt {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])>;
}

impl CheckedSplitAt for [u8] {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])> {
        if self.len() < mid {
            None
        } else {
            Some(self.split_at(mid))
        }
    }
}

#[cfg(test)]
mod parse_tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn parse_big_endian() {
        let bytes = hex!("0102 0304 05");
        assert_eq!(0x0102, parse_u16(&bytes));
        assert_eq!(0x01020304, parse_u32(&bytes));
        assert_eq!(0x010203u32, parse_u24(&bytes).into());
        assert_eq!(0x030405u32, parse_u24(&bytes[2..]).into());
        assert_eq!(0x0102030405060708, parse_u64(&hex!("0102030405060708")));
    }

    #[test]
    fn checked_split_at() {
        let bytes = hex!("01020304");
        assert_eq!(
            Some((&bytes[..1], &bytes[1..])),
            bytes[..].checked_split_at(1)
        );
        assert_eq!(Some((&bytes[..], &[][..])), bytes[..].checked_split_at(4));
        assert_eq!(None, bytes[..].checked_split_at(5));
    }
}
