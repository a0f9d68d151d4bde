//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The 24-bit field of RTCP report blocks (cumulative loss) and transport-cc feedback
//! (reference time).

const U24_MASK: u32 = 0x00FF_FFFF;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct U24(u32);

impl U24 {
    pub const SIZE: usize = 3;
    pub const ZERO: U24 = U24(0);

    /// Keeps the low 24 bits; the transport-cc reference time wraps.
    pub fn truncate(value: u32) -> Self {
        Self(value & U24_MASK)
    }

    /// Cumulative loss sticks at the maximum instead.
    pub fn saturating_from(value: u64) -> Self {
        Self(value.min(U24_MASK as u64) as u32)
    }

    pub fn from_be_bytes([high, middle, low]: [u8; Self::SIZE]) -> Self {
        Self(u32::from_be_bytes([0, high, middle, low]))
    }
}

impl From<U24> for u32 {
    fn from(value: U24) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::U24;

    #[test]
    fn wraps_or_saturates() {
        assert_eq!(U24(0x34_5678), U24::truncate(0x1234_5678));
        assert_eq!(U24(0xFF_FFFF), U24::saturating_from(u64::MAX));
        assert_eq!(U24(7), U24::saturating_from(7));
        assert_eq!(0x01_0203u32, U24::from_be_bytes(hex!("010203")).into());
    }
}
