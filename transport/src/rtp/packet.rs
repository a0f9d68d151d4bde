//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    borrow::{Borrow, BorrowMut},
    ops::Range,
};

use log::*;
use rtc_common::{parse_u16, parse_u32, round_up_to_multiple_of, CheckedSplitAt, Writer};

use super::{
    extension::{ExtensionKind, ExtensionMap},
    srtp::*,
    types::*,
    VERSION,
};

const RTP_MIN_HEADER_LEN: usize = 12;
pub const RTP_PAYLOAD_TYPE_OFFSET: usize = 1;
const RTP_SEQNUM_RANGE: Range<usize> = 2..4;
const RTP_TIMESTAMP_RANGE: Range<usize> = 4..8;
const RTP_SSRC_RANGE: Range<usize> = 8..12;
const RTP_EXTENSIONS_HEADER_LEN: usize = 4;
const RTP_ONE_BYTE_EXTENSIONS_PROFILE: u16 = 0xBEDE;
const RTP_TWO_BYTE_EXTENSIONS_PROFILE: u16 = 0x1000;
const RTP_ONE_BYTE_MAX_ID: u8 = 14;
const RTP_ONE_BYTE_MAX_LEN: usize = 16;
const RTX_SEQNUM_LEN: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderExtensionsProfile {
    /// https://www.rfc-editor.org/rfc/rfc8285#section-4.2
    OneByte,
    /// https://www.rfc-editor.org/rfc/rfc8285#section-4.3
    TwoByte,
}

impl HeaderExtensionsProfile {
    fn from_u16(value: u16) -> Option<Self> {
        if value == RTP_ONE_BYTE_EXTENSIONS_PROFILE {
            Some(Self::OneByte)
        } else if value & 0xFFF0 == RTP_TWO_BYTE_EXTENSIONS_PROFILE {
            Some(Self::TwoByte)
        } else {
            None
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            Self::OneByte => RTP_ONE_BYTE_EXTENSIONS_PROFILE,
            Self::TwoByte => RTP_TWO_BYTE_EXTENSIONS_PROFILE,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::OneByte => 1,
            Self::TwoByte => 2,
        }
    }

    fn fits(id: u8, value: &[u8]) -> bool {
        (1..=RTP_ONE_BYTE_MAX_ID).contains(&id)
            && !value.is_empty()
            && value.len() <= RTP_ONE_BYTE_MAX_LEN
    }
}

/// An extension element; the range is relative to the serialized packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extension {
    pub id: u8,
    pub range: Range<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub marker: bool,
    pub has_padding: bool,
    pub payload_type: PayloadType,
    pub seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    pub ssrc: Ssrc,
    pub extensions_profile: Option<HeaderExtensionsProfile>,
    pub extensions: Vec<Extension>,
    // The payload start is the same as the header len.
    // Padding, if any, is still included since it may be encrypted.
    pub payload_range: Range<usize>,
}

impl Header {
    /// Parses the header of a packet without an SRTP auth tag.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        let (main_header, csrcs_extensions_payload) =
            packet.checked_split_at(RTP_MIN_HEADER_LEN)?;

        if (main_header[0] >> 6) != VERSION {
            event!("rtc.rtp.invalid.version");
            return None;
        }
        let has_padding = (main_header[0] & 0b0010_0000) > 0;
        let has_extensions = (main_header[0] & 0b0001_0000) > 0;
        let csrc_count = main_header[0] & 0b0000_1111;
        let payload_type = main_header[RTP_PAYLOAD_TYPE_OFFSET] & 0b0111_1111;
        let marker = (main_header[RTP_PAYLOAD_TYPE_OFFSET] >> 7) != 0;
        let seqnum = parse_u16(&main_header[RTP_SEQNUM_RANGE.clone()]);
        let timestamp = parse_u32(&main_header[RTP_TIMESTAMP_RANGE.clone()]);
        let ssrc = parse_u32(&main_header[RTP_SSRC_RANGE.clone()]);

        let csrcs_len = 4 * csrc_count as usize;
        let (_csrcs, extensions_payload) = csrcs_extensions_payload.checked_split_at(csrcs_len)?;

        let extensions_start = RTP_MIN_HEADER_LEN + csrcs_len;
        let mut payload_start = extensions_start;
        let mut extensions_profile = None;
        let mut extensions = Vec::new();
        if has_extensions {
            let (extensions_header, extensions_payload) =
                extensions_payload.checked_split_at(RTP_EXTENSIONS_HEADER_LEN)?;
            let profile_value = parse_u16(&extensions_header[0..2]);
            let extensions_len = (parse_u16(&extensions_header[2..4]) as usize) * 4;
            let Some(profile) = HeaderExtensionsProfile::from_u16(profile_value) else {
                event!("rtc.rtp.invalid.extensions_profile");
                debug!(
                    "Invalid RTP: not using 1-byte or 2-byte extensions; profile = 0x{:x}",
                    profile_value
                );
                return None;
            };
            let (extensions_block, _payload) = extensions_payload.checked_split_at(extensions_len)?;

            let block_start = extensions_start + RTP_EXTENSIONS_HEADER_LEN;
            let mut offset = 0;
            while offset < extensions_block.len() {
                let id = match profile {
                    HeaderExtensionsProfile::OneByte => extensions_block[offset] >> 4,
                    HeaderExtensionsProfile::TwoByte => extensions_block[offset],
                };
                if id == 0 {
                    // Padding between or after elements
                    offset += 1;
                    continue;
                }
                if profile == HeaderExtensionsProfile::OneByte && id == 15 {
                    // Reserved; the rest of the block must be ignored.
                    break;
                }
                let (element_header, value) =
                    extensions_block[offset..].checked_split_at(profile.len())?;
                let len = match profile {
                    HeaderExtensionsProfile::OneByte => ((element_header[0] & 0x0F) as usize) + 1,
                    HeaderExtensionsProfile::TwoByte => element_header[1] as usize,
                };
                if value.len() < len {
                    event!("rtc.rtp.invalid.extension_too_short");
                    debug!(
                        "Invalid RTP: extension too short: {} < {}.  ID = {}",
                        value.len(),
                        len,
                        id,
                    );
                    return None;
                }
                let value_start = block_start + offset + profile.len();
                extensions.push(Extension {
                    id,
                    range: value_start..(value_start + len),
                });
                offset += profile.len() + len;
            }
            extensions_profile = Some(profile);
            payload_start = block_start + extensions_len;
        }

        let payload_range = payload_start..packet.len();
        if has_padding && payload_range.is_empty() {
            event!("rtc.rtp.invalid.missing_padding_count");
            debug!(
                "Invalid RTP: has padding, but padding byte count is missing; packet len = {}",
                packet.len()
            );
            return None;
        }

        Some(Self {
            marker,
            has_padding,
            payload_type,
            seqnum,
            timestamp,
            ssrc,
            extensions_profile,
            extensions,
            payload_range,
        })
    }
}

/// A plaintext RTP packet backed by some buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet<T> {
    pub marker: bool,
    pub payload_type: PayloadType,
    pub seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    pub ssrc: Ssrc,
    extensions: Vec<Extension>,
    // Relative to self.serialized and excluding padding.
    payload_range: Range<usize>,
    pub padding_byte_count: u8,
    serialized: T,
}

impl<T> Packet<T> {
    pub fn into_serialized(self) -> T {
        self.serialized
    }

    pub fn header_len(&self) -> usize {
        self.payload_range.start
    }
}

impl<T: Borrow<[u8]>> Packet<T> {
    pub fn parse(serialized: T) -> Option<Self> {
        let header = Header::parse(serialized.borrow())?;
        let mut payload_range = header.payload_range;
        let mut padding_byte_count = 0;
        if header.has_padding {
            padding_byte_count = serialized.borrow()[payload_range.end - 1];
            if padding_byte_count == 0 || padding_byte_count as usize > payload_range.len() {
                event!("rtc.rtp.invalid.padding");
                debug!(
                    "Invalid RTP: padding byte count {} for payload of {} bytes",
                    padding_byte_count,
                    payload_range.len()
                );
                return None;
            }
            payload_range.end -= padding_byte_count as usize;
        }
        Some(Self {
            marker: header.marker,
            payload_type: header.payload_type,
            seqnum: header.seqnum,
            timestamp: header.timestamp,
            ssrc: header.ssrc,
            extensions: header.extensions,
            payload_range,
            padding_byte_count,
            serialized,
        })
    }

    pub fn serialized(&self) -> &[u8] {
        self.serialized.borrow()
    }

    pub fn header(&self) -> &[u8] {
        &self.serialized()[..self.payload_range.start]
    }

    pub fn payload(&self) -> &[u8] {
        &self.serialized()[self.payload_range.clone()]
    }

    pub fn size(&self) -> usize {
        self.serialized().len()
    }

    pub fn extensions(&self) -> impl Iterator<Item = (u8, &[u8])> + '_ {
        self.extensions
            .iter()
            .map(|extension| (extension.id, &self.serialized()[extension.range.clone()]))
    }

    pub fn extension(&self, id: u8) -> Option<&[u8]> {
        self.extensions().find(|(ext_id, _)| *ext_id == id).map(|(_, value)| value)
    }

    pub fn extension_of_kind(&self, kind: ExtensionKind, map: &ExtensionMap) -> Option<&[u8]> {
        self.extension(map.id(kind)?)
    }

    /// The simulcast layer this packet claims via the rtp-stream-id extension.
    pub fn rid(&self, map: &ExtensionMap) -> Option<&str> {
        self.extension_of_kind(ExtensionKind::RtpStreamId, map)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// The simulcast layer an RTX packet repairs.
    pub fn repaired_rid(&self, map: &ExtensionMap) -> Option<&str> {
        self.extension_of_kind(ExtensionKind::RepairedRtpStreamId, map)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn transport_cc_seqnum(&self, map: &ExtensionMap) -> Option<TruncatedSequenceNumber> {
        match self.extension_of_kind(ExtensionKind::TransportCc, map)? {
            &[b0, b1] => Some(u16::from_be_bytes([b0, b1])),
            _ => None,
        }
    }

    pub fn to_owned(&self) -> Packet<Vec<u8>> {
        Packet {
            marker: self.marker,
            payload_type: self.payload_type,
            seqnum: self.seqnum,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            extensions: self.extensions.clone(),
            payload_range: self.payload_range.clone(),
            padding_byte_count: self.padding_byte_count,
            serialized: self.serialized().to_vec(),
        }
    }

    /// Wraps this packet for retransmission: the original seqnum goes in front of the
    /// payload and the header carries the rtx payload type, SSRC, and seqnum.
    pub fn to_rtx(
        &self,
        rtx_payload_type: PayloadType,
        rtx_ssrc: Ssrc,
        rtx_seqnum: TruncatedSequenceNumber,
    ) -> Packet<Vec<u8>> {
        let extensions: Vec<(u8, &[u8])> = self.extensions().collect();
        let payload = (self.seqnum, self.payload()).to_vec();
        Packet::with_extensions(
            self.marker,
            rtx_payload_type,
            rtx_seqnum,
            self.timestamp,
            rtx_ssrc,
            &extensions,
            &payload,
        )
    }

    /// Reverses [`Packet::to_rtx`]. Returns None if the payload is too short to hold
    /// the original seqnum (which is the case for rtx padding packets).
    pub fn from_rtx(&self, payload_type: PayloadType, ssrc: Ssrc) -> Option<Packet<Vec<u8>>> {
        let (original_seqnum, payload) = self.payload().checked_split_at(RTX_SEQNUM_LEN)?;
        let extensions: Vec<(u8, &[u8])> = self.extensions().collect();
        Some(Packet::with_extensions(
            self.marker,
            payload_type,
            parse_u16(original_seqnum),
            self.timestamp,
            ssrc,
            &extensions,
            payload,
        ))
    }

    /// Rewrites extension ids from one negotiated map to another.
    /// Extensions without a counterpart in `to` are dropped.
    pub fn with_translated_extensions(
        &self,
        from: &ExtensionMap,
        to: &ExtensionMap,
    ) -> Packet<Vec<u8>> {
        let extensions: Vec<(u8, &[u8])> = self
            .extensions()
            .filter_map(|(id, value)| Some((from.translate(id, to)?, value)))
            .collect();
        Packet::with_extensions(
            self.marker,
            self.payload_type,
            self.seqnum,
            self.timestamp,
            self.ssrc,
            &extensions,
            self.payload(),
        )
    }

    /// Returns the serialized SRTP packet with the auth tag appended.
    pub fn encrypt(
        &self,
        seqnum: FullSequenceNumber,
        key: &KeyAndSalt,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut encrypted = Vec::with_capacity(self.size() + SRTP_AUTH_TAG_LEN);
        encrypted.extend_from_slice(self.serialized());
        encrypted.resize(self.size() + SRTP_AUTH_TAG_LEN, 0);
        encrypt_rtp_in_place(&mut encrypted, self.header_len(), self.ssrc, seqnum, key)?;
        Ok(encrypted)
    }
}

impl<T: BorrowMut<[u8]>> Packet<T> {
    pub fn set_payload_type_in_header(&mut self, payload_type: PayloadType) {
        self.payload_type = payload_type;
        self.serialized.borrow_mut()[RTP_PAYLOAD_TYPE_OFFSET] =
            ((self.marker as u8) << 7) | (payload_type & 0b0111_1111);
    }

    pub fn set_ssrc_in_header(&mut self, ssrc: Ssrc) {
        self.ssrc = ssrc;
        self.serialized.borrow_mut()[RTP_SSRC_RANGE.clone()].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn set_seqnum_in_header(&mut self, seqnum: TruncatedSequenceNumber) {
        self.seqnum = seqnum;
        self.serialized.borrow_mut()[RTP_SEQNUM_RANGE.clone()]
            .copy_from_slice(&seqnum.to_be_bytes());
    }

    pub fn set_timestamp_in_header(&mut self, timestamp: TruncatedTimestamp) {
        self.timestamp = timestamp;
        self.serialized.borrow_mut()[RTP_TIMESTAMP_RANGE.clone()]
            .copy_from_slice(&timestamp.to_be_bytes());
    }
}

impl Packet<Vec<u8>> {
    /// Writes a valid RTP packet with the given parameters.
    ///
    /// The packet will not have padding, and the CSRC count will be zero.
    /// The one-byte extension profile is used when every element fits in it.
    pub fn with_extensions(
        marker: bool,
        payload_type: PayloadType,
        seqnum: TruncatedSequenceNumber,
        timestamp: TruncatedTimestamp,
        ssrc: Ssrc,
        extensions: &[(u8, &[u8])],
        payload: &[u8],
    ) -> Self {
        let profile = if extensions
            .iter()
            .all(|(id, value)| HeaderExtensionsProfile::fits(*id, value))
        {
            HeaderExtensionsProfile::OneByte
        } else {
            HeaderExtensionsProfile::TwoByte
        };
        let has_extensions = !extensions.is_empty();
        let header = (
            [(VERSION << 6) | ((has_extensions as u8) << 4)],
            [((marker as u8) << 7) | (payload_type & 0b0111_1111)],
            seqnum,
            timestamp,
            ssrc,
        );

        let mut serialized = header.to_vec();
        let mut ranges = Vec::with_capacity(extensions.len());
        if has_extensions {
            let block_start = serialized.len() + RTP_EXTENSIONS_HEADER_LEN;
            let mut block = Vec::new();
            for (id, value) in extensions {
                match profile {
                    HeaderExtensionsProfile::OneByte => {
                        block.push((id << 4) | (value.len() as u8 - 1));
                    }
                    HeaderExtensionsProfile::TwoByte => {
                        block.push(*id);
                        block.push(value.len() as u8);
                    }
                }
                let value_start = block_start + block.len();
                ranges.push(Extension {
                    id: *id,
                    range: value_start..(value_start + value.len()),
                });
                block.extend_from_slice(value);
            }
            let padded_len = round_up_to_multiple_of::<4>(block.len());
            block.resize(padded_len, 0);
            (profile.to_u16(), (padded_len / 4) as u16, block).write(&mut serialized);
        }

        let payload_start = serialized.len();
        serialized.extend_from_slice(payload);
        Self {
            marker,
            payload_type,
            seqnum,
            timestamp,
            ssrc,
            extensions: ranges,
            payload_range: payload_start..serialized.len(),
            padding_byte_count: 0,
            serialized,
        }
    }

    pub fn new(
        payload_type: PayloadType,
        seqnum: TruncatedSequenceNumber,
        timestamp: TruncatedTimestamp,
        ssrc: Ssrc,
        payload: &[u8],
    ) -> Self {
        Self::with_extensions(false, payload_type, seqnum, timestamp, ssrc, &[], payload)
    }
}

/// Authenticates and decrypts an SRTP packet, returning the extended seqnum and the
/// plaintext RTP packet.
///
/// `max_seqnum` is the highest extended seqnum seen on the SSRC and is only advanced
/// once the packet is authenticated.
pub fn decrypt_srtp(
    mut encrypted: Vec<u8>,
    max_seqnum: &mut FullSequenceNumber,
    key: &KeyAndSalt,
) -> Result<(FullSequenceNumber, Packet<Vec<u8>>), CryptoError> {
    let plaintext_len = encrypted
        .len()
        .checked_sub(SRTP_AUTH_TAG_LEN)
        .ok_or(CryptoError::TooShort(encrypted.len()))?;
    let header =
        Header::parse(&encrypted[..plaintext_len]).ok_or(CryptoError::TooShort(encrypted.len()))?;
    let mut candidate_max = *max_seqnum;
    let seqnum = rtc_common::expand_seqnum(header.seqnum, &mut candidate_max);
    decrypt_rtp_in_place(
        &mut encrypted,
        header.payload_range.start,
        header.ssrc,
        seqnum,
        key,
    )?;
    *max_seqnum = candidate_max;
    encrypted.truncate(plaintext_len);
    let packet = Packet::parse(encrypted).ok_or(CryptoError::TooShort(plaintext_len))?;
    Ok((seqnum, packet))
}
