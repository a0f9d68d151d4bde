//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! RTCP (RFC 3550) with the feedback messages of RFC 4585, RFC 5104, the RFC 3611 round
//! trip blocks, and the REMB and transport-cc drafts.

use std::ops::Range;

use log::*;
use once_cell::sync::Lazy;
use rtc_common::{
    parse_u16, parse_u24, parse_u32, parse_u64, round_up_to_multiple_of, CheckedSplitAt, Duration,
    Instant, SystemTime, Writable, Writer, U24,
};
use thiserror::Error;

use crate::transportcc::TransportCcFeedback;

use super::{
    nack::{parse_nack, Nack},
    types::*,
    VERSION,
};

pub const RTCP_PAYLOAD_TYPE_OFFSET: usize = 1;
pub const RTCP_TYPE_SENDER_REPORT: u8 = 200;
pub const RTCP_TYPE_RECEIVER_REPORT: u8 = 201;
pub const RTCP_TYPE_SDES: u8 = 202;
pub const RTCP_TYPE_BYE: u8 = 203;
pub const RTCP_TYPE_GENERIC_FEEDBACK: u8 = 205;
pub const RTCP_TYPE_SPECIFIC_FEEDBACK: u8 = 206;
pub const RTCP_TYPE_EXTENDED_REPORT: u8 = 207;
pub const RTCP_FORMAT_NACK: u8 = 1;
pub const RTCP_FORMAT_TMMBR: u8 = 3;
pub const RTCP_FORMAT_TRANSPORT_CC: u8 = 15;
pub const RTCP_FORMAT_PLI: u8 = 1;
pub const RTCP_FORMAT_SLI: u8 = 2;
pub const RTCP_FORMAT_FIR: u8 = 4;
pub const RTCP_FORMAT_APPLICATION_LAYER: u8 = 15;
/// The most items a single packet's count field can declare.
pub const MAX_ITEM_COUNT: usize = 31;
const FEEDBACK_SSRCS_LEN: usize = 8;
const SDES_ITEM_CNAME: u8 = 1;
const SDES_MAX_TEXT_LEN: usize = u8::MAX as usize;
const XR_BLOCK_RECEIVER_REFERENCE_TIME: u8 = 4;
const XR_BLOCK_DLRR: u8 = 5;
const XR_BLOCK_HEADER_LEN: usize = 4;
const DLRR_ITEM_LEN: usize = 12;
const REMB_IDENTIFIER: &[u8; 4] = b"REMB";
const REMB_MAX_MANTISSA: u64 = (1 << 18) - 1;
const TMMBR_MAX_MANTISSA: u64 = (1 << 17) - 1;
// 1900 Jan 1st 00:00:00 UTC, RTP's chosen EPOCH
static NTP_EPOCH: Lazy<SystemTime> =
    Lazy::new(|| (std::time::UNIX_EPOCH - std::time::Duration::from_secs(2_208_988_800)).into());

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{kind} needs at least {minimum} bytes, found {actual}")]
    TooShort {
        kind: &'static str,
        minimum: usize,
        actual: usize,
    },
    #[error("invalid padding: {0} bytes")]
    InvalidPadding(usize),
    #[error("REMB is missing its identifier")]
    MissingRembIdentifier,
    #[error("SDES chunk is not terminated")]
    UnterminatedSdes,
    #[error("invalid transport-cc feedback: {0}")]
    InvalidTransportCc(&'static str),
    #[error("XR block length {0} runs past the packet")]
    InvalidXrBlock(usize),
}

fn require(kind: &'static str, minimum: usize, actual: &[u8]) -> Result<(), ParseError> {
    if actual.len() < minimum {
        Err(ParseError::TooShort {
            kind,
            minimum,
            actual: actual.len(),
        })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    has_padding: bool,
    pub count_or_format: u8,
    pub payload_type: u8,
    /// length of the RTCP packet in words, minus the 1-word header
    pub length_in_words: u16,
}

impl RtcpHeader {
    pub const LENGTH: usize = 4;
    const PADDING_MASK: u8 = 0b0010_0000;
    const RC_MASK: u8 = 0b0001_1111;
    const PACKET_LENGTH_RANGE: Range<usize> = 2..4;

    fn for_body(payload_type: u8, count_or_format: u8, padded_body_len: usize) -> Self {
        Self {
            has_padding: false,
            count_or_format,
            payload_type,
            length_in_words: (padded_body_len / 4) as u16,
        }
    }

    //     0                   1                   2                   3
    //     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    //    |V=2|P|    RC   |   PT=SR=200   |             length            |
    //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    fn from_bytes(value: &[u8]) -> Option<Self> {
        if value.len() < Self::LENGTH || (value[0] >> 6) != VERSION {
            return None;
        }
        Some(Self {
            has_padding: value[0] & Self::PADDING_MASK > 0,
            count_or_format: value[0] & Self::RC_MASK,
            payload_type: value[RTCP_PAYLOAD_TYPE_OFFSET],
            length_in_words: parse_u16(&value[Self::PACKET_LENGTH_RANGE]),
        })
    }

    /// Number of bytes in the packet, header & padding included
    pub fn packet_length_in_bytes(&self) -> usize {
        (self.length_in_words as usize + 1) * 4
    }
}

impl Writer for RtcpHeader {
    fn written_len(&self) -> usize {
        Self::LENGTH
    }

    fn write(&self, out: &mut dyn Writable) {
        let padding = if self.has_padding {
            Self::PADDING_MASK
        } else {
            0
        };
        [
            (VERSION << 6) | padding | (self.count_or_format & Self::RC_MASK),
            self.payload_type,
        ]
        .write(out);
        self.length_in_words.write(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: Ssrc,
    pub fraction_lost: u8,
    pub cumulative_lost: U24,
    pub highest_seqnum: u32,
    pub jitter: u32,
    // middle 32 bits of last receiver sender reports 64bit NTP TS
    pub last_sender_report: u32,
    pub delay_last_sender_report: u32,
}

impl ReportBlock {
    pub const LENGTH: usize = 24;
    const SSRC_RANGE: Range<usize> = 0..4;
    const FRACTION_LOST_OFFSET: usize = 4;
    const CUMULATIVE_LOST_RANGE: Range<usize> = 5..8;
    const HIGHEST_SEQUENCE_NUMBER_RANGE: Range<usize> = 8..12;
    const INTERARRIVAL_JITTER_RANGE: Range<usize> = 12..16;
    const LAST_SENDER_REPORT_RANGE: Range<usize> = 16..20;
    const DELAY_LAST_SENDER_REPORT_RANGE: Range<usize> = 20..24;

    fn from_bytes(value: &[u8]) -> Self {
        Self {
            ssrc: parse_u32(&value[Self::SSRC_RANGE]),
            fraction_lost: value[Self::FRACTION_LOST_OFFSET],
            cumulative_lost: parse_u24(&value[Self::CUMULATIVE_LOST_RANGE]),
            highest_seqnum: parse_u32(&value[Self::HIGHEST_SEQUENCE_NUMBER_RANGE]),
            jitter: parse_u32(&value[Self::INTERARRIVAL_JITTER_RANGE]),
            last_sender_report: parse_u32(&value[Self::LAST_SENDER_REPORT_RANGE]),
            delay_last_sender_report: parse_u32(&value[Self::DELAY_LAST_SENDER_REPORT_RANGE]),
        }
    }

    fn parse_blocks(kind: &'static str, count: u8, value: &[u8]) -> Result<Vec<Self>, ParseError> {
        let count = count as usize;
        require(kind, count * Self::LENGTH, value)?;
        Ok(value
            .chunks_exact(Self::LENGTH)
            .take(count)
            .map(Self::from_bytes)
            .collect())
    }
}

impl Writer for ReportBlock {
    fn written_len(&self) -> usize {
        Self::LENGTH
    }

    fn write(&self, out: &mut dyn Writable) {
        self.ssrc.write(out);
        [self.fraction_lost].write(out);
        self.cumulative_lost.write(out);
        self.highest_seqnum.write(out);
        self.jitter.write(out);
        self.last_sender_report.write(out);
        self.delay_last_sender_report.write(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub ssrc: Ssrc,
    pub ntp_ts: u64,
    pub rtp_ts: TruncatedTimestamp,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderInfo {
    const SENDER_INFO_LENGTH: usize = 24;
    const SSRC_RANGE: Range<usize> = 0..4;
    const NTS_RANGE: Range<usize> = 4..12;
    const RTS_RANGE: Range<usize> = 12..16;
    const SPC_RANGE: Range<usize> = 16..20;
    const SOC_RANGE: Range<usize> = 20..24;

    fn from_bytes(b: &[u8]) -> Self {
        Self {
            ssrc: parse_u32(&b[Self::SSRC_RANGE]),
            ntp_ts: parse_u64(&b[Self::NTS_RANGE]),
            rtp_ts: parse_u32(&b[Self::RTS_RANGE]),
            packet_count: parse_u32(&b[Self::SPC_RANGE]),
            octet_count: parse_u32(&b[Self::SOC_RANGE]),
        }
    }
}

impl Writer for SenderInfo {
    fn written_len(&self) -> usize {
        Self::SENDER_INFO_LENGTH
    }

    fn write(&self, out: &mut dyn Writable) {
        self.ssrc.write(out);
        self.ntp_ts.write(out);
        self.rtp_ts.write(out);
        self.packet_count.write(out);
        self.octet_count.write(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub sender_info: SenderInfo,
    pub report_blocks: Vec<ReportBlock>,
}

impl SenderReport {
    fn from_body(body: &[u8], count: u8) -> Result<Self, ParseError> {
        require("sender report", SenderInfo::SENDER_INFO_LENGTH, body)?;
        let (sender_info, blocks) = body.split_at(SenderInfo::SENDER_INFO_LENGTH);
        Ok(Self {
            sender_info: SenderInfo::from_bytes(sender_info),
            report_blocks: ReportBlock::parse_blocks("sender report", count, blocks)?,
        })
    }

    pub fn ssrc(&self) -> Ssrc {
        self.sender_info.ssrc
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub sender_ssrc: Ssrc,
    pub report_blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    fn from_body(body: &[u8], count: u8) -> Result<Self, ParseError> {
        require("receiver report", 4, body)?;
        Ok(Self {
            sender_ssrc: parse_u32(body),
            report_blocks: ReportBlock::parse_blocks("receiver report", count, &body[4..])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: u8,
    pub text: Vec<u8>,
}

impl SdesItem {
    // The length is one byte, so longer text is cut.
    fn written_text(&self) -> &[u8] {
        &self.text[..self.text.len().min(SDES_MAX_TEXT_LEN)]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: Ssrc,
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    pub fn cname(ssrc: Ssrc, cname: &str) -> Self {
        Self {
            ssrc,
            items: vec![SdesItem {
                item_type: SDES_ITEM_CNAME,
                text: cname.as_bytes().to_vec(),
            }],
        }
    }

    pub fn get_cname(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.item_type == SDES_ITEM_CNAME)
            .and_then(|item| std::str::from_utf8(&item.text).ok())
    }

    fn items_len(&self) -> usize {
        self.items.iter().map(|item| 2 + item.written_text().len()).sum::<usize>()
    }
}

impl Writer for SdesChunk {
    fn written_len(&self) -> usize {
        // The null terminator plus padding to the next word boundary.
        round_up_to_multiple_of::<4>(4 + self.items_len() + 1)
    }

    fn write(&self, out: &mut dyn Writable) {
        self.ssrc.write(out);
        for item in &self.items {
            let text = item.written_text();
            [item.item_type, text.len() as u8].write(out);
            text.write(out);
        }
        let terminator_len = self.written_len() - 4 - self.items_len();
        out.write(&[0u8; 4][..terminator_len]);
    }
}

fn parse_sdes(body: &[u8], count: u8) -> Result<Vec<SdesChunk>, ParseError> {
    let mut chunks = Vec::with_capacity(count as usize);
    let mut rest = body;
    for _ in 0..count {
        require("SDES chunk", 4, rest)?;
        let ssrc = parse_u32(rest);
        let mut offset = 4;
        let mut items = Vec::new();
        loop {
            let item_type = *rest.get(offset).ok_or(ParseError::UnterminatedSdes)?;
            if item_type == 0 {
                offset += 1;
                break;
            }
            let len = *rest.get(offset + 1).ok_or(ParseError::UnterminatedSdes)? as usize;
            let text = rest
                .get(offset + 2..offset + 2 + len)
                .ok_or(ParseError::UnterminatedSdes)?;
            items.push(SdesItem {
                item_type,
                text: text.to_vec(),
            });
            offset += 2 + len;
        }
        chunks.push(SdesChunk { ssrc, items });
        rest = rest.get(round_up_to_multiple_of::<4>(offset)..).unwrap_or_default();
    }
    Ok(chunks)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub ssrcs: Vec<Ssrc>,
    pub reason: Option<String>,
}

impl Goodbye {
    fn from_body(body: &[u8], count: u8) -> Result<Self, ParseError> {
        let ssrcs_len = count as usize * 4;
        require("BYE", ssrcs_len, body)?;
        let (ssrcs, rest) = body.split_at(ssrcs_len);
        let reason = match rest.split_first() {
            Some((&len, text)) if len > 0 => {
                let text = text.get(..len as usize).ok_or(ParseError::TooShort {
                    kind: "BYE reason",
                    minimum: len as usize,
                    actual: text.len(),
                })?;
                Some(String::from_utf8_lossy(text).into_owned())
            }
            _ => None,
        };
        Ok(Self {
            ssrcs: ssrcs.chunks_exact(4).map(parse_u32).collect(),
            reason,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceLoss {
    pub first: u16,
    pub number: u16,
    pub picture_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: Ssrc,
    pub seqnum: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmmbrEntry {
    pub ssrc: Ssrc,
    pub bitrate_bps: u64,
    pub overhead: u16,
}

/// Receiver Estimated Maximum Bitrate (draft-alvestrand-rmcat-remb).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remb {
    pub bitrate_bps: u64,
    pub ssrcs: Vec<Ssrc>,
}

/// Splits a bitrate into (exponent, mantissa), rounding down when it doesn't fit.
fn to_exponent_and_mantissa(bitrate: u64, max_mantissa: u64) -> (u8, u64) {
    let mut exponent = 0;
    let mut mantissa = bitrate;
    while mantissa > max_mantissa {
        mantissa >>= 1;
        exponent += 1;
    }
    (exponent, mantissa)
}

fn from_exponent_and_mantissa(exponent: u8, mantissa: u64) -> u64 {
    mantissa.checked_shl(exponent as u32).unwrap_or(u64::MAX)
}

impl Remb {
    fn from_fci(fci: &[u8]) -> Result<Self, ParseError> {
        require("REMB", 8, fci)?;
        if &fci[0..4] != REMB_IDENTIFIER {
            return Err(ParseError::MissingRembIdentifier);
        }
        let ssrc_count = fci[4] as usize;
        let exponent = fci[5] >> 2;
        let mantissa = (u32::from(parse_u24(&fci[5..8])) & 0x3_FFFF) as u64;
        let ssrcs = &fci[8..];
        require("REMB SSRCs", ssrc_count * 4, ssrcs)?;
        Ok(Self {
            bitrate_bps: from_exponent_and_mantissa(exponent, mantissa),
            ssrcs: ssrcs.chunks_exact(4).take(ssrc_count).map(parse_u32).collect(),
        })
    }
}

impl Writer for Remb {
    fn written_len(&self) -> usize {
        8 + 4 * self.ssrcs.len().min(u8::MAX as usize)
    }

    fn write(&self, out: &mut dyn Writable) {
        let ssrcs = &self.ssrcs[..self.ssrcs.len().min(u8::MAX as usize)];
        let (exponent, mantissa) = to_exponent_and_mantissa(self.bitrate_bps, REMB_MAX_MANTISSA);
        REMB_IDENTIFIER.write(out);
        [ssrcs.len() as u8].write(out);
        U24::truncate(((exponent as u32) << 18) | mantissa as u32).write(out);
        for ssrc in ssrcs {
            ssrc.write(out);
        }
    }
}

/// A DLRR sub-block: the answer to one receiver's reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlrrItem {
    /// The receiver that sent the reference time.
    pub ssrc: Ssrc,
    /// The middle 32 bits of its NTP timestamp, like an LSR.
    pub last_receiver_report: u32,
    /// In units of 1/65536 seconds, like a DLSR.
    pub delay_last_receiver_report: u32,
}

impl Writer for DlrrItem {
    fn written_len(&self) -> usize {
        DLRR_ITEM_LEN
    }

    fn write(&self, out: &mut dyn Writable) {
        (
            self.ssrc,
            self.last_receiver_report,
            self.delay_last_receiver_report,
        )
            .write(out)
    }
}

/// The RFC 3611 report blocks we use: they give a stream's receiver a round trip time
/// without it having to send media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XrBlock {
    ReceiverReferenceTime { ntp_ts: u64 },
    Dlrr(Vec<DlrrItem>),
}

impl XrBlock {
    fn parts(&self) -> (u8, Vec<u8>) {
        match self {
            Self::ReceiverReferenceTime { ntp_ts } => {
                (XR_BLOCK_RECEIVER_REFERENCE_TIME, ntp_ts.to_vec())
            }
            Self::Dlrr(items) => (XR_BLOCK_DLRR, Writer::to_vec(&items[..])),
        }
    }
}

impl Writer for XrBlock {
    fn written_len(&self) -> usize {
        XR_BLOCK_HEADER_LEN + self.parts().1.len()
    }

    fn write(&self, out: &mut dyn Writable) {
        let (block_type, body) = self.parts();
        // Block length in words, minus the header word
        ([block_type, 0], (body.len() / 4) as u16, body).write(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedReport {
    pub sender_ssrc: Ssrc,
    pub blocks: Vec<XrBlock>,
}

impl ExtendedReport {
    /// Unknown block types are skipped.
    fn from_body(body: &[u8]) -> Result<Self, ParseError> {
        require("XR", 4, body)?;
        let sender_ssrc = parse_u32(body);
        let mut blocks = Vec::new();
        let mut rest = &body[4..];
        while !rest.is_empty() {
            require("XR block", XR_BLOCK_HEADER_LEN, rest)?;
            let block_type = rest[0];
            let block_len = parse_u16(&rest[2..4]) as usize * 4;
            let (block, after_block) = rest[XR_BLOCK_HEADER_LEN..]
                .checked_split_at(block_len)
                .ok_or(ParseError::InvalidXrBlock(block_len))?;
            rest = after_block;
            match block_type {
                XR_BLOCK_RECEIVER_REFERENCE_TIME => {
                    require("receiver reference time", 8, block)?;
                    blocks.push(XrBlock::ReceiverReferenceTime {
                        ntp_ts: parse_u64(block),
                    });
                }
                XR_BLOCK_DLRR => blocks.push(XrBlock::Dlrr(
                    block
                        .chunks_exact(DLRR_ITEM_LEN)
                        .map(|item| DlrrItem {
                            ssrc: parse_u32(&item[0..4]),
                            last_receiver_report: parse_u32(&item[4..8]),
                            delay_last_receiver_report: parse_u32(&item[8..12]),
                        })
                        .collect(),
                )),
                _ => trace!("skipping XR block type {}", block_type),
            }
        }
        Ok(Self {
            sender_ssrc,
            blocks,
        })
    }
}

/// One RTCP packet out of a compound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpRecord {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Vec<SdesChunk>),
    Goodbye(Goodbye),
    ExtendedReport(ExtendedReport),
    PictureLossIndication {
        sender_ssrc: Ssrc,
        media_ssrc: Ssrc,
    },
    SliceLossIndication {
        sender_ssrc: Ssrc,
        media_ssrc: Ssrc,
        entries: Vec<SliceLoss>,
    },
    FullIntraRequest {
        sender_ssrc: Ssrc,
        entries: Vec<FirEntry>,
    },
    Remb {
        sender_ssrc: Ssrc,
        remb: Remb,
    },
    Nack {
        sender_ssrc: Ssrc,
        nack: Nack,
    },
    Tmmbr {
        sender_ssrc: Ssrc,
        entries: Vec<TmmbrEntry>,
    },
    TransportCc {
        sender_ssrc: Ssrc,
        media_ssrc: Ssrc,
        feedback: TransportCcFeedback,
    },
}

impl RtcpRecord {
    pub fn sender_ssrc(&self) -> Ssrc {
        match self {
            Self::SenderReport(report) => report.ssrc(),
            Self::ReceiverReport(report) => report.sender_ssrc,
            Self::SourceDescription(chunks) => chunks.first().map(|chunk| chunk.ssrc).unwrap_or(0),
            Self::Goodbye(bye) => bye.ssrcs.first().copied().unwrap_or(0),
            Self::ExtendedReport(report) => report.sender_ssrc,
            Self::PictureLossIndication { sender_ssrc, .. }
            | Self::SliceLossIndication { sender_ssrc, .. }
            | Self::FullIntraRequest { sender_ssrc, .. }
            | Self::Remb { sender_ssrc, .. }
            | Self::Nack { sender_ssrc, .. }
            | Self::Tmmbr { sender_ssrc, .. }
            | Self::TransportCc { sender_ssrc, .. } => *sender_ssrc,
        }
    }

    /// Parses one packet given its header and body (header and padding excluded).
    /// Returns None for packet types we don't handle.
    fn parse(header: &RtcpHeader, body: &[u8]) -> Result<Option<Self>, ParseError> {
        let count = header.count_or_format;
        let record = match (header.payload_type, count) {
            (RTCP_TYPE_SENDER_REPORT, _) => Self::SenderReport(SenderReport::from_body(body, count)?),
            (RTCP_TYPE_RECEIVER_REPORT, _) => {
                Self::ReceiverReport(ReceiverReport::from_body(body, count)?)
            }
            (RTCP_TYPE_SDES, _) => Self::SourceDescription(parse_sdes(body, count)?),
            (RTCP_TYPE_BYE, _) => Self::Goodbye(Goodbye::from_body(body, count)?),
            (RTCP_TYPE_EXTENDED_REPORT, _) => {
                Self::ExtendedReport(ExtendedReport::from_body(body)?)
            }
            (RTCP_TYPE_GENERIC_FEEDBACK, format) | (RTCP_TYPE_SPECIFIC_FEEDBACK, format) => {
                require("feedback", FEEDBACK_SSRCS_LEN, body)?;
                let sender_ssrc = parse_u32(&body[0..4]);
                let media_ssrc = parse_u32(&body[4..8]);
                let fci = &body[FEEDBACK_SSRCS_LEN..];
                match (header.payload_type, format) {
                    (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_PLI) => Self::PictureLossIndication {
                        sender_ssrc,
                        media_ssrc,
                    },
                    (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_SLI) => Self::SliceLossIndication {
                        sender_ssrc,
                        media_ssrc,
                        entries: fci
                            .chunks_exact(4)
                            .map(|entry| {
                                let value = parse_u32(entry);
                                SliceLoss {
                                    first: (value >> 19) as u16,
                                    number: ((value >> 6) & 0x1FFF) as u16,
                                    picture_id: (value & 0x3F) as u8,
                                }
                            })
                            .collect(),
                    },
                    (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_FIR) => Self::FullIntraRequest {
                        sender_ssrc,
                        entries: fci
                            .chunks_exact(8)
                            .map(|entry| FirEntry {
                                ssrc: parse_u32(entry),
                                seqnum: entry[4],
                            })
                            .collect(),
                    },
                    (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_APPLICATION_LAYER) => Self::Remb {
                        sender_ssrc,
                        remb: Remb::from_fci(fci)?,
                    },
                    (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_NACK) => Self::Nack {
                        sender_ssrc,
                        nack: parse_nack(&body[4..]).map_err(|_| ParseError::TooShort {
                            kind: "NACK",
                            minimum: FEEDBACK_SSRCS_LEN + 4,
                            actual: body.len(),
                        })?,
                    },
                    (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TMMBR) => Self::Tmmbr {
                        sender_ssrc,
                        entries: fci
                            .chunks_exact(8)
                            .map(|entry| {
                                let value = parse_u32(&entry[4..8]);
                                TmmbrEntry {
                                    ssrc: parse_u32(entry),
                                    bitrate_bps: from_exponent_and_mantissa(
                                        (value >> 26) as u8,
                                        ((value >> 9) & 0x1_FFFF) as u64,
                                    ),
                                    overhead: (value & 0x1FF) as u16,
                                }
                            })
                            .collect(),
                    },
                    (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TRANSPORT_CC) => Self::TransportCc {
                        sender_ssrc,
                        media_ssrc,
                        feedback: TransportCcFeedback::from_fci(fci)?,
                    },
                    _ => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(record))
    }

    /// (payload type, count or format, body)
    fn to_parts(&self) -> (u8, u8, Vec<u8>) {
        fn feedback(sender_ssrc: Ssrc, media_ssrc: Ssrc, fci: impl Writer) -> Vec<u8> {
            (sender_ssrc, media_ssrc, fci).to_vec()
        }
        fn capped<T>(items: &[T]) -> &[T] {
            &items[..items.len().min(MAX_ITEM_COUNT)]
        }

        match self {
            Self::SenderReport(report) => {
                let blocks = capped(&report.report_blocks);
                (
                    RTCP_TYPE_SENDER_REPORT,
                    blocks.len() as u8,
                    (&report.sender_info, blocks).to_vec(),
                )
            }
            Self::ReceiverReport(report) => {
                let blocks = capped(&report.report_blocks);
                (
                    RTCP_TYPE_RECEIVER_REPORT,
                    blocks.len() as u8,
                    (report.sender_ssrc, blocks).to_vec(),
                )
            }
            Self::SourceDescription(chunks) => {
                let chunks = capped(chunks);
                (RTCP_TYPE_SDES, chunks.len() as u8, Writer::to_vec(chunks))
            }
            Self::Goodbye(bye) => {
                let ssrcs = capped(&bye.ssrcs);
                let mut body = Writer::to_vec(ssrcs);
                if let Some(reason) = bye.reason.as_deref().filter(|reason| !reason.is_empty()) {
                    let reason = &reason.as_bytes()[..reason.len().min(u8::MAX as usize)];
                    body.push(reason.len() as u8);
                    body.extend_from_slice(reason);
                }
                (RTCP_TYPE_BYE, ssrcs.len() as u8, body)
            }
            Self::ExtendedReport(report) => (
                RTCP_TYPE_EXTENDED_REPORT,
                0,
                (report.sender_ssrc, &report.blocks[..]).to_vec(),
            ),
            Self::PictureLossIndication {
                sender_ssrc,
                media_ssrc,
            } => (
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_PLI,
                feedback(*sender_ssrc, *media_ssrc, None::<u32>),
            ),
            Self::SliceLossIndication {
                sender_ssrc,
                media_ssrc,
                entries,
            } => {
                let fci: Vec<u32> = entries
                    .iter()
                    .map(|entry| {
                        ((entry.first as u32 & 0x1FFF) << 19)
                            | ((entry.number as u32 & 0x1FFF) << 6)
                            | (entry.picture_id as u32 & 0x3F)
                    })
                    .collect();
                (
                    RTCP_TYPE_SPECIFIC_FEEDBACK,
                    RTCP_FORMAT_SLI,
                    feedback(*sender_ssrc, *media_ssrc, fci),
                )
            }
            Self::FullIntraRequest {
                sender_ssrc,
                entries,
            } => {
                let fci: Vec<(u32, [u8; 4])> = entries
                    .iter()
                    .map(|entry| (entry.ssrc, [entry.seqnum, 0, 0, 0]))
                    .collect();
                (
                    RTCP_TYPE_SPECIFIC_FEEDBACK,
                    RTCP_FORMAT_FIR,
                    feedback(*sender_ssrc, 0, fci),
                )
            }
            Self::Remb { sender_ssrc, remb } => (
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_APPLICATION_LAYER,
                feedback(*sender_ssrc, 0, remb),
            ),
            Self::Nack { sender_ssrc, nack } => (
                RTCP_TYPE_GENERIC_FEEDBACK,
                RTCP_FORMAT_NACK,
                (*sender_ssrc, nack).to_vec(),
            ),
            Self::Tmmbr {
                sender_ssrc,
                entries,
            } => {
                let fci: Vec<(u32, u32)> = entries
                    .iter()
                    .map(|entry| {
                        let (exponent, mantissa) =
                            to_exponent_and_mantissa(entry.bitrate_bps, TMMBR_MAX_MANTISSA);
                        (
                            entry.ssrc,
                            ((exponent as u32) << 26)
                                | ((mantissa as u32) << 9)
                                | (entry.overhead as u32 & 0x1FF),
                        )
                    })
                    .collect();
                (
                    RTCP_TYPE_GENERIC_FEEDBACK,
                    RTCP_FORMAT_TMMBR,
                    feedback(*sender_ssrc, 0, fci),
                )
            }
            Self::TransportCc {
                sender_ssrc,
                media_ssrc,
                feedback: fb,
            } => (
                RTCP_TYPE_GENERIC_FEEDBACK,
                RTCP_FORMAT_TRANSPORT_CC,
                feedback(*sender_ssrc, *media_ssrc, fb),
            ),
        }
    }
}

impl Writer for RtcpRecord {
    fn written_len(&self) -> usize {
        let (_, _, body) = self.to_parts();
        RtcpHeader::LENGTH + round_up_to_multiple_of::<4>(body.len())
    }

    fn write(&self, out: &mut dyn Writable) {
        let (payload_type, count_or_format, body) = self.to_parts();
        let padded_len = round_up_to_multiple_of::<4>(body.len());
        RtcpHeader::for_body(payload_type, count_or_format, padded_len).write(out);
        body.write(out);
        out.write(&[0u8; 4][..padded_len - body.len()]);
    }
}

/// Serializes records back to back into one (plaintext) compound packet.
pub fn serialize_compound(records: &[RtcpRecord]) -> Vec<u8> {
    Writer::to_vec(records)
}

/// Parses a decrypted compound packet. Records that fail to parse are dropped and logged;
/// a record whose length runs past the end of the buffer stops parsing of the rest.
pub fn parse_compound(compound: &[u8]) -> Vec<RtcpRecord> {
    let mut records = Vec::new();
    let mut rest = compound;
    while !rest.is_empty() {
        let Some(header) = RtcpHeader::from_bytes(rest) else {
            event!("rtc.rtcp.invalid.header");
            warn!("Ignoring RTCP with an invalid header; {} bytes left", rest.len());
            break;
        };
        let Some((packet, after_packet)) = rest.checked_split_at(header.packet_length_in_bytes())
        else {
            event!("rtc.rtcp.invalid.length");
            warn!(
                "RTCP packet length {} exceeds the {} bytes remaining",
                header.packet_length_in_bytes(),
                rest.len()
            );
            break;
        };
        rest = after_packet;

        let mut body = &packet[RtcpHeader::LENGTH..];
        if header.has_padding {
            let padding = body.last().copied().unwrap_or(0) as usize;
            if padding == 0 || padding > body.len() {
                event!("rtc.rtcp.invalid.padding");
                warn!("Ignoring RTCP with invalid padding: {}", padding);
                continue;
            }
            body = &body[..body.len() - padding];
        }

        match RtcpRecord::parse(&header, body) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {
                event!("rtc.rtcp.unhandled");
                debug!(
                    "Skipping unhandled RTCP: ({}, {})",
                    header.payload_type, header.count_or_format
                );
            }
            Err(err) => {
                event!("rtc.rtcp.invalid.record");
                warn!(
                    "Failed to parse RTCP ({}, {}): {}",
                    header.payload_type, header.count_or_format, err
                );
            }
        }
    }
    records
}

// The middle 32 bits in the NTP timestamp from the most recent RTCP sender report (SR) packet
// from source SSRC_n. If no SR has been received yet, the field is set to zero.
pub fn get_lsr(last_ntp_timestamp: u64) -> u32 {
    const LSR_MASK: u64 = 0x0000_FFFF_FFFF_0000;
    ((last_ntp_timestamp & LSR_MASK) >> 16) as u32
}

// The delay, expressed in units of 1/2^16 seconds, between receiving the last SR packet from
// source SSRC_n and sending this reception report block.
pub fn calculate_dlsr(sr_last_received_time: Instant, now: Instant) -> u32 {
    // 1/2^16 is roughly 0.000015259, which requires nanosecond precision
    const NANOS_TO_DELAY_UNIT: u128 = 15259;
    (now.saturating_duration_since(sr_last_received_time)
        .as_nanos()
        / NANOS_TO_DELAY_UNIT)
        .try_into()
        .unwrap_or_default()
}

pub fn dlsr_to_duration(delay_since_sr: u32) -> Duration {
    const NANOS_TO_DELAY_UNIT: u64 = 15259;
    Duration::from_nanos(delay_since_sr as u64 * NANOS_TO_DELAY_UNIT)
}

/// Converts to a 64-bit NTP timestamp: 32 bits of seconds since 1900 and 32 bits of fraction.
/// Returns 0 for times before the NTP epoch. Seconds roll over every 2^32 seconds.
pub fn convert_to_ntp(ts: SystemTime) -> u64 {
    const ROLLOVER_LIMIT: u64 = u32::MAX as u64 + 1;
    let elapsed = ts.saturating_duration_since(*NTP_EPOCH);
    let fraction = ((elapsed.subsec_micros() as u64) << 32) / 1_000_000;
    ((elapsed.as_secs() % ROLLOVER_LIMIT) << 32) + fraction
}

/// The inverse of [`convert_to_ntp`], to microsecond precision (within the first NTP era).
pub fn convert_from_ntp(ntp_ts: u64) -> SystemTime {
    let seconds = ntp_ts >> 32;
    let micros = ((ntp_ts & 0xFFFF_FFFF) * 1_000_000 + (1 << 31)) >> 32;
    *NTP_EPOCH + Duration::from_secs(seconds) + Duration::from_micros(micros)
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use super::*;

    fn report_block(ssrc: Ssrc) -> ReportBlock {
        ReportBlock {
            ssrc,
            fraction_lost: 51,
            cumulative_lost: U24::truncate(2),
            highest_seqnum: 1493824,
            jitter: 10,
            last_sender_report: 123784329,
            delay_last_sender_report: 6000,
        }
    }

    #[test]
    fn test_parse_rtcp_reports() {
        let sender_info = SenderInfo {
            ssrc: 10000,
            ntp_ts: 1234567898765432,
            rtp_ts: 1234567876,
            packet_count: 155,
            octet_count: 155 * 1500,
        };
        let raw_sender_report = (
            [0b1000_0010u8, RTCP_TYPE_SENDER_REPORT],
            ((24 + 2 * 24) / 4) as u16,
            &sender_info,
            report_block(1),
            report_block(2),
        )
            .to_vec();
        let records = parse_compound(&raw_sender_report);
        assert_eq!(
            vec![RtcpRecord::SenderReport(SenderReport {
                sender_info: sender_info.clone(),
                report_blocks: vec![report_block(1), report_block(2)],
            })],
            records
        );
        assert_eq!(raw_sender_report, serialize_compound(&records));

        let raw_receiver_report = (
            [0b1000_0001u8, RTCP_TYPE_RECEIVER_REPORT],
            ((4 + 24) / 4) as u16,
            10000u32,
            report_block(3),
        )
            .to_vec();
        assert_eq!(
            vec![RtcpRecord::ReceiverReport(ReceiverReport {
                sender_ssrc: 10000,
                report_blocks: vec![report_block(3)],
            })],
            parse_compound(&raw_receiver_report)
        );

        // Declares two blocks but only carries one
        let truncated = (
            [0b1000_0010u8, RTCP_TYPE_RECEIVER_REPORT],
            ((4 + 24) / 4) as u16,
            10000u32,
            report_block(3),
        )
            .to_vec();
        assert!(parse_compound(&truncated).is_empty());
    }

    #[test]
    fn compound_with_sdes_and_bye() {
        let records = vec![
            RtcpRecord::ReceiverReport(ReceiverReport {
                sender_ssrc: 1,
                report_blocks: vec![],
            }),
            RtcpRecord::SourceDescription(vec![SdesChunk::cname(1, "abcd")]),
            RtcpRecord::Goodbye(Goodbye {
                ssrcs: vec![1, 2],
                reason: Some("done".to_owned()),
            }),
        ];
        let serialized = serialize_compound(&records);
        assert_eq!(
            &hex!(
                "80c90001 00000001"
                "81ca0003 00000001 0104 61626364 0000"
                "82cb0004 00000001 00000002 04 646f6e65 000000"
            )[..],
            &serialized[..]
        );
        let parsed = parse_compound(&serialized);
        assert_eq!(records, parsed);
        match &parsed[1] {
            RtcpRecord::SourceDescription(chunks) => {
                assert_eq!(Some("abcd"), chunks[0].get_cname())
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn long_sdes_text_is_cut() {
        let chunk = SdesChunk {
            ssrc: 1,
            items: vec![SdesItem {
                item_type: SDES_ITEM_CNAME,
                text: vec![b'a'; 300],
            }],
        };
        let serialized = RtcpRecord::SourceDescription(vec![chunk]).to_vec();
        assert_eq!(&hex!("01ff"), &serialized[8..10]);
        match &parse_compound(&serialized)[..] {
            [RtcpRecord::SourceDescription(chunks)] => {
                assert_eq!(vec![b'a'; 255], chunks[0].items[0].text)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_bye_reason_is_left_out() {
        let bye = |reason: Option<&str>| {
            RtcpRecord::Goodbye(Goodbye {
                ssrcs: vec![1],
                reason: reason.map(String::from),
            })
        };
        assert_eq!(bye(None).to_vec(), bye(Some("")).to_vec());
        assert_eq!(vec![bye(None)], parse_compound(&bye(Some("")).to_vec()));
    }

    #[test]
    fn extended_reports() {
        let report = RtcpRecord::ExtendedReport(ExtendedReport {
            sender_ssrc: 1,
            blocks: vec![
                XrBlock::ReceiverReferenceTime {
                    ntp_ts: 0x0102_0304_0506_0708,
                },
                XrBlock::Dlrr(vec![DlrrItem {
                    ssrc: 2,
                    last_receiver_report: 0x0A0B_0C0D,
                    delay_last_receiver_report: 0x0001_0000,
                }]),
            ],
        });
        let serialized = report.to_vec();
        assert_eq!(
            &hex!(
                "80cf0008 00000001"
                "04000002 01020304 05060708"
                "05000003 00000002 0a0b0c0d 00010000"
            )[..],
            &serialized[..]
        );
        assert_eq!(vec![report.clone()], parse_compound(&serialized));

        // A block type we don't know is skipped.
        let with_unknown = hex!(
            "80cf0009 00000001"
            "06000001 deadbeef"
            "04000002 01020304 05060708"
            "05000003 00000002 0a0b0c0d 00010000"
        );
        assert_eq!(vec![report], parse_compound(&with_unknown));

        // A block claiming more than is there drops the record.
        assert!(parse_compound(&hex!("80cf0002 00000001 05000003")).is_empty());
    }

    #[test]
    fn sdes_needs_a_terminator() {
        let unterminated = hex!("81ca0002 00000001 0102 6162");
        assert!(parse_compound(&unterminated).is_empty());
    }

    #[test]
    fn feedback_messages() {
        let records = vec![
            RtcpRecord::PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2,
            },
            RtcpRecord::SliceLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2,
                entries: vec![SliceLoss {
                    first: 0x1FFF,
                    number: 7,
                    picture_id: 0x3F,
                }],
            },
            RtcpRecord::FullIntraRequest {
                sender_ssrc: 1,
                entries: vec![FirEntry { ssrc: 2, seqnum: 9 }],
            },
            RtcpRecord::Remb {
                sender_ssrc: 1,
                remb: Remb {
                    bitrate_bps: 1_000_000,
                    ssrcs: vec![2, 3],
                },
            },
            RtcpRecord::Nack {
                sender_ssrc: 1,
                nack: Nack {
                    ssrc: 2,
                    seqnums: vec![6, 8],
                },
            },
            RtcpRecord::Tmmbr {
                sender_ssrc: 1,
                entries: vec![TmmbrEntry {
                    ssrc: 2,
                    bitrate_bps: 256_000,
                    overhead: 40,
                }],
            },
        ];
        let serialized = serialize_compound(&records);
        assert_eq!(&hex!("81ce0002 00000001 00000002"), &serialized[..12]);
        assert_eq!(records, parse_compound(&serialized));
    }

    #[test]
    fn remb_encoding() {
        // 1_000_000 = 0x0F4240 needs 20 bits, so the exponent is 2.
        let remb = Remb {
            bitrate_bps: 1_000_000,
            ssrcs: vec![0x01020304],
        };
        assert_eq!(hex!("52454d42 01 0bd090 01020304").to_vec(), remb.to_vec());
        assert_eq!(remb, Remb::from_fci(&remb.to_vec()).unwrap());

        // Not exactly representable: rounds down
        let lossy = Remb {
            bitrate_bps: 1_000_001,
            ssrcs: vec![],
        };
        assert_eq!(1_000_000, Remb::from_fci(&lossy.to_vec()).unwrap().bitrate_bps);

        assert_eq!(
            Err(ParseError::MissingRembIdentifier),
            Remb::from_fci(&hex!("52454d43 00 000000"))
        );
    }

    #[test]
    fn skips_unknown_and_malformed_records() {
        let compound = (
            // An APP packet
            hex!("80cc0002 00000001 41424344").to_vec(),
            // A PLI missing its media SSRC
            hex!("81ce0001 00000001").to_vec(),
            // A PLI
            hex!("81ce0002 00000001 00000002").to_vec(),
        )
            .to_vec();
        assert_eq!(
            vec![RtcpRecord::PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2
            }],
            parse_compound(&compound)
        );
    }

    #[test]
    fn overlong_record_stops_parsing() {
        let compound = hex!("81ce0002 00000001 00000002 81ce0009 00000001 00000002");
        assert_eq!(1, parse_compound(&compound).len());
    }

    #[test]
    fn padded_record() {
        // PLI with 4 bytes of padding
        let compound = hex!("a1ce0003 00000001 00000002 00000004");
        assert_eq!(
            vec![RtcpRecord::PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2
            }],
            parse_compound(&compound)
        );
        let bad_padding = hex!("a1ce0003 00000001 00000002 00000010");
        assert!(parse_compound(&bad_padding).is_empty());
    }

    #[test]
    fn item_count_is_capped() {
        let bye = RtcpRecord::Goodbye(Goodbye {
            ssrcs: (0..40).collect(),
            reason: None,
        });
        let serialized = bye.to_vec();
        assert_eq!(0b1001_1111, serialized[0]);
        assert_eq!(4 + 31 * 4, serialized.len());
    }

    #[test]
    fn test_delay_from_last_sr() {
        let last_sr_time = Instant::now();
        let now = last_sr_time + Duration::from_secs(5);
        assert!((5 * 2_u32.pow(16)).abs_diff(calculate_dlsr(last_sr_time, now)) < 10);
        assert!(dlsr_to_duration(5 * 2_u32.pow(16)).as_millis().abs_diff(5000) <= 1);

        let too_late_to_matter = last_sr_time + Duration::from_secs(2_u64.pow(16) + 1);
        assert_eq!(0, calculate_dlsr(last_sr_time, too_late_to_matter));
    }

    #[test]
    fn test_convert_to_ntp() {
        // NTP Epoch is Jan 01, 1900 00:00:00 UTC
        // Unix Epoch is Jan 01, 1970 00:00:00 UTC
        let unix_epoch = SystemTime::UNIX_EPOCH;
        let unix_epoch_ntp: u64 = ((70 * 365 * 24 * 60 * 60) + (17 * 24 * 60 * 60)) << 32;
        assert_eq!(unix_epoch_ntp, convert_to_ntp(unix_epoch));

        // Half a second is half of the fraction range.
        assert_eq!(
            unix_epoch_ntp + (1 << 31),
            convert_to_ntp(unix_epoch + Duration::from_millis(500))
        );

        let time = unix_epoch + Duration::from_micros(1_700_000_000_123_456);
        assert_eq!(time, convert_from_ntp(convert_to_ntp(time)));

        assert_eq!(0x5678_9ABC, get_lsr(0x1234_5678_9ABC_DEF0));
    }
}
