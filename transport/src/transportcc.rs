//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Implementation of the receive side of
//! https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01

use std::collections::{btree_map, BTreeMap};

use byteorder::{ReadBytesExt, BE};
use log::*;
use rtc_common::{Duration, Instant, Writable, Writer, U24};

use crate::rtp::{ParseError, Ssrc, TruncatedSequenceNumber};

const MICROS_PER_REFERENCE_TICK: u64 = 64_000;
const MICROS_PER_DELTA_TICK: i64 = 250;
const MIN_RUN_LENGTH: usize = 7;
const MAX_RUN_LENGTH: usize = 0x1FFF;
const VECTOR1_CAPACITY: usize = 14;
const VECTOR2_CAPACITY: usize = 7;
// A wrap around 0xFFFF shows up as a large negative jump from the highest pending seqnum.
const LOOPED_THRESHOLD: i32 = -0xFF00;
const JUMPED_THRESHOLD: i32 = 0x7FFF;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
enum PacketStatus {
    NotReceived = 0,
    /// 1 byte of receive delta
    ReceivedSmallDelta = 1,
    /// 2 bytes of receive delta
    ReceivedLargeOrNegativeDelta = 2,
}

impl PacketStatus {
    fn of(delta_ticks: Option<i16>) -> Self {
        match delta_ticks {
            None => Self::NotReceived,
            Some(0..=0xFF) => Self::ReceivedSmallDelta,
            Some(_) => Self::ReceivedLargeOrNegativeDelta,
        }
    }

    fn from_bits(bits: u16) -> Result<Self, ParseError> {
        match bits {
            0b00 => Ok(Self::NotReceived),
            0b01 => Ok(Self::ReceivedSmallDelta),
            0b10 => Ok(Self::ReceivedLargeOrNegativeDelta),
            _ => Err(ParseError::InvalidTransportCc("reserved packet status")),
        }
    }
}

/// The FCI of a transport-cc feedback message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportCcFeedback {
    pub base_seqnum: TruncatedSequenceNumber,
    /// In units of 64ms since an epoch chosen by the receiver
    pub reference_time: U24,
    pub feedback_count: u8,
    /// One entry per seqnum starting at the base: the receive delta from the previous
    /// received packet (or the reference time) in 250µs ticks, None if not received.
    pub deltas: Vec<Option<i16>>,
}

impl TransportCcFeedback {
    pub fn from_fci(fci: &[u8]) -> Result<Self, ParseError> {
        let truncated = |_| ParseError::InvalidTransportCc("truncated");
        let mut reader = fci;
        let base_seqnum = reader.read_u16::<BE>().map_err(truncated)?;
        let status_count = reader.read_u16::<BE>().map_err(truncated)? as usize;
        let reference_time = U24::truncate(reader.read_u24::<BE>().map_err(truncated)?);
        let feedback_count = reader.read_u8().map_err(truncated)?;

        let mut statuses = Vec::with_capacity(status_count);
        while statuses.len() < status_count {
            let chunk = reader.read_u16::<BE>().map_err(truncated)?;
            decode_status_chunk(chunk, status_count - statuses.len(), &mut statuses)?;
        }

        let deltas = statuses
            .into_iter()
            .map(|status| match status {
                PacketStatus::NotReceived => Ok(None),
                PacketStatus::ReceivedSmallDelta => {
                    Ok(Some(reader.read_u8().map_err(truncated)? as i16))
                }
                PacketStatus::ReceivedLargeOrNegativeDelta => {
                    Ok(Some(reader.read_i16::<BE>().map_err(truncated)?))
                }
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(Self {
            base_seqnum,
            reference_time,
            feedback_count,
            deltas,
        })
    }

    /// The received seqnums with their arrival, in microseconds since the receiver's epoch.
    pub fn arrivals(&self) -> impl Iterator<Item = (TruncatedSequenceNumber, i64)> + '_ {
        let mut arrival_micros =
            u32::from(self.reference_time) as i64 * MICROS_PER_REFERENCE_TICK as i64;
        self.deltas
            .iter()
            .enumerate()
            .filter_map(move |(offset, delta_ticks)| {
                arrival_micros += *delta_ticks.as_ref()? as i64 * MICROS_PER_DELTA_TICK;
                Some((
                    self.base_seqnum.wrapping_add(offset as u16),
                    arrival_micros,
                ))
            })
    }

    pub fn received_count(&self) -> usize {
        self.deltas.iter().filter(|delta| delta.is_some()).count()
    }

    fn statuses(&self) -> Vec<PacketStatus> {
        self.deltas.iter().copied().map(PacketStatus::of).collect()
    }
}

impl Writer for TransportCcFeedback {
    fn written_len(&self) -> usize {
        let deltas_len: usize = self
            .deltas
            .iter()
            .map(|delta| match PacketStatus::of(*delta) {
                PacketStatus::NotReceived => 0,
                PacketStatus::ReceivedSmallDelta => 1,
                PacketStatus::ReceivedLargeOrNegativeDelta => 2,
            })
            .sum();
        8 + 2 * encode_status_chunks(&self.statuses()).len() + deltas_len
    }

    fn write(&self, out: &mut dyn Writable) {
        (
            self.base_seqnum,
            self.deltas.len() as u16,
            self.reference_time,
            [self.feedback_count],
            encode_status_chunks(&self.statuses()),
        )
            .write(out);
        for delta in self.deltas.iter().flatten() {
            match PacketStatus::of(Some(*delta)) {
                PacketStatus::ReceivedSmallDelta => [*delta as u8].write(out),
                _ => delta.write(out),
            }
        }
    }
}

// Runs of at least MIN_RUN_LENGTH identical statuses become run-length chunks. Anything
// else goes in a 14-symbol 1-bit vector, or a 7-symbol 2-bit vector when the window
// holds a large delta.
fn encode_status_chunks(statuses: &[PacketStatus]) -> Vec<u16> {
    let mut chunks = Vec::new();
    let mut rest = statuses;
    while let Some(&first) = rest.first() {
        let run = rest
            .iter()
            .take(MAX_RUN_LENGTH)
            .take_while(|status| **status == first)
            .count();
        let len = if run >= MIN_RUN_LENGTH || run == rest.len() {
            chunks.push(((first as u16) << 13) | run as u16);
            run
        } else if rest
            .iter()
            .take(VECTOR1_CAPACITY)
            .all(|status| *status != PacketStatus::ReceivedLargeOrNegativeDelta)
        {
            let len = rest.len().min(VECTOR1_CAPACITY);
            let bits = rest[..len]
                .iter()
                .enumerate()
                .fold(0u16, |bits, (i, status)| bits | (*status as u16) << (13 - i));
            chunks.push((0b10 << 14) | bits);
            len
        } else {
            let len = rest.len().min(VECTOR2_CAPACITY);
            let bits = rest[..len]
                .iter()
                .enumerate()
                .fold(0u16, |bits, (i, status)| {
                    bits | (*status as u16) << (2 * (6 - i))
                });
            chunks.push((0b11 << 14) | bits);
            len
        };
        rest = &rest[len..];
    }
    chunks
}

fn decode_status_chunk(
    chunk: u16,
    remaining: usize,
    out: &mut Vec<PacketStatus>,
) -> Result<(), ParseError> {
    match chunk >> 14 {
        0b00 | 0b01 => {
            let status = PacketStatus::from_bits((chunk >> 13) & 0b11)?;
            let len = (chunk as usize & MAX_RUN_LENGTH).min(remaining);
            if len == 0 {
                return Err(ParseError::InvalidTransportCc("empty run length"));
            }
            out.extend(std::iter::repeat(status).take(len));
        }
        0b10 => {
            for i in 0..VECTOR1_CAPACITY.min(remaining) {
                out.push(PacketStatus::from_bits((chunk >> (13 - i)) & 0b1)?);
            }
        }
        _ => {
            for i in 0..VECTOR2_CAPACITY.min(remaining) {
                out.push(PacketStatus::from_bits((chunk >> (2 * (6 - i))) & 0b11)?);
            }
        }
    }
    Ok(())
}

/// Collects the arrival times of packets carrying a transport-cc seqnum and emits feedback
/// for them when enough are pending, when they span enough time, or when the seqnums wrap.
pub struct Receiver {
    // Reference times are measured from here.
    epoch: Instant,
    max_pending: usize,
    max_span: Duration,
    next_feedback_count: u8,
    // The media SSRC named in the next feedback: the last one seen carrying a seqnum.
    media_ssrc: Ssrc,
    pending: BTreeMap<TruncatedSequenceNumber, Instant>,
    first_pending_arrival: Option<Instant>,
}

impl Receiver {
    pub fn new(epoch: Instant, max_pending: usize, max_span: Duration) -> Self {
        Self {
            epoch,
            max_pending,
            max_span,
            next_feedback_count: 0,
            media_ssrc: 0,
            pending: BTreeMap::new(),
            first_pending_arrival: None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn on_rtp(
        &mut self,
        ssrc: Ssrc,
        seqnum: TruncatedSequenceNumber,
        arrival: Instant,
        mut sink: impl FnMut(Ssrc, TransportCcFeedback),
    ) {
        if let Some((&max, _)) = self.pending.last_key_value() {
            let delta = seqnum as i32 - max as i32;
            if delta < LOOPED_THRESHOLD {
                trace!("transport-cc seqnum looped: {} -> {}", max, seqnum);
                self.flush(&mut sink);
            } else if delta > JUMPED_THRESHOLD {
                event!("rtc.twcc.seqnum_jumped");
                debug!("transport-cc seqnum jumped: {} -> {}; dropping", max, seqnum);
                return;
            }
        }

        match self.pending.entry(seqnum) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(arrival);
            }
            btree_map::Entry::Occupied(_) => {
                event!("rtc.twcc.seqnum_repeated");
                warn!("received transport-cc seqnum {} more than once", seqnum);
                return;
            }
        }
        self.media_ssrc = ssrc;
        let first_arrival = *self.first_pending_arrival.get_or_insert(arrival);

        if self.pending.len() >= self.max_pending
            || arrival.saturating_duration_since(first_arrival) >= self.max_span
        {
            self.flush(&mut sink);
        }
    }

    /// When feedback is due even if nothing else arrives.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.first_pending_arrival
            .map(|first_arrival| first_arrival + self.max_span)
    }

    pub fn tick(&mut self, now: Instant, sink: impl FnMut(Ssrc, TransportCcFeedback)) {
        if matches!(self.next_deadline(), Some(deadline) if deadline <= now) {
            self.flush(sink);
        }
    }

    /// Emits feedback for everything pending, if anything is.
    pub fn flush(&mut self, mut sink: impl FnMut(Ssrc, TransportCcFeedback)) {
        let pending = std::mem::take(&mut self.pending);
        self.first_pending_arrival = None;
        let (Some((&min, &first_arrival)), Some((&max, _))) =
            (pending.first_key_value(), pending.last_key_value())
        else {
            return;
        };

        let reference_ticks = first_arrival.saturating_duration_since(self.epoch).as_micros()
            as u64
            / MICROS_PER_REFERENCE_TICK;
        let mut last_arrival_micros = (reference_ticks * MICROS_PER_REFERENCE_TICK) as i64;
        let deltas = (min..=max)
            .map(|seqnum| {
                let arrival = pending.get(&seqnum)?;
                let arrival_micros =
                    arrival.saturating_duration_since(self.epoch).as_micros() as i64;
                let delta_ticks = ((arrival_micros - last_arrival_micros) / MICROS_PER_DELTA_TICK)
                    .clamp(i16::MIN as i64, i16::MAX as i64);
                // Accumulate the quantized value so rounding errors don't add up.
                last_arrival_micros += delta_ticks * MICROS_PER_DELTA_TICK;
                Some(delta_ticks as i16)
            })
            .collect();

        let feedback_count = self.next_feedback_count;
        self.next_feedback_count = self.next_feedback_count.wrapping_add(1);
        sink(
            self.media_ssrc,
            TransportCcFeedback {
                base_seqnum: min,
                reference_time: U24::truncate(reference_ticks as u32),
                feedback_count,
                deltas,
            },
        );
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use super::*;

    fn collect(receiver: &mut Receiver, packets: &[(u16, Instant)]) -> Vec<TransportCcFeedback> {
        let mut sent = Vec::new();
        for (seqnum, arrival) in packets {
            receiver.on_rtp(1000, *seqnum, *arrival, |ssrc, feedback| {
                assert_eq!(1000, ssrc);
                sent.push(feedback);
            });
        }
        sent
    }

    #[test]
    fn run_length_chunk() {
        use PacketStatus::*;
        assert_eq!(vec![0x2008], encode_status_chunks(&[ReceivedSmallDelta; 8]));
        assert_eq!(vec![0x0007], encode_status_chunks(&[NotReceived; 7]));
        assert_eq!(vec![0x4003], encode_status_chunks(&[ReceivedLargeOrNegativeDelta; 3]));
    }

    #[test]
    fn status_vector_chunks() {
        use PacketStatus::*;
        let alternating = [
            ReceivedSmallDelta,
            NotReceived,
            ReceivedSmallDelta,
            NotReceived,
            ReceivedSmallDelta,
        ];
        assert_eq!(vec![0xAA00], encode_status_chunks(&alternating));

        let with_large = [
            ReceivedSmallDelta,
            ReceivedLargeOrNegativeDelta,
            NotReceived,
        ];
        assert_eq!(vec![0b11_01_10_00_0000_0000], encode_status_chunks(&with_large));

        // A long run after a short one starts its own chunk once the vector is full
        let mut statuses = vec![ReceivedSmallDelta, NotReceived];
        statuses.extend([ReceivedSmallDelta; 20]);
        assert_eq!(
            vec![0b10_10_1111_1111_1111, 0x2008],
            encode_status_chunks(&statuses)
        );
    }

    #[test]
    fn write_and_parse_feedback() {
        let feedback = TransportCcFeedback {
            base_seqnum: 1,
            reference_time: U24::truncate(0),
            feedback_count: 0,
            deltas: vec![Some(0), Some(4), Some(8)],
        };
        let written = feedback.to_vec();
        assert_eq!(hex!("0001 0003 000000 00 2003 000408").to_vec(), written);
        assert_eq!(written.len(), feedback.written_len());
        assert_eq!(feedback, TransportCcFeedback::from_fci(&written).unwrap());

        let feedback = TransportCcFeedback {
            base_seqnum: 0xFFFE,
            reference_time: U24::truncate(2),
            feedback_count: 7,
            deltas: vec![Some(1), None, Some(-4), Some(300), None],
        };
        let written = feedback.to_vec();
        assert_eq!(
            hex!("fffe 0005 000002 07 d280 01 fffc 012c").to_vec(),
            written
        );
        assert_eq!(written.len(), feedback.written_len());
        let parsed = TransportCcFeedback::from_fci(&written).unwrap();
        assert_eq!(feedback, parsed);
        assert_eq!(3, parsed.received_count());
        assert_eq!(
            vec![
                (0xFFFE, 128_000 + 250),
                (0, 128_000 + 250 - 1000),
                (1, 128_000 + 250 - 1000 + 75_000)
            ],
            parsed.arrivals().collect::<Vec<_>>()
        );
    }

    #[test]
    fn parse_invalid_feedback() {
        assert_eq!(
            Err(ParseError::InvalidTransportCc("truncated")),
            TransportCcFeedback::from_fci(&hex!("0001 0003 000000"))
        );
        // Missing deltas
        assert_eq!(
            Err(ParseError::InvalidTransportCc("truncated")),
            TransportCcFeedback::from_fci(&hex!("0001 0003 000000 00 2003 0004"))
        );
        // Run of the reserved status
        assert_eq!(
            Err(ParseError::InvalidTransportCc("reserved packet status")),
            TransportCcFeedback::from_fci(&hex!("0001 0003 000000 00 6003"))
        );
    }

    #[test]
    fn feedback_after_max_pending() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = Receiver::new(now, 20, Duration::from_millis(256));

        let packets: Vec<(u16, Instant)> = (1..=19).map(|i| (i, at(i as u64))).collect();
        assert!(collect(&mut receiver, &packets).is_empty());
        assert_eq!(19, receiver.pending_count());

        let sent = collect(&mut receiver, &[(21, at(21))]);
        assert_eq!(1, sent.len());
        let feedback = &sent[0];
        assert_eq!(1, feedback.base_seqnum);
        assert_eq!(0, feedback.feedback_count);
        assert_eq!(U24::truncate(0), feedback.reference_time);
        assert_eq!(21, feedback.deltas.len());
        assert_eq!(Some(4), feedback.deltas[0]);
        assert_eq!(None, feedback.deltas[19]);
        assert_eq!(Some(8), feedback.deltas[20]);
        assert_eq!(0, receiver.pending_count());
        assert_eq!(None, receiver.next_deadline());

        let packets: Vec<(u16, Instant)> = (22..=41).map(|i| (i, at(i as u64))).collect();
        let sent = collect(&mut receiver, &packets);
        assert_eq!(1, sent[0].feedback_count);
    }

    #[test]
    fn feedback_after_max_span() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = Receiver::new(now, 20, Duration::from_millis(256));

        assert!(collect(&mut receiver, &[(5, at(100)), (6, at(200))]).is_empty());
        assert_eq!(Some(at(356)), receiver.next_deadline());
        let sent = collect(&mut receiver, &[(7, at(356))]);
        assert_eq!(1, sent.len());
        // 100ms rounds down to one 64ms tick; the first delta covers the other 36ms.
        assert_eq!(U24::truncate(1), sent[0].reference_time);
        assert_eq!(vec![Some(144), Some(400), Some(624)], sent[0].deltas);
    }

    #[test]
    fn tick_flushes_at_deadline() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = Receiver::new(now, 20, Duration::from_millis(256));
        assert!(collect(&mut receiver, &[(5, at(0))]).is_empty());

        let mut sent = Vec::new();
        receiver.tick(at(255), |_, feedback| sent.push(feedback));
        assert!(sent.is_empty());
        receiver.tick(at(256), |_, feedback| sent.push(feedback));
        assert_eq!(1, sent.len());
        receiver.tick(at(1000), |_, feedback| sent.push(feedback));
        assert_eq!(1, sent.len());
    }

    #[test]
    fn seqnum_conditions() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = Receiver::new(now, 20, Duration::from_millis(256));

        // Reordered and repeated
        assert!(collect(&mut receiver, &[(10, at(0)), (8, at(1)), (10, at(2))]).is_empty());
        assert_eq!(2, receiver.pending_count());

        // Jumped
        assert!(collect(&mut receiver, &[(10 + 0x8000, at(3))]).is_empty());
        assert_eq!(2, receiver.pending_count());

        let mut sent = Vec::new();
        receiver.flush(|_, feedback| sent.push(feedback));
        assert_eq!(8, sent[0].base_seqnum);
        assert_eq!(vec![Some(4), None, Some(-4)], sent[0].deltas);

        // Looped
        assert!(collect(&mut receiver, &[(0xFFF0, at(4))]).is_empty());
        let sent = collect(&mut receiver, &[(2, at(5))]);
        assert_eq!(1, sent.len());
        assert_eq!(0xFFF0, sent[0].base_seqnum);
        assert_eq!(1, sent[0].deltas.len());
        assert_eq!(1, receiver.pending_count());
    }
}
