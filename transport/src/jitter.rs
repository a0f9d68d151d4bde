//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-stream reordering of received RTP, feeding receive statistics and NACKs.

mod pool;

use std::{collections::BTreeMap, sync::Arc};

use log::*;
use rtc_common::{expand_seqnum, Duration, Instant, SystemTime};

pub use pool::{PacketPool, PooledBuffer};

use crate::{
    config::Config,
    rtp::{
        convert_from_ntp, ClockRate, FullSequenceNumber, NackTracker, Packet, ReceiveStats,
        SenderReport, Ssrc, TruncatedTimestamp,
    },
};

/// A received packet in seqnum order. Shared read-only with whoever consumes the stream.
#[derive(Debug)]
pub struct SortedPacket {
    pub seqnum: FullSequenceNumber,
    pub arrival: Instant,
    /// Arrived through the retransmission stream
    pub is_retransmission: bool,
    /// The wall clock time of the RTP timestamp, once a sender report has linked the two.
    pub ntp_time: Option<SystemTime>,
    pub packet: Packet<PooledBuffer>,
}

struct Buffered {
    arrival: Instant,
    is_retransmission: bool,
    packet: Packet<PooledBuffer>,
}

pub struct JitterChannel {
    rid: Option<String>,
    ssrc: Option<Ssrc>,
    clock_rate: ClockRate,
    window: Duration,
    max_buffered: usize,
    pool: PacketPool,

    max_seqnum: Option<FullSequenceNumber>,
    next_to_emit: Option<FullSequenceNumber>,
    buffered: BTreeMap<FullSequenceNumber, Buffered>,

    stats: ReceiveStats,
    nack: Option<NackTracker>,
    // RTP timestamp and wall clock time from the last sender report
    clock_mapping: Option<(TruncatedTimestamp, SystemTime)>,
}

impl JitterChannel {
    pub fn new(
        rid: Option<String>,
        clock_rate: ClockRate,
        nack_enabled: bool,
        config: &Config,
        pool: PacketPool,
    ) -> Self {
        Self {
            rid,
            ssrc: None,
            clock_rate,
            window: config.reorder_window(),
            max_buffered: config.reorder_max_buffered,
            pool,
            max_seqnum: None,
            next_to_emit: None,
            buffered: BTreeMap::new(),
            stats: ReceiveStats::new(clock_rate),
            nack: nack_enabled.then(|| {
                NackTracker::new(
                    config.nack_max_pending,
                    config.nack_min_retry_interval(),
                    config.nack_max_age(),
                    config.nack_max_retries,
                )
            }),
            clock_mapping: None,
        }
    }

    pub fn rid(&self) -> Option<&str> {
        self.rid.as_deref()
    }

    /// The primary SSRC of the stream, once a packet has arrived on it.
    pub fn ssrc(&self) -> Option<Ssrc> {
        self.ssrc
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ReceiveStats {
        &mut self.stats
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    /// Takes a plaintext RTP packet (already restored from RTX if `is_retransmission`)
    /// and returns whatever is now ready in order.
    pub fn input_rtp(
        &mut self,
        bytes: &[u8],
        is_retransmission: bool,
        now: Instant,
    ) -> Vec<Arc<SortedPacket>> {
        let Some(packet) = Packet::parse(self.pool.checkout(bytes)) else {
            event!("rtc.jitter.invalid_rtp");
            debug!("Dropping unparsable RTP of {} bytes", bytes.len());
            return vec![];
        };
        if !is_retransmission {
            self.ssrc = Some(packet.ssrc);
        }

        let max_seqnum = self.max_seqnum.get_or_insert(packet.seqnum as FullSequenceNumber);
        let seqnum = expand_seqnum(packet.seqnum, max_seqnum);

        if let Some(nack) = &mut self.nack {
            nack.remember_received(seqnum, now);
        }

        if matches!(self.next_to_emit, Some(next) if seqnum < next)
            || self.buffered.contains_key(&seqnum)
        {
            event!("rtc.jitter.late_or_duplicate");
            trace!("Dropping late or duplicate seqnum {}", seqnum);
            return vec![];
        }
        self.next_to_emit.get_or_insert(seqnum);
        self.buffered.insert(
            seqnum,
            Buffered {
                arrival: now,
                is_retransmission,
                packet,
            },
        );
        self.drain(now)
    }

    /// Emits packets whose gap has outlasted the reorder window.
    pub fn tick(&mut self, now: Instant) -> Vec<Arc<SortedPacket>> {
        self.drain(now)
    }

    /// The next time `tick` may have something to emit.
    pub fn next_deadline(&self) -> Option<Instant> {
        let (_, first) = self.buffered.first_key_value()?;
        Some(first.arrival + self.window)
    }

    pub fn nack_deadline(&self) -> Option<Instant> {
        self.nack.as_ref()?.next_deadline()
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        if let Some(nack) = &mut self.nack {
            nack.set_rtt(rtt);
        }
    }

    /// The seqnums due for a NACK, truncated for the wire.
    pub fn send_nacks(&mut self, now: Instant) -> Vec<FullSequenceNumber> {
        match &mut self.nack {
            Some(nack) => nack.send_nacks(now),
            None => vec![],
        }
    }

    pub fn on_sender_report(&mut self, sender_report: &SenderReport, now: Instant) {
        self.stats.on_sender_report(sender_report, now);
        let info = &sender_report.sender_info;
        self.clock_mapping = Some((info.rtp_ts, convert_from_ntp(info.ntp_ts)));
    }

    fn ntp_time(&self, timestamp: TruncatedTimestamp) -> Option<SystemTime> {
        let (mapped_timestamp, mapped_time) = self.clock_mapping?;
        if self.clock_rate == 0 {
            return None;
        }
        let ticks = timestamp.wrapping_sub(mapped_timestamp) as i32;
        let offset =
            Duration::from_micros(ticks.unsigned_abs() as u64 * 1_000_000 / self.clock_rate as u64);
        Some(if ticks >= 0 {
            mapped_time + offset
        } else {
            mapped_time - offset
        })
    }

    fn drain(&mut self, now: Instant) -> Vec<Arc<SortedPacket>> {
        let mut sorted = Vec::new();
        loop {
            let Some((&first_seqnum, first)) = self.buffered.first_key_value() else {
                break;
            };
            let next = self.next_to_emit.unwrap_or(first_seqnum);
            if first_seqnum != next {
                let overflowing = self.buffered.len() > self.max_buffered;
                let waited_too_long = now.saturating_duration_since(first.arrival) >= self.window;
                if !overflowing && !waited_too_long {
                    break;
                }
                event!("rtc.jitter.gap_skipped", (first_seqnum - next) as usize);
                debug!(
                    "Skipping {} missing seqnums before {} (rid: {:?})",
                    first_seqnum - next,
                    first_seqnum,
                    self.rid
                );
            }
            if let Some((seqnum, buffered)) = self.buffered.pop_first() {
                self.next_to_emit = Some(seqnum + 1);
                sorted.push(Arc::new(self.emit(seqnum, buffered)));
            }
        }
        sorted
    }

    fn emit(&mut self, seqnum: FullSequenceNumber, buffered: Buffered) -> SortedPacket {
        let Buffered {
            arrival,
            is_retransmission,
            packet,
        } = buffered;
        // Retransmissions only fill gaps; counting them would hide the loss.
        if !is_retransmission {
            self.stats
                .on_rtp(seqnum, packet.timestamp, arrival, packet.payload().len());
        }
        SortedPacket {
            seqnum,
            arrival,
            is_retransmission,
            ntp_time: self.ntp_time(packet.timestamp),
            packet,
        }
    }
}
