//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-stream statistics behind RTCP sender and receiver reports.

use std::collections::VecDeque;

use rtc_common::{Duration, Instant, SystemTime, U24};

use super::{
    rtcp::{
        calculate_dlsr, convert_to_ntp, dlsr_to_duration, get_lsr, DlrrItem, ReportBlock,
        SenderInfo, SenderReport, XrBlock,
    },
    types::*,
};

/// How many sent sender reports (or reference times) are remembered for matching the
/// answers that come back.
const SENT_SENDER_REPORTS_TO_REMEMBER: usize = 8;

/// Our NTP timestamps as sent in reports, by their middle 32 bits.
#[derive(Debug, Default)]
struct SentTimestamps(VecDeque<(u32, Instant)>);

impl SentTimestamps {
    fn remember(&mut self, ntp_ts: u64, now: Instant) {
        if self.0.len() == SENT_SENDER_REPORTS_TO_REMEMBER {
            self.0.pop_front();
        }
        self.0.push_back((get_lsr(ntp_ts), now));
    }

    /// The time since the echoed timestamp was sent, less the delay the peer held it.
    fn round_trip(&self, echoed: u32, delay: u32, now: Instant) -> Option<Duration> {
        if echoed == 0 {
            return None;
        }
        let (_, sent) = self.0.iter().find(|(lsr, _)| *lsr == echoed)?;
        Some(
            now.saturating_duration_since(*sent)
                .saturating_sub(dlsr_to_duration(delay)),
        )
    }
}

/// Packet loss over some span of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LossReport {
    pub expected: u64,
    pub lost: u64,
    /// Lost over expected, in units of 1/256 (the RTCP "fraction lost").
    pub fraction_lost: u8,
}

impl LossReport {
    fn new(expected: u64, received: u64) -> Self {
        let lost = expected.saturating_sub(received);
        let fraction_lost = if expected == 0 {
            0
        } else {
            (lost * 256 / expected).min(u8::MAX as u64) as u8
        };
        Self {
            expected,
            lost,
            fraction_lost,
        }
    }

    pub fn percent_lost(&self) -> f64 {
        if self.expected == 0 {
            0.0
        } else {
            self.lost as f64 * 100.0 / self.expected as f64
        }
    }
}

/// Receive-side statistics of one RTP stream: loss, interarrival jitter and the last
/// sender report seen.
#[derive(Debug)]
pub struct ReceiveStats {
    clock_rate: ClockRate,
    base_seqnum: Option<FullSequenceNumber>,
    max_seqnum: FullSequenceNumber,
    received_packets: u64,
    received_bytes: u64,
    // Both measured at the last report
    expected_in_last: u64,
    received_in_last: u64,
    // The first arrival; later arrivals are converted to RTP units relative to it.
    epoch: Option<Instant>,
    last_transit: Option<u32>,
    jitter_q4: u32,
    last_sender_report: Option<(u64, Instant)>,
}

impl ReceiveStats {
    pub fn new(clock_rate: ClockRate) -> Self {
        Self {
            clock_rate,
            base_seqnum: None,
            max_seqnum: 0,
            received_packets: 0,
            received_bytes: 0,
            expected_in_last: 0,
            received_in_last: 0,
            epoch: None,
            last_transit: None,
            jitter_q4: 0,
            last_sender_report: None,
        }
    }

    pub fn on_rtp(
        &mut self,
        seqnum: FullSequenceNumber,
        timestamp: TruncatedTimestamp,
        arrival: Instant,
        payload_len: usize,
    ) {
        match self.base_seqnum {
            None => {
                self.base_seqnum = Some(seqnum);
                self.max_seqnum = seqnum;
            }
            Some(base) if seqnum < base => {
                // Reordered ahead of the first packet we saw
                self.base_seqnum = Some(seqnum);
            }
            Some(_) => {
                self.max_seqnum = self.max_seqnum.max(seqnum);
            }
        }
        self.received_packets += 1;
        self.received_bytes += payload_len as u64;
        self.update_jitter(timestamp, arrival);
    }

    // J(i) = J(i-1) + (|D(i-1,i)| - J(i-1))/16, kept in Q4 fixed point
    fn update_jitter(&mut self, timestamp: TruncatedTimestamp, arrival: Instant) {
        let epoch = *self.epoch.get_or_insert(arrival);
        let arrival_rtp = (arrival.saturating_duration_since(epoch).as_micros() as u64
            * self.clock_rate as u64
            / 1_000_000) as u32;
        let transit = arrival_rtp.wrapping_sub(timestamp);
        if let Some(last_transit) = self.last_transit {
            let d = (transit.wrapping_sub(last_transit) as i32).unsigned_abs();
            // Skip jumps of more than 10 seconds; those are stream restarts, not jitter.
            if d < 10 * self.clock_rate {
                let jitter_diff_q4 = ((d << 4) as i64) - self.jitter_q4 as i64;
                self.jitter_q4 = (self.jitter_q4 as i64 + ((jitter_diff_q4 + 8) >> 4)) as u32;
            }
        }
        self.last_transit = Some(transit);
    }

    pub fn on_sender_report(&mut self, sender_report: &SenderReport, now: Instant) {
        let ntp_ts = sender_report.sender_info.ntp_ts;
        // Ignore reordered sender reports
        if matches!(self.last_sender_report, Some((last_ntp_ts, _)) if ntp_ts <= last_ntp_ts) {
            return;
        }
        self.last_sender_report = Some((ntp_ts, now));
    }

    /// The interarrival jitter in RTP timestamp units
    pub fn jitter(&self) -> u32 {
        self.jitter_q4 >> 4
    }

    pub fn jitter_duration(&self) -> Duration {
        if self.clock_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.jitter() as u64 * 1_000_000 / self.clock_rate as u64)
    }

    pub fn received_packets(&self) -> u64 {
        self.received_packets
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn max_seqnum(&self) -> Option<FullSequenceNumber> {
        self.base_seqnum.map(|_| self.max_seqnum)
    }

    fn expected(&self) -> u64 {
        match self.base_seqnum {
            Some(base) => self.max_seqnum - base + 1,
            None => 0,
        }
    }

    /// Loss over the lifetime of the stream
    pub fn cumulative_loss(&self) -> LossReport {
        LossReport::new(self.expected(), self.received_packets)
    }

    /// Loss since the previous call, used for the report block's fraction lost.
    pub fn take_interval_loss(&mut self) -> LossReport {
        let expected = self.expected();
        let report = LossReport::new(
            expected.saturating_sub(self.expected_in_last),
            self.received_packets.saturating_sub(self.received_in_last),
        );
        self.expected_in_last = expected;
        self.received_in_last = self.received_packets;
        report
    }

    /// Returns None until the first packet has been received.
    pub fn create_report_block(&mut self, ssrc: Ssrc, now: Instant) -> Option<ReportBlock> {
        self.base_seqnum?;
        let interval = self.take_interval_loss();
        // Negative cumulative loss is reported as zero; the field is really an i24.
        const MAX_I24: u64 = (1 << 23) - 1;
        let cumulative = self.cumulative_loss();
        let (last_sender_report, delay_last_sender_report) = match self.last_sender_report {
            Some((ntp_ts, received)) => (get_lsr(ntp_ts), calculate_dlsr(received, now)),
            None => (0, 0),
        };
        Some(ReportBlock {
            ssrc,
            fraction_lost: interval.fraction_lost,
            cumulative_lost: U24::saturating_from(cumulative.lost.min(MAX_I24)),
            highest_seqnum: self.max_seqnum as u32,
            jitter: self.jitter(),
            last_sender_report,
            delay_last_sender_report,
        })
    }
}

/// Send-side statistics of one RTP stream: counts for sender reports and the round trip
/// time measured from the report blocks that come back.
#[derive(Debug)]
pub struct SendStats {
    clock_rate: ClockRate,
    packets_sent: u32,
    octets_sent: u32,
    last_sent: Option<(TruncatedTimestamp, Instant)>,
    sent_sender_reports: SentTimestamps,
    // (receiver SSRC, middle 32 bits of its reference time, when it arrived)
    last_reference_time: Option<(Ssrc, u32, Instant)>,
    rtt: Option<Duration>,
}

impl SendStats {
    pub fn new(clock_rate: ClockRate) -> Self {
        Self {
            clock_rate,
            packets_sent: 0,
            octets_sent: 0,
            last_sent: None,
            sent_sender_reports: SentTimestamps::default(),
            last_reference_time: None,
            rtt: None,
        }
    }

    pub fn on_rtp(&mut self, timestamp: TruncatedTimestamp, now: Instant, payload_len: usize) {
        // The counts wrap around
        self.packets_sent = self.packets_sent.wrapping_add(1);
        self.octets_sent = self.octets_sent.wrapping_add(payload_len as u32);
        self.last_sent = Some((timestamp, now));
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets_sent
    }

    pub fn octets_sent(&self) -> u32 {
        self.octets_sent
    }

    /// Returns None if nothing has been sent yet.
    ///
    /// The RTP timestamp is extrapolated from the last sent packet so that it
    /// corresponds to the same instant as the NTP timestamp.
    pub fn create_sender_info(
        &mut self,
        ssrc: Ssrc,
        now: Instant,
        sys_now: SystemTime,
    ) -> Option<SenderInfo> {
        let (last_timestamp, last_sent_time) = self.last_sent?;
        let ntp_ts = convert_to_ntp(sys_now);
        let elapsed = now.saturating_duration_since(last_sent_time).as_micros() as u64
            * self.clock_rate as u64
            / 1_000_000;
        let rtp_ts = last_timestamp.wrapping_add(elapsed as u32);

        self.sent_sender_reports.remember(ntp_ts, now);

        Some(SenderInfo {
            ssrc,
            ntp_ts,
            rtp_ts,
            packet_count: self.packets_sent,
            octet_count: self.octets_sent,
        })
    }

    /// Updates the round trip time from a report block about this stream.
    /// Returns the new estimate, if the block refers to a sender report we remember.
    pub fn on_report_block(&mut self, block: &ReportBlock, now: Instant) -> Option<Duration> {
        let rtt = self.sent_sender_reports.round_trip(
            block.last_sender_report,
            block.delay_last_sender_report,
            now,
        )?;
        self.rtt = Some(rtt);
        Some(rtt)
    }

    /// Remembers a receiver's reference time so the next report can answer it with DLRR.
    pub fn on_receiver_reference_time(&mut self, receiver_ssrc: Ssrc, ntp_ts: u64, now: Instant) {
        self.last_reference_time = Some((receiver_ssrc, get_lsr(ntp_ts), now));
    }

    /// The answer to the last reference time, if there is one not yet answered.
    pub fn take_dlrr(&mut self, now: Instant) -> Option<DlrrItem> {
        let (ssrc, last_receiver_report, received) = self.last_reference_time.take()?;
        Some(DlrrItem {
            ssrc,
            last_receiver_report,
            delay_last_receiver_report: calculate_dlsr(received, now),
        })
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }
}

/// The round trip time of a track we only receive on, which sends no sender reports.
/// Our reference times go out in XR and the media sender echoes them back in DLRR.
#[derive(Debug, Default)]
pub struct ReceiverRtt {
    sent_reference_times: SentTimestamps,
    rtt: Option<Duration>,
}

impl ReceiverRtt {
    pub fn create_reference_time(&mut self, now: Instant, sys_now: SystemTime) -> XrBlock {
        let ntp_ts = convert_to_ntp(sys_now);
        self.sent_reference_times.remember(ntp_ts, now);
        XrBlock::ReceiverReferenceTime { ntp_ts }
    }

    /// Returns the new estimate if the item answers a reference time we remember.
    pub fn on_dlrr(&mut self, item: &DlrrItem, now: Instant) -> Option<Duration> {
        let rtt = self.sent_reference_times.round_trip(
            item.last_receiver_report,
            item.delay_last_receiver_report,
            now,
        )?;
        self.rtt = Some(rtt);
        Some(rtt)
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }
}
