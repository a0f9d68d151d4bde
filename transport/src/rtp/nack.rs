//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use byteorder::{ReadBytesExt, BE};
use log::*;
use rtc_common::{Duration, Instant, KeySortedCache, Writer};

use super::types::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingNack {
    first_missed: Instant,
    last_sent: Option<Instant>,
    retry_count: u8,
}

/// Tracks the seqnums missing from a received stream and decides when to request them again.
///
/// The tracker needs a timer only while something is pending; see [`NackTracker::next_deadline`].
#[derive(Debug)]
pub struct NackTracker {
    limit: usize,
    min_retry_interval: Duration,
    max_age: Duration,
    max_retries: u8,
    rtt: Duration,
    pending_by_seqnum: KeySortedCache<FullSequenceNumber, PendingNack>,
    max_received: Option<FullSequenceNumber>,
}

impl NackTracker {
    pub fn new(
        limit: usize,
        min_retry_interval: Duration,
        max_age: Duration,
        max_retries: u8,
    ) -> Self {
        Self {
            limit,
            min_retry_interval,
            max_age,
            max_retries,
            rtt: Duration::ZERO,
            pending_by_seqnum: KeySortedCache::new(limit),
            max_received: None,
        }
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    fn retry_interval(&self) -> Duration {
        std::cmp::max(self.min_retry_interval, self.rtt)
    }

    /// Call for every packet that arrives, including retransmissions.
    pub fn remember_received(&mut self, seqnum: FullSequenceNumber, now: Instant) {
        use std::cmp::Ordering::*;

        let Some(max_received) = &mut self.max_received else {
            // This is the first seqnum, so there is nothing to NACK and it's the max.
            self.max_received = Some(seqnum);
            return;
        };
        match seqnum.cmp(max_received) {
            Equal => {}
            Less => {
                if self.pending_by_seqnum.remove(&seqnum).is_some() {
                    trace!("recovered seqnum {}", seqnum);
                }
            }
            Greater => {
                let prev_max_received = std::mem::replace(max_received, seqnum);
                let mut missing_range = prev_max_received.saturating_add(1)..seqnum;
                let missing_count = missing_range.end - missing_range.start;
                if missing_count > (self.limit as u64) {
                    // Everything pending is older than what we're about to insert.
                    event!("rtc.nack.pending_evicted", self.pending_by_seqnum.len());
                    self.pending_by_seqnum.clear();
                    missing_range = (missing_range.end - (self.limit as u64))..missing_range.end;
                }
                let pending = PendingNack {
                    first_missed: now,
                    last_sent: None,
                    retry_count: 0,
                };
                for missing_seqnum in missing_range {
                    if self.pending_by_seqnum.insert(missing_seqnum, pending).is_some() {
                        event!("rtc.nack.pending_evicted");
                    }
                }
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        !self.pending_by_seqnum.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_by_seqnum.len()
    }

    /// When [`NackTracker::send_nacks`] should next be called, or None if nothing is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        let retry_interval = self.retry_interval();
        self.pending_by_seqnum
            .iter()
            .map(|(_, pending)| {
                let retry_at = pending.last_sent.unwrap_or(pending.first_missed) + retry_interval;
                std::cmp::min(retry_at, pending.first_missed + self.max_age)
            })
            .min()
    }

    /// Returns the seqnums to NACK now, in order. Expired entries are dropped.
    pub fn send_nacks(&mut self, now: Instant) -> Vec<FullSequenceNumber> {
        let retry_interval = self.retry_interval();
        let max_age = self.max_age;
        let max_retries = self.max_retries;
        let mut to_send = Vec::new();
        self.pending_by_seqnum.retain(|seqnum, pending| {
            if now.saturating_duration_since(pending.first_missed) >= max_age
                || pending.retry_count >= max_retries
            {
                event!("rtc.nack.expired");
                return false;
            }
            let reference = pending.last_sent.unwrap_or(pending.first_missed);
            if now.saturating_duration_since(reference) >= retry_interval {
                pending.last_sent = Some(now);
                pending.retry_count += 1;
                to_send.push(*seqnum);
            }
            true
        });
        to_send
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    /// The media SSRC the seqnums belong to.
    pub ssrc: Ssrc,
    pub seqnums: Vec<TruncatedSequenceNumber>,
}

/// Parses the NACK FCI, starting at the media SSRC.
pub fn parse_nack(rtcp_payload: &[u8]) -> std::io::Result<Nack> {
    let mut reader = rtcp_payload;
    let ssrc = reader.read_u32::<BE>()?;
    let mut seqnums = Vec::new();
    while !reader.is_empty() {
        let first_seqnum = reader.read_u16::<BE>()?;
        let mask = reader.read_u16::<BE>()?;
        let entry_seqnums =
            std::iter::once(first_seqnum).chain((0..16u16).filter_map(move |index| {
                if mask & (1 << index) != 0 {
                    Some(first_seqnum.wrapping_add(index + 1))
                } else {
                    None
                }
            }));
        seqnums.extend(entry_seqnums);
    }
    Ok(Nack { ssrc, seqnums })
}

/// Packs seqnums into (pid, blp) items. An item covers its pid and the 15 seqnums after it,
/// counted with wraparound; only dense when the seqnums come in order.
pub fn write_nack(
    ssrc: Ssrc,
    mut seqnums: impl Iterator<Item = TruncatedSequenceNumber>,
) -> impl Writer {
    let mut items: Vec<(TruncatedSequenceNumber, u16)> = vec![];
    if let Some(mut first_seqnum) = seqnums.next() {
        let mut mask = 0u16;
        for seqnum in seqnums {
            let diff = seqnum.wrapping_sub(first_seqnum);
            if (1..16).contains(&diff) {
                mask |= 1 << (diff - 1);
            } else {
                items.push((first_seqnum, mask));
                first_seqnum = seqnum;
                mask = 0u16;
            }
        }
        items.push((first_seqnum, mask))
    }
    (ssrc, items)
}

impl Writer for Nack {
    fn written_len(&self) -> usize {
        write_nack(self.ssrc, self.seqnums.iter().copied()).written_len()
    }

    fn write(&self, out: &mut dyn rtc_common::Writable) {
        write_nack(self.ssrc, self.seqnums.iter().copied()).write(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_write_parse_nack() {
        assert!(parse_nack(&[]).is_err());
        // invalid SSRC
        assert!(parse_nack(&[1u8, 2, 3]).is_err());
        // invalid nack item
        assert!(parse_nack(&[1u8, 2, 3, 4, 5]).is_err());

        let ssrc = 0x1020304;
        let seqnums = vec![0, 1, 3, 8, 16];
        let payload = vec![1u8, 2, 3, 4, 0, 0, 0, 0x85, 0, 16, 0, 0];
        assert_eq!(payload, write_nack(ssrc, seqnums.iter().copied()).to_vec());
        assert_eq!(Nack { ssrc, seqnums }, parse_nack(&payload).unwrap());

        // 20 consecutive losses need two items
        let seqnums: Vec<TruncatedSequenceNumber> = (100..120).collect();
        let payload = vec![1u8, 2, 3, 4, 0, 100, 0x7F, 0xFF, 0, 116, 0b0000_0000, 0b0000_0111];
        assert_eq!(payload, write_nack(ssrc, seqnums.iter().copied()).to_vec());
        assert_eq!(Nack { ssrc, seqnums }, parse_nack(&payload).unwrap());
    }

    #[test]
    fn offset_16_starts_a_new_item() {
        let ssrc = 7;
        let seqnums = vec![100, 102, 105, 116];
        let payload = vec![0u8, 0, 0, 7, 0, 100, 0b0000_0000, 0b0001_0010, 0, 116, 0, 0];
        assert_eq!(payload, write_nack(ssrc, seqnums.iter().copied()).to_vec());
        assert_eq!(Nack { ssrc, seqnums }, parse_nack(&payload).unwrap());

        // A peer may still set the last bit.
        assert_eq!(
            vec![100, 116],
            parse_nack(&[0, 0, 0, 7, 0, 100, 0x80, 0x00]).unwrap().seqnums
        );
    }

    #[test]
    fn nack_rollover() {
        let ssrc = 0x1020304;
        let nack = Nack {
            ssrc,
            seqnums: vec![0xFFFF, 0, 1],
        };
        let payload = [1u8, 2, 3, 4, 0xFF, 0xFF, 0b0000_0000, 0b0000_0011];
        assert_eq!(payload.to_vec(), nack.to_vec());
        assert_eq!(nack, parse_nack(&payload).unwrap());

        let nack = Nack {
            ssrc,
            seqnums: vec![65534, 65535, 0, 1],
        };
        let payload = [1u8, 2, 3, 4, 0xFF, 0xFE, 0b0000_0000, 0b0000_0111];
        assert_eq!(payload.to_vec(), nack.to_vec());
        assert_eq!(nack, parse_nack(&payload).unwrap());
    }

    #[test]
    fn tracker_waits_for_the_retry_interval() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut tracker = NackTracker::new(5, Duration::from_millis(100), Duration::from_secs(3), 10);

        assert!(!tracker.is_armed());
        assert_eq!(None, tracker.next_deadline());

        tracker.remember_received(3, at(0));
        tracker.remember_received(4, at(10));
        assert!(!tracker.is_armed());

        // 5 went missing
        tracker.remember_received(6, at(20));
        assert!(tracker.is_armed());
        assert_eq!(Some(at(120)), tracker.next_deadline());
        assert!(tracker.send_nacks(at(60)).is_empty());

        // A merely reordered packet never gets NACKed.
        tracker.remember_received(5, at(70));
        assert!(!tracker.is_armed());
        assert_eq!(None, tracker.next_deadline());
        assert!(tracker.send_nacks(at(200)).is_empty());

        tracker.remember_received(9, at(200));
        assert_eq!(vec![7, 8], tracker.send_nacks(at(300)));
        assert!(tracker.send_nacks(at(350)).is_empty());
        assert_eq!(Some(at(400)), tracker.next_deadline());
        assert_eq!(vec![7, 8], tracker.send_nacks(at(400)));

        // Retransmission arrives
        tracker.remember_received(7, at(410));
        assert_eq!(vec![8], tracker.send_nacks(at(500)));
    }

    #[test]
    fn tracker_uses_rtt_when_larger() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut tracker = NackTracker::new(5, Duration::from_millis(20), Duration::from_secs(3), 10);
        tracker.set_rtt(Duration::from_millis(200));

        tracker.remember_received(1, at(0));
        tracker.remember_received(3, at(0));
        assert!(tracker.send_nacks(at(100)).is_empty());
        assert_eq!(vec![2], tracker.send_nacks(at(200)));
        assert!(tracker.send_nacks(at(300)).is_empty());
        assert_eq!(vec![2], tracker.send_nacks(at(400)));
    }

    #[test]
    fn tracker_expires_entries() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut tracker = NackTracker::new(5, Duration::from_millis(100), Duration::from_secs(3), 10);

        tracker.remember_received(1, at(0));
        tracker.remember_received(3, at(0));
        tracker.remember_received(6, at(2000));
        assert_eq!(vec![2], tracker.send_nacks(at(100)));
        assert_eq!(vec![2, 4, 5], tracker.send_nacks(at(2100)));

        // 2 is too old now
        assert_eq!(vec![4, 5], tracker.send_nacks(at(3000)));
        assert!(tracker.pending_by_seqnum.get(&2).is_none());

        assert_eq!(vec![4, 5], tracker.send_nacks(at(4000)));
        assert!(tracker.send_nacks(at(5000)).is_empty());
        assert!(!tracker.is_armed());
    }

    #[test]
    fn tracker_limits_retries_and_history() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut tracker = NackTracker::new(5, Duration::from_millis(100), Duration::from_secs(3), 3);

        tracker.remember_received(1, at(0));
        tracker.remember_received(3, at(0));
        for i in 1..=3 {
            assert_eq!(vec![2], tracker.send_nacks(at(i * 100)));
        }
        assert!(tracker.send_nacks(at(400)).is_empty());
        assert!(!tracker.is_armed());

        // Only the most recent gaps are kept.
        tracker.remember_received(100, at(500));
        assert_eq!(5, tracker.pending_count());
        assert_eq!(vec![95, 96, 97, 98, 99], tracker.send_nacks(at(600)));

        tracker.remember_received(102, at(600));
        assert_eq!(5, tracker.pending_count());
        assert_eq!(vec![96, 97, 98, 99, 101], tracker.send_nacks(at(700)));
    }
}
