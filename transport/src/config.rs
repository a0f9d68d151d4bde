//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration options for the transport engine.

use clap::Parser;
use rtc_common::Duration;

/// Options for every transport, set by command line arguments or left at their defaults.
/// An embedding server can `#[clap(flatten)]` these into its own options.
#[derive(Parser, Debug, Clone)]
#[clap(name = "rtc_transport")]
pub struct Config {
    /// How long a packet after a gap may wait for the gap to fill before the gap is
    /// skipped (ms).
    #[clap(long, default_value = "100")]
    pub reorder_window_ms: u64,

    /// The most packets a reorder buffer holds before it skips a gap regardless of the
    /// window.
    #[clap(long, default_value = "1024")]
    pub reorder_max_buffered: usize,

    /// Received packet buffers kept for reuse across all streams of a transport.
    #[clap(long, default_value = "4096")]
    pub packet_pool_size: usize,

    /// The least time between NACKs for the same seqnum (ms). The effective interval
    /// is the larger of this and the round trip time.
    #[clap(long, default_value = "100")]
    pub nack_min_retry_interval_ms: u64,

    /// How long a missing seqnum is requested before giving up on it (ms).
    #[clap(long, default_value = "3000")]
    pub nack_max_age_ms: u64,

    /// How many times a missing seqnum is requested before giving up on it.
    #[clap(long, default_value = "10")]
    pub nack_max_retries: u8,

    /// The most missing seqnums tracked per stream; the oldest are dropped first.
    #[clap(long, default_value = "1024")]
    pub nack_max_pending: usize,

    /// How long sent packets are kept for retransmission, in media time (ms).
    #[clap(long, default_value = "10000")]
    pub retransmission_buffer_ms: u64,

    /// The most sent packets kept for retransmission per track.
    #[clap(long, default_value = "1024")]
    pub retransmission_buffer_packets: usize,

    /// Amount of time without any RTP, RTCP, or DTLS before a transport shuts down (seconds).
    /// Checked every half interval.
    #[clap(long, default_value = "15")]
    pub inactivity_timeout_secs: u64,

    /// Interval between keyframe requests (PLI) on received video tracks (ms).
    #[clap(long, default_value = "2000")]
    pub keyframe_request_interval_ms: u64,

    /// Interval between RTCP sender/receiver reports (ms).
    #[clap(long, default_value = "5000")]
    pub rtcp_report_interval_ms: u64,

    /// Transport-cc feedback is sent once this many arrivals are pending.
    #[clap(long, default_value = "20")]
    pub twcc_max_pending: usize,

    /// Transport-cc feedback is sent once pending arrivals span this long (ms).
    #[clap(long, default_value = "256")]
    pub twcc_max_span_ms: u64,

    /// Send REMB instead of negotiating transport-cc.
    #[clap(long)]
    pub use_remb: bool,

    /// The estimate sent in REMB messages (bps).
    #[clap(long, default_value = "2000000")]
    pub remb_bitrate_bps: u64,

    /// Timer tick period for housekeeping on each transport (ms).
    #[clap(long, default_value = "20")]
    pub tick_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["rtc_transport"])
    }
}

impl Config {
    pub fn reorder_window(&self) -> Duration {
        Duration::from_millis(self.reorder_window_ms)
    }

    pub fn nack_min_retry_interval(&self) -> Duration {
        Duration::from_millis(self.nack_min_retry_interval_ms)
    }

    pub fn nack_max_age(&self) -> Duration {
        Duration::from_millis(self.nack_max_age_ms)
    }

    pub fn retransmission_buffer_duration(&self) -> Duration {
        Duration::from_millis(self.retransmission_buffer_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn keyframe_request_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_request_interval_ms)
    }

    pub fn rtcp_report_interval(&self) -> Duration {
        Duration::from_millis(self.rtcp_report_interval_ms)
    }

    pub fn twcc_max_span(&self) -> Duration {
        Duration::from_millis(self.twcc_max_span_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
