//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Negotiated media tracks and the tables routing packets to them.

use std::collections::{hash_map::Entry, HashMap};

use log::*;
use rtc_common::{expand_seqnum, Instant, KeySortedCache};
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::{
    config::Config,
    jitter::{JitterChannel, PacketPool},
    rtp::{
        ClockRate, ExtensionMap, FullSequenceNumber, Packet, PayloadType, ReceiverRtt, SendStats,
        Ssrc, TruncatedSequenceNumber,
    },
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("SSRC {0} is used by more than one stream")]
    DuplicateSsrc(Ssrc),
    #[error("payload type {0} is used by more than one stream")]
    DuplicatePayloadType(PayloadType),
    #[error("mid {0:?} is used by more than one track")]
    DuplicateMid(String),
    #[error("no track with mid {0:?}")]
    UnknownMid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// The direction of a track from our side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

impl Direction {
    pub fn sends(self) -> bool {
        matches!(self, Self::SendOnly | Self::SendRecv)
    }

    pub fn receives(self) -> bool {
        matches!(self, Self::RecvOnly | Self::SendRecv)
    }

    /// Our direction for a track the peer offered as `self`, limited to what we support.
    pub fn answer(self, supported: Direction) -> Self {
        match (
            self.receives() && supported.sends(),
            self.sends() && supported.receives(),
        ) {
            (true, true) => Self::SendRecv,
            (true, false) => Self::SendOnly,
            (false, true) => Self::RecvOnly,
            (false, false) => Self::Inactive,
        }
    }
}

/// A stream the peer sends on a track. Either SSRC may be unknown until packets arrive,
/// in which case the rid (or repaired rid) extension identifies the stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub ssrc: Option<Ssrc>,
    pub rtx_ssrc: Option<Ssrc>,
    pub rid: Option<String>,
}

/// What negotiation decided about one media section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackDescription {
    pub mid: String,
    pub kind: MediaKind,
    pub direction: Direction,
    pub clock_rate: ClockRate,
    pub payload_type: PayloadType,
    pub rtx_payload_type: Option<PayloadType>,
    pub local_ssrc: Ssrc,
    pub local_rtx_ssrc: Option<Ssrc>,
    pub remote_streams: Vec<RemoteStream>,
    pub extensions: ExtensionMap,
    pub nack: bool,
    pub pli: bool,
    pub transport_cc: bool,
    pub remb: bool,
}

/// Recently sent packets, kept for answering NACKs.
struct RetransmissionBuffer {
    max_span: u32,
    packets: KeySortedCache<FullSequenceNumber, Packet<Vec<u8>>>,
}

impl RetransmissionBuffer {
    fn new(config: &Config, clock_rate: ClockRate) -> Self {
        let max_span = (config.retransmission_buffer_duration().as_millis() as u64
            * clock_rate as u64
            / 1000)
            .min(u32::MAX as u64 / 2) as u32;
        Self {
            max_span,
            packets: KeySortedCache::new(config.retransmission_buffer_packets),
        }
    }

    fn insert(&mut self, seqnum: FullSequenceNumber, packet: Packet<Vec<u8>>) {
        let newest_timestamp = packet.timestamp;
        self.packets.insert(seqnum, packet);
        while let Some((&oldest_seqnum, oldest)) = self.packets.first_key_value() {
            if newest_timestamp.wrapping_sub(oldest.timestamp) <= self.max_span {
                break;
            }
            self.packets.remove(&oldest_seqnum);
        }
    }

    fn get(&self, seqnum: FullSequenceNumber) -> Option<&Packet<Vec<u8>>> {
        self.packets.get(&seqnum)
    }

    fn len(&self) -> usize {
        self.packets.len()
    }
}

pub struct MediaTrack {
    description: TrackDescription,
    send_stats: SendStats,
    receiver_rtt: ReceiverRtt,
    sent: RetransmissionBuffer,
    send_max_seqnum: Option<FullSequenceNumber>,
    next_rtx_seqnum: FullSequenceNumber,
    channels: HashMap<Option<String>, JitterChannel>,
    pub(crate) last_keyframe_request: Option<Instant>,
}

impl MediaTrack {
    pub fn new(description: TrackDescription, config: &Config) -> Self {
        Self {
            send_stats: SendStats::new(description.clock_rate),
            receiver_rtt: ReceiverRtt::default(),
            sent: RetransmissionBuffer::new(config, description.clock_rate),
            send_max_seqnum: None,
            next_rtx_seqnum: rand::random::<u16>() as FullSequenceNumber,
            channels: HashMap::new(),
            last_keyframe_request: None,
            description,
        }
    }

    pub fn description(&self) -> &TrackDescription {
        &self.description
    }

    pub fn mid(&self) -> &str {
        &self.description.mid
    }

    pub fn kind(&self) -> MediaKind {
        self.description.kind
    }

    pub fn send_stats(&self) -> &SendStats {
        &self.send_stats
    }

    pub fn send_stats_mut(&mut self) -> &mut SendStats {
        &mut self.send_stats
    }

    pub fn receiver_rtt(&self) -> &ReceiverRtt {
        &self.receiver_rtt
    }

    pub fn receiver_rtt_mut(&mut self) -> &mut ReceiverRtt {
        &mut self.receiver_rtt
    }

    /// The reorder channel for a received stream, created on first use.
    pub fn channel_mut(
        &mut self,
        rid: Option<&str>,
        config: &Config,
        pool: &PacketPool,
    ) -> &mut JitterChannel {
        let description = &self.description;
        self.channels
            .entry(rid.map(String::from))
            .or_insert_with(|| {
                debug!("new receive channel for mid {} rid {:?}", description.mid, rid);
                JitterChannel::new(
                    rid.map(String::from),
                    description.clock_rate,
                    description.nack,
                    config,
                    pool.clone(),
                )
            })
    }

    pub fn channels(&self) -> impl Iterator<Item = &JitterChannel> {
        self.channels.values()
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut JitterChannel> {
        self.channels.values_mut()
    }

    /// The channel whose primary stream is `ssrc`.
    pub fn channel_by_ssrc_mut(&mut self, ssrc: Ssrc) -> Option<&mut JitterChannel> {
        self.channels
            .values_mut()
            .find(|channel| channel.ssrc() == Some(ssrc))
    }

    /// Records an outgoing packet for statistics and retransmission. Returns its
    /// extended seqnum, which the SRTP IV needs.
    pub fn remember_sent(&mut self, packet: &Packet<Vec<u8>>, now: Instant) -> FullSequenceNumber {
        let max_seqnum = self
            .send_max_seqnum
            .get_or_insert(packet.seqnum as FullSequenceNumber);
        let seqnum = expand_seqnum(packet.seqnum, max_seqnum);
        self.send_stats
            .on_rtp(packet.timestamp, now, packet.payload().len());
        self.sent.insert(seqnum, packet.clone());
        seqnum
    }

    pub fn sent_buffered(&self) -> usize {
        self.sent.len()
    }

    /// Returns the packet to send in answer to a NACK, wrapped as RTX if the track has
    /// an RTX stream, along with the extended seqnum to encrypt it with. None if the packet
    /// is no longer (or never was) buffered.
    pub fn resend(
        &mut self,
        seqnum: TruncatedSequenceNumber,
    ) -> Option<(FullSequenceNumber, Packet<Vec<u8>>)> {
        let mut max_seqnum = self.send_max_seqnum?;
        let full_seqnum = expand_seqnum(seqnum, &mut max_seqnum);
        let packet = self.sent.get(full_seqnum)?;
        match (
            self.description.rtx_payload_type,
            self.description.local_rtx_ssrc,
        ) {
            (Some(rtx_payload_type), Some(rtx_ssrc)) => {
                let rtx_seqnum = self.next_rtx_seqnum;
                self.next_rtx_seqnum += 1;
                Some((
                    rtx_seqnum,
                    packet.to_rtx(
                        rtx_payload_type,
                        rtx_ssrc,
                        rtx_seqnum as TruncatedSequenceNumber,
                    ),
                ))
            }
            _ => Some((full_seqnum, packet.clone())),
        }
    }
}

/// Where a received packet goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub track: usize,
    pub is_rtx: bool,
    pub rid: Option<String>,
}

/// The tracks of one negotiated session and the SSRC and payload type tables routing
/// received packets to them.
pub struct TrackRegistry {
    tracks: Vec<MediaTrack>,
    route_by_ssrc: HashMap<Ssrc, Route>,
    route_by_payload_type: HashMap<PayloadType, (usize, bool)>,
    local_ssrcs: HashMap<Ssrc, usize>,
}

impl TrackRegistry {
    pub fn new(descriptions: Vec<TrackDescription>, config: &Config) -> Result<Self, RegistryError> {
        let mut registry = Self {
            tracks: Vec::with_capacity(descriptions.len()),
            route_by_ssrc: HashMap::new(),
            route_by_payload_type: HashMap::new(),
            local_ssrcs: HashMap::new(),
        };
        for description in descriptions {
            if registry.tracks.iter().any(|track| track.mid() == description.mid) {
                return Err(RegistryError::DuplicateMid(description.mid));
            }
            let index = registry.tracks.len();

            for (payload_type, is_rtx) in std::iter::once((description.payload_type, false))
                .chain(description.rtx_payload_type.map(|pt| (pt, true)))
            {
                if registry
                    .route_by_payload_type
                    .insert(payload_type, (index, is_rtx))
                    .is_some()
                {
                    return Err(RegistryError::DuplicatePayloadType(payload_type));
                }
            }

            for ssrc in std::iter::once(description.local_ssrc).chain(description.local_rtx_ssrc)
            {
                if registry.local_ssrcs.insert(ssrc, index).is_some() {
                    return Err(RegistryError::DuplicateSsrc(ssrc));
                }
            }

            for stream in &description.remote_streams {
                for (ssrc, is_rtx) in [(stream.ssrc, false), (stream.rtx_ssrc, true)] {
                    if let Some(ssrc) = ssrc {
                        registry.insert_route(
                            ssrc,
                            Route {
                                track: index,
                                is_rtx,
                                rid: stream.rid.clone(),
                            },
                        )?;
                    }
                }
            }
            registry.tracks.push(MediaTrack::new(description, config));
        }
        Ok(registry)
    }

    fn insert_route(&mut self, ssrc: Ssrc, route: Route) -> Result<(), RegistryError> {
        match self.route_by_ssrc.entry(ssrc) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateSsrc(ssrc)),
            Entry::Vacant(entry) => {
                entry.insert(route);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter()
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut MediaTrack> {
        self.tracks.iter_mut()
    }

    pub fn track_mut(&mut self, index: usize) -> Option<&mut MediaTrack> {
        self.tracks.get_mut(index)
    }

    pub fn index_of_mid(&self, mid: &str) -> Option<usize> {
        self.tracks.iter().position(|track| track.mid() == mid)
    }

    pub fn track_by_mid_mut(&mut self, mid: &str) -> Result<&mut MediaTrack, RegistryError> {
        self.tracks
            .iter_mut()
            .find(|track| track.mid() == mid)
            .ok_or_else(|| RegistryError::UnknownMid(mid.to_owned()))
    }

    /// The track sending on one of our SSRCs (as named in feedback from the peer).
    pub fn track_by_local_ssrc_mut(&mut self, ssrc: Ssrc) -> Option<&mut MediaTrack> {
        let index = *self.local_ssrcs.get(&ssrc)?;
        self.tracks.get_mut(index)
    }

    /// The track and stream a received packet belongs to. A packet on an SSRC that wasn't
    /// negotiated is matched by payload type and rid (or repaired rid), and the SSRC is
    /// remembered from then on.
    pub fn route<T: std::borrow::Borrow<[u8]>>(&mut self, packet: &Packet<T>) -> Option<Route> {
        if let Some(route) = self.route_by_ssrc.get(&packet.ssrc) {
            return Some(route.clone());
        }

        let (index, is_rtx) = *self.route_by_payload_type.get(&packet.payload_type)?;
        let track = &self.tracks[index];
        let extensions = &track.description.extensions;
        let rid = if is_rtx {
            packet.repaired_rid(extensions).or_else(|| packet.rid(extensions))
        } else {
            packet.rid(extensions)
        };
        let rid = match rid {
            Some(rid) => {
                let known = track
                    .description
                    .remote_streams
                    .iter()
                    .any(|stream| stream.rid.as_deref() == Some(rid));
                if !known {
                    debug!("ignoring unnegotiated rid {:?} on mid {}", rid, track.mid());
                    return None;
                }
                Some(rid.to_owned())
            }
            None => {
                // Without a rid, only a single stream still missing this SSRC can claim it.
                let unclaimed = match track.description.remote_streams.as_slice() {
                    [] => true,
                    [stream] => {
                        stream.rid.is_none()
                            && (if is_rtx { stream.rtx_ssrc } else { stream.ssrc }).is_none()
                    }
                    _ => false,
                };
                let already_learned = self
                    .route_by_ssrc
                    .values()
                    .any(|route| route.track == index && route.is_rtx == is_rtx);
                if !unclaimed || already_learned {
                    return None;
                }
                None
            }
        };
        let route = Route {
            track: index,
            is_rtx,
            rid,
        };
        info!(
            "learned {} SSRC {} for mid {} rid {:?}",
            if is_rtx { "rtx" } else { "primary" },
            packet.ssrc,
            track.mid(),
            route.rid
        );
        self.route_by_ssrc.insert(packet.ssrc, route.clone());
        Some(route)
    }
}
