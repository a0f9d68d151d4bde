//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The transport for one peer: session state, datagram dispatch, SRTP, and the periodic
//! RTCP that keeps the peer informed.
//!
//! Everything here is synchronous and driven by whoever owns the transport (see
//! [`crate::event_loop`]): datagrams and negotiation results go in, encrypted datagrams
//! come out through the [`PacketSink`].

pub mod variant;

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use log::*;
use rtc_common::{parse_u32, Duration, Instant, SystemTime};
use strum_macros::{Display, IntoStaticStr};
use thiserror::Error;

pub use variant::{
    Echo, KeyframeAction, MediaSink, MediaSource, Player, Pusher, RecvAction, TransportVariant,
};

use crate::{
    config::Config,
    jitter::{PacketPool, SortedPacket},
    rtp::{
        self, classify_datagram, DatagramKind, ExtendedReport, ExtensionKind, ExtensionMap,
        FullSequenceNumber, KeysAndSalts, Nack, Packet, ReceiverReport, Remb, ReportBlock, RtcpRecord, SdesChunk,
        SenderReport, Ssrc, SrtpMasterKeys, XrBlock, MAX_ITEM_COUNT,
    },
    track::{MediaKind, MediaTrack, TrackDescription, TrackRegistry},
    transportcc,
};

// Transport-wide feedback isn't about any one of our streams, but RTCP needs a sender SSRC.
pub const RTCP_SENDER_SSRC: Ssrc = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, IntoStaticStr)]
pub enum State {
    #[default]
    Created,
    Negotiated,
    SecuringKeys,
    Active,
    ShuttingDown,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ShutdownReason {
    Requested,
    Timeout,
    PeerBye,
    DtlsClosed,
    SocketReleased,
    NegotiationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed {0}")]
    MalformedPacket(&'static str),
    #[error("no route for {0}")]
    UnknownRoute(String),
    #[error("no traffic for {0:?}")]
    ProtocolTimeout(Duration),
    #[error("peer closed the session")]
    PeerInitiatedClose,
    #[error("{0} exhausted")]
    ResourceExhaustion(&'static str),
    #[error("not allowed while {0}")]
    InvalidState(State),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Connectivity checks, owned by the ICE collaborator.
pub trait IceAgent: Send {
    fn handle_stun(&mut self, datagram: &[u8], now: Instant);
}

/// The DTLS handshake (and data channel association) for this transport. Reports back
/// through [`Transport::on_keys_ready`] and [`Transport::on_dtls_closed`].
pub trait DtlsSession: Send {
    fn handle_dtls(&mut self, datagram: &[u8], now: Instant);
}

/// The selected socket tuple.
pub trait PacketSink: Send {
    fn send(&mut self, datagram: Vec<u8>);
}

pub type ShutdownCallback = Box<dyn FnOnce(ShutdownReason) + Send>;

pub struct CreateTransportArgs {
    pub id: String,
    pub config: Config,
    pub variant: Box<dyn TransportVariant>,
    pub ice: Box<dyn IceAgent>,
    pub dtls: Box<dyn DtlsSession>,
    pub socket: Box<dyn PacketSink>,
    pub on_shutdown: ShutdownCallback,
    pub now: Instant,
}

/// The answer to the peer's offer, for the SDP collaborator to render.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub tracks: Vec<TrackDescription>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub state: State,
    pub bytes_received: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub retransmissions_received: u64,
    pub retransmissions_sent: u64,
    pub nacks_sent: u64,
    pub nacks_received: u64,
    pub plis_sent: u64,
    pub plis_received: u64,
}

pub struct Transport {
    id: String,
    config: Config,
    state: State,
    cname: String,

    variant: Box<dyn TransportVariant>,
    ice: Box<dyn IceAgent>,
    dtls: Box<dyn DtlsSession>,
    socket: Box<dyn PacketSink>,
    on_shutdown: Option<ShutdownCallback>,

    pool: PacketPool,
    tracks: Option<TrackRegistry>,
    twcc: Option<transportcc::Receiver>,

    decrypt: Option<KeysAndSalts>,
    encrypt: Option<KeysAndSalts>,
    // Per SSRC, for the SRTP rollover counter
    max_received_seqnums: HashMap<Ssrc, FullSequenceNumber>,
    next_srtcp_index: u32,

    last_activity: Instant,
    next_timeout_check: Instant,
    rtcp_report_sent: Option<Instant>,
    stats: TransportStats,
}

impl Transport {
    pub fn new(args: CreateTransportArgs) -> Self {
        let pool = PacketPool::new(args.config.packet_pool_size);
        let next_timeout_check = args.now + args.config.inactivity_timeout() / 2;
        Self {
            id: args.id,
            config: args.config,
            state: State::Created,
            cname: format!("{:016x}", rand::random::<u64>()),
            variant: args.variant,
            ice: args.ice,
            dtls: args.dtls,
            socket: args.socket,
            on_shutdown: Some(args.on_shutdown),
            pool,
            tracks: None,
            twcc: None,
            decrypt: None,
            encrypt: None,
            max_received_seqnums: HashMap::new(),
            next_srtcp_index: 0,
            last_activity: args.now,
            next_timeout_check,
            rtcp_report_sent: None,
            stats: TransportStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            state: self.state,
            ..self.stats.clone()
        }
    }

    pub fn tracks(&self) -> Option<&TrackRegistry> {
        self.tracks.as_ref()
    }

    fn require_active(&self) -> Result<(), Error> {
        if self.state == State::Active {
            Ok(())
        } else {
            Err(Error::InvalidState(self.state))
        }
    }

    /// Answers the peer's offer. The offered tracks carry the peer's direction; the answer
    /// carries ours. Failing shuts the transport down.
    pub fn negotiate(
        &mut self,
        offered: Vec<TrackDescription>,
        now: Instant,
    ) -> anyhow::Result<NegotiatedSession> {
        if self.state != State::Created {
            return Err(Error::InvalidState(self.state).into());
        }
        match self.build_session(offered, now) {
            Ok(session) => {
                info!(
                    "transport {} ({}) negotiated {} tracks",
                    self.id,
                    self.variant.name(),
                    session.tracks.len()
                );
                self.state = State::Negotiated;
                self.last_activity = now;
                Ok(session)
            }
            Err(err) => {
                warn!("transport {} failed to negotiate: {:#}", self.id, err);
                self.shutdown(ShutdownReason::NegotiationFailed, now);
                Err(err)
            }
        }
    }

    fn build_session(
        &mut self,
        mut tracks: Vec<TrackDescription>,
        now: Instant,
    ) -> anyhow::Result<NegotiatedSession> {
        for track in &mut tracks {
            self.variant.configure(track);
            if self.config.use_remb {
                track.extensions.remove_kind(ExtensionKind::TransportCc);
                track.transport_cc = false;
            } else {
                track.remb = false;
                track.transport_cc &= track.extensions.contains(ExtensionKind::TransportCc);
            }
        }
        self.variant
            .check_session(&tracks)
            .with_context(|| format!("{} can't use the offer", self.variant.name()))?;
        let registry = TrackRegistry::new(tracks.clone(), &self.config)
            .map_err(|err| Error::Negotiation(err.to_string()))
            .context("building SSRC and payload type tables")?;

        self.twcc = tracks.iter().any(|track| track.transport_cc).then(|| {
            transportcc::Receiver::new(
                now,
                self.config.twcc_max_pending,
                self.config.twcc_max_span(),
            )
        });
        self.tracks = Some(registry);
        Ok(NegotiatedSession { tracks })
    }

    /// ICE picked the tuple to use; the DTLS handshake starts on it.
    pub fn on_tuple_selected(&mut self, now: Instant) -> Result<(), Error> {
        match self.state {
            State::Negotiated => {
                info!("transport {} selected a tuple; securing keys", self.id);
                self.state = State::SecuringKeys;
                self.last_activity = now;
                Ok(())
            }
            State::SecuringKeys | State::Active => {
                debug!("transport {} switched tuples", self.id);
                Ok(())
            }
            state => Err(Error::InvalidState(state)),
        }
    }

    pub fn on_keys_ready(&mut self, keys: &SrtpMasterKeys, now: Instant) -> Result<(), Error> {
        if self.state != State::SecuringKeys {
            return Err(Error::InvalidState(self.state));
        }
        let (decrypt, encrypt) = keys.derive();
        self.decrypt = Some(decrypt);
        self.encrypt = Some(encrypt);
        self.state = State::Active;
        self.last_activity = now;
        info!("transport {} is active", self.id);

        let descriptions: Vec<TrackDescription> = self
            .tracks
            .iter()
            .flat_map(|tracks| tracks.tracks())
            .map(|track| track.description().clone())
            .collect();
        self.variant.on_start(&descriptions);
        Ok(())
    }

    pub fn on_dtls_closed(&mut self, now: Instant) {
        info!("transport {} got DTLS close notify", self.id);
        self.shutdown(ShutdownReason::DtlsClosed, now);
    }

    /// The socket tuple is gone, so the transport is too.
    pub fn on_socket_released(&mut self, now: Instant) {
        self.shutdown(ShutdownReason::SocketReleased, now);
        self.state = State::Closed;
    }

    /// Takes anything that arrived on the selected socket.
    pub fn handle_datagram(&mut self, datagram: Vec<u8>, now: Instant) -> Result<(), Error> {
        if matches!(self.state, State::ShuttingDown | State::Closed) {
            event!("rtc.transport.received_while_closed");
            return Err(Error::InvalidState(self.state));
        }
        self.stats.bytes_received += datagram.len() as u64;
        self.stats.packets_received += 1;

        let result = match classify_datagram(&datagram) {
            DatagramKind::Stun => {
                self.ice.handle_stun(&datagram, now);
                Ok(())
            }
            DatagramKind::Dtls => {
                self.last_activity = now;
                self.dtls.handle_dtls(&datagram, now);
                Ok(())
            }
            DatagramKind::Rtp => self
                .require_active()
                .and_then(|_| self.handle_rtp(datagram, now)),
            DatagramKind::Rtcp => self
                .require_active()
                .and_then(|_| self.handle_rtcp(datagram, now)),
            DatagramKind::Unknown => {
                event!("rtc.transport.unknown_datagram");
                debug!(
                    "dropping unrecognized datagram: {}",
                    hex::encode(&datagram[..datagram.len().min(16)])
                );
                Err(Error::MalformedPacket("datagram"))
            }
        };
        if matches!(
            result,
            Err(Error::MalformedPacket(_) | Error::UnknownRoute(_) | Error::InvalidState(_))
        ) {
            self.stats.packets_dropped += 1;
        }
        result
    }

    fn handle_rtp(&mut self, encrypted: Vec<u8>, now: Instant) -> Result<(), Error> {
        let decrypt = self.decrypt.as_ref().ok_or(Error::InvalidState(self.state))?;
        let ssrc = encrypted
            .get(8..12)
            .map(parse_u32)
            .ok_or(Error::MalformedPacket("RTP header"))?;
        let mut max_seqnum = self.max_received_seqnums.get(&ssrc).copied().unwrap_or(0);
        let (_, packet) =
            rtp::decrypt_srtp(encrypted, &mut max_seqnum, &decrypt.rtp).map_err(|err| {
                event!("rtc.srtp.decrypt_failed");
                debug!("dropping RTP from SSRC {}: {}", ssrc, err);
                Error::MalformedPacket("SRTP")
            })?;
        self.last_activity = now;

        let tracks = self.tracks.as_mut().ok_or(Error::InvalidState(self.state))?;
        let Some(route) = tracks.route(&packet) else {
            event!("rtc.rtp.unknown_route");
            debug!(
                "dropping RTP with unknown SSRC {} and payload type {}",
                packet.ssrc, packet.payload_type
            );
            return Err(Error::UnknownRoute(format!(
                "SSRC {} payload type {}",
                packet.ssrc, packet.payload_type
            )));
        };
        self.max_received_seqnums.insert(ssrc, max_seqnum);
        let track = tracks
            .track_mut(route.track)
            .ok_or_else(|| Error::UnknownRoute(format!("track {}", route.track)))?;
        let description = track.description();
        if !description.direction.receives() {
            event!("rtc.rtp.unexpected_direction");
            return Err(Error::UnknownRoute(format!(
                "mid {} doesn't receive",
                description.mid
            )));
        }

        let mut feedback = vec![];
        if description.transport_cc {
            if let (Some(twcc), Some(twcc_seqnum)) = (
                &mut self.twcc,
                packet.transport_cc_seqnum(&description.extensions),
            ) {
                twcc.on_rtp(packet.ssrc, twcc_seqnum, now, |media_ssrc, twcc_feedback| {
                    feedback.push(RtcpRecord::TransportCc {
                        sender_ssrc: RTCP_SENDER_SSRC,
                        media_ssrc,
                        feedback: twcc_feedback,
                    })
                });
            }
        }

        let payload_type = description.payload_type;
        let negotiated_ssrc = description
            .remote_streams
            .iter()
            .find(|stream| stream.rid == route.rid)
            .and_then(|stream| stream.ssrc);
        let channel = track.channel_mut(route.rid.as_deref(), &self.config, &self.pool);
        let sorted = if route.is_rtx {
            self.stats.retransmissions_received += 1;
            match channel.ssrc().or(negotiated_ssrc) {
                Some(primary_ssrc) => match packet.from_rtx(payload_type, primary_ssrc) {
                    Some(restored) => channel.input_rtp(restored.serialized(), true, now),
                    None => {
                        event!("rtc.rtx.padding");
                        vec![]
                    }
                },
                None => {
                    event!("rtc.rtx.unknown_primary");
                    debug!("dropping RTX on SSRC {} before its primary stream", packet.ssrc);
                    vec![]
                }
            }
        } else {
            channel.input_rtp(packet.serialized(), false, now)
        };

        self.deliver(route.track, route.rid.as_deref(), sorted, now);
        self.send_rtcp(&feedback);
        Ok(())
    }

    fn deliver(
        &mut self,
        track_index: usize,
        rid: Option<&str>,
        sorted: Vec<Arc<SortedPacket>>,
        now: Instant,
    ) {
        if sorted.is_empty() {
            return;
        }
        let Some(track) = self
            .tracks
            .as_mut()
            .and_then(|tracks| tracks.track_mut(track_index))
        else {
            return;
        };
        let extensions = track.description().extensions.clone();
        let mut echoes = vec![];
        for packet in sorted {
            if self
                .variant
                .on_sorted_rtp(track.description(), rid, packet.clone())
                == RecvAction::Echo
            {
                echoes.push(packet.packet.to_owned());
            }
        }
        for echo in echoes {
            if let Err(err) = self.send_on_track(track_index, echo, &extensions, now) {
                debug!("failed to echo RTP: {}", err);
            }
        }
    }

    /// Sends media from the local source on the track negotiated as `mid`. The SSRC and
    /// payload type are rewritten to the track's, and header extensions from the ids in
    /// `extensions` (the source's table) to the track's.
    pub fn send_rtp(
        &mut self,
        mid: &str,
        packet: Packet<Vec<u8>>,
        extensions: &ExtensionMap,
        now: Instant,
    ) -> Result<(), Error> {
        self.require_active()?;
        let index = self
            .tracks
            .as_ref()
            .and_then(|tracks| tracks.index_of_mid(mid))
            .ok_or_else(|| Error::UnknownRoute(format!("mid {}", mid)))?;
        self.send_on_track(index, packet, extensions, now)
    }

    fn send_on_track(
        &mut self,
        index: usize,
        packet: Packet<Vec<u8>>,
        extensions: &ExtensionMap,
        now: Instant,
    ) -> Result<(), Error> {
        let encrypt = self.encrypt.as_ref().ok_or(Error::InvalidState(self.state))?;
        let track = self
            .tracks
            .as_mut()
            .and_then(|tracks| tracks.track_mut(index))
            .ok_or_else(|| Error::UnknownRoute(format!("track {}", index)))?;
        let description = track.description();
        if !description.direction.sends() {
            return Err(Error::UnknownRoute(format!(
                "mid {} doesn't send",
                description.mid
            )));
        }
        let mut packet = if packet.extensions().next().is_some() {
            packet.with_translated_extensions(extensions, &description.extensions)
        } else {
            packet
        };
        packet.set_ssrc_in_header(description.local_ssrc);
        packet.set_payload_type_in_header(description.payload_type);
        let seqnum = track.remember_sent(&packet, now);
        let encrypted = packet.encrypt(seqnum, &encrypt.rtp).map_err(|err| {
            event!("rtc.srtp.encrypt_failed");
            warn!("failed to encrypt RTP: {}", err);
            Error::MalformedPacket("outgoing RTP")
        })?;
        self.send_datagram(encrypted);
        Ok(())
    }

    /// Asks the peer for a keyframe on every stream it sends on `mid`.
    pub fn request_keyframe(&mut self, mid: &str, now: Instant) -> Result<(), Error> {
        self.require_active()?;
        let track = self
            .tracks
            .as_mut()
            .ok_or(Error::InvalidState(self.state))?
            .track_by_mid_mut(mid)
            .map_err(|err| Error::UnknownRoute(err.to_string()))?;
        let requests = keyframe_requests(track, now);
        self.stats.plis_sent += requests.len() as u64;
        self.send_rtcp(&requests);
        Ok(())
    }

    fn handle_rtcp(&mut self, mut encrypted: Vec<u8>, now: Instant) -> Result<(), Error> {
        let decrypt = self.decrypt.as_ref().ok_or(Error::InvalidState(self.state))?;
        let len = rtp::decrypt_rtcp_in_place(&mut encrypted, &decrypt.rtcp).map_err(|err| {
            event!("rtc.srtcp.decrypt_failed");
            debug!("dropping RTCP: {}", err);
            Error::MalformedPacket("SRTCP")
        })?;
        self.last_activity = now;

        let records = rtp::parse_compound(&encrypted[..len]);
        if records.is_empty() {
            return Err(Error::MalformedPacket("RTCP"));
        }
        let mut peer_said_bye = false;
        for record in records {
            match record {
                RtcpRecord::SenderReport(sender_report) => {
                    if let Some(channel) = self.tracks.as_mut().and_then(|tracks| {
                        tracks
                            .tracks_mut()
                            .find_map(|track| track.channel_by_ssrc_mut(sender_report.ssrc()))
                    }) {
                        channel.on_sender_report(&sender_report, now);
                    }
                    self.on_report_blocks(&sender_report.report_blocks, now);
                }
                RtcpRecord::ReceiverReport(receiver_report) => {
                    self.on_report_blocks(&receiver_report.report_blocks, now);
                }
                RtcpRecord::SourceDescription(chunks) => {
                    for chunk in chunks {
                        trace!("SSRC {} has CNAME {:?}", chunk.ssrc, chunk.get_cname());
                    }
                }
                RtcpRecord::Goodbye(bye) => {
                    info!(
                        "transport {} got BYE for {:?} ({:?})",
                        self.id, bye.ssrcs, bye.reason
                    );
                    peer_said_bye = true;
                }
                RtcpRecord::PictureLossIndication { media_ssrc, .. } => {
                    self.on_keyframe_request(media_ssrc, now);
                }
                RtcpRecord::FullIntraRequest { entries, .. } => {
                    for entry in entries {
                        self.on_keyframe_request(entry.ssrc, now);
                    }
                }
                RtcpRecord::Nack { nack, .. } => {
                    self.stats.nacks_received += 1;
                    self.resend(nack, now);
                }
                RtcpRecord::Remb { remb, .. } => {
                    debug!("peer estimates {} bps for {:?}", remb.bitrate_bps, remb.ssrcs);
                }
                RtcpRecord::TransportCc { feedback, .. } => {
                    trace!(
                        "peer acknowledged {} packets from seqnum {}",
                        feedback.received_count(),
                        feedback.base_seqnum
                    );
                }
                RtcpRecord::Tmmbr { entries, .. } => {
                    debug!("ignoring TMMBR {:?}", entries);
                }
                RtcpRecord::SliceLossIndication { media_ssrc, .. } => {
                    debug!("ignoring SLI for SSRC {}", media_ssrc);
                }
                RtcpRecord::ExtendedReport(report) => {
                    self.on_extended_report(report, now);
                }
            }
        }

        if peer_said_bye {
            self.shutdown(ShutdownReason::PeerBye, now);
            return Err(Error::PeerInitiatedClose);
        }
        Ok(())
    }

    fn on_report_blocks(&mut self, blocks: &[ReportBlock], now: Instant) {
        let Some(tracks) = self.tracks.as_mut() else {
            return;
        };
        let mut rtt = None;
        for block in blocks {
            if let Some(track) = tracks.track_by_local_ssrc_mut(block.ssrc) {
                rtt = track.send_stats_mut().on_report_block(block, now).or(rtt);
            }
        }
        if let Some(rtt) = rtt {
            self.set_rtt(rtt);
        }
    }

    // Reference times are answered in the next report; answers to ours give the RTT of
    // tracks we only receive on.
    fn on_extended_report(&mut self, report: ExtendedReport, now: Instant) {
        let Some(tracks) = self.tracks.as_mut() else {
            return;
        };
        let mut rtt = None;
        for block in report.blocks {
            match block {
                XrBlock::ReceiverReferenceTime { ntp_ts } => {
                    for track in tracks
                        .tracks_mut()
                        .filter(|track| track.description().direction.sends())
                    {
                        track.send_stats_mut().on_receiver_reference_time(
                            report.sender_ssrc,
                            ntp_ts,
                            now,
                        );
                    }
                }
                XrBlock::Dlrr(items) => {
                    for item in items {
                        if let Some(track) = tracks.track_by_local_ssrc_mut(item.ssrc) {
                            rtt = track.receiver_rtt_mut().on_dlrr(&item, now).or(rtt);
                        }
                    }
                }
            }
        }
        if let Some(rtt) = rtt {
            self.set_rtt(rtt);
        }
    }

    fn set_rtt(&mut self, rtt: Duration) {
        trace!("transport {} rtt is {:?}", self.id, rtt);
        if let Some(tracks) = self.tracks.as_mut() {
            for channel in tracks.tracks_mut().flat_map(|track| track.channels_mut()) {
                channel.set_rtt(rtt);
            }
        }
    }

    fn on_keyframe_request(&mut self, media_ssrc: Ssrc, now: Instant) {
        let Some(track) = self
            .tracks
            .as_mut()
            .and_then(|tracks| tracks.track_by_local_ssrc_mut(media_ssrc))
        else {
            event!("rtc.rtcp.keyframe_request_for_unknown_ssrc");
            debug!("ignoring keyframe request for SSRC {}", media_ssrc);
            return;
        };
        self.stats.plis_received += 1;
        if self.variant.on_keyframe_request(track.mid()) == KeyframeAction::RequestFromPeer {
            let requests = keyframe_requests(track, now);
            self.stats.plis_sent += requests.len() as u64;
            self.send_rtcp(&requests);
        }
    }

    fn resend(&mut self, nack: Nack, now: Instant) {
        let (Some(encrypt), Some(track)) = (
            self.encrypt.as_ref(),
            self.tracks
                .as_mut()
                .and_then(|tracks| tracks.track_by_local_ssrc_mut(nack.ssrc)),
        ) else {
            debug!("ignoring NACK for SSRC {}", nack.ssrc);
            return;
        };
        let mut datagrams = vec![];
        for seqnum in nack.seqnums {
            let Some((full_seqnum, packet)) = track.resend(seqnum) else {
                event!("rtc.nack.not_buffered");
                debug!(
                    "ignoring NACK for (SSRC, seqnum) that is too old or never sent: ({}, {})",
                    nack.ssrc, seqnum
                );
                continue;
            };
            match packet.encrypt(full_seqnum, &encrypt.rtp) {
                Ok(encrypted) => datagrams.push(encrypted),
                Err(err) => warn!("failed to encrypt retransmission: {}", err),
            }
        }
        trace!("resending {} packets at {:?}", datagrams.len(), now);
        self.stats.retransmissions_sent += datagrams.len() as u64;
        for datagram in datagrams {
            self.send_datagram(datagram);
        }
    }

    /// Periodic housekeeping: the inactivity timeout, timed-out reorder gaps, NACKs,
    /// transport-cc feedback, reports and keyframe requests.
    pub fn tick(&mut self, now: Instant) -> Result<(), Error> {
        if matches!(
            self.state,
            State::Created | State::ShuttingDown | State::Closed
        ) {
            return Ok(());
        }

        if now >= self.next_timeout_check {
            self.next_timeout_check = now + self.config.inactivity_timeout() / 2;
            let idle = now.saturating_duration_since(self.last_activity);
            if idle >= self.config.inactivity_timeout() {
                event!("rtc.transport.timeout");
                info!("transport {} inactive for {:?}", self.id, idle);
                self.shutdown(ShutdownReason::Timeout, now);
                return Err(Error::ProtocolTimeout(idle));
            }
        }
        if self.state != State::Active {
            return Ok(());
        }

        let Some(tracks) = self.tracks.as_mut() else {
            return Ok(());
        };
        let mut sorted_by_track = vec![];
        let mut feedback = vec![];
        let mut keyframe_request_records = vec![];
        let keyframe_request_interval = self.config.keyframe_request_interval();
        for (index, track) in tracks.tracks_mut().enumerate() {
            let local_ssrc = track.description().local_ssrc;
            for channel in track.channels_mut() {
                let sorted = channel.tick(now);
                if !sorted.is_empty() {
                    sorted_by_track.push((index, channel.rid().map(String::from), sorted));
                }
                let Some(media_ssrc) = channel.ssrc() else {
                    continue;
                };
                let seqnums = channel.send_nacks(now);
                if !seqnums.is_empty() {
                    self.stats.nacks_sent += 1;
                    feedback.push(RtcpRecord::Nack {
                        sender_ssrc: local_ssrc,
                        nack: Nack {
                            ssrc: media_ssrc,
                            seqnums: seqnums.into_iter().map(|seqnum| seqnum as u16).collect(),
                        },
                    });
                }
            }

            let due = track
                .last_keyframe_request
                .map_or(true, |last| now >= last + keyframe_request_interval);
            if track.kind() == MediaKind::Video && due {
                keyframe_request_records.extend(keyframe_requests(track, now));
            }
        }
        if let Some(twcc) = &mut self.twcc {
            twcc.tick(now, |media_ssrc, twcc_feedback| {
                feedback.push(RtcpRecord::TransportCc {
                    sender_ssrc: RTCP_SENDER_SSRC,
                    media_ssrc,
                    feedback: twcc_feedback,
                })
            });
        }
        self.stats.plis_sent += keyframe_request_records.len() as u64;
        feedback.extend(keyframe_request_records);

        let reports = if self
            .rtcp_report_sent
            .map_or(true, |sent| now >= sent + self.config.rtcp_report_interval())
        {
            self.rtcp_report_sent = Some(now);
            self.create_reports(now, SystemTime::now())
        } else {
            vec![]
        };

        for (index, rid, sorted) in sorted_by_track {
            self.deliver(index, rid.as_deref(), sorted, now);
        }
        self.send_rtcp(&feedback);
        for report in reports {
            self.send_rtcp(&report);
        }
        Ok(())
    }

    /// One compound per track: a sender report if it has sent anything (otherwise a
    /// receiver report), the CNAME, REMB when that's in use, and an extended report with a
    /// reference time (receive-only tracks) or the answer to the peer's.
    fn create_reports(&mut self, now: Instant, sys_now: SystemTime) -> Vec<Vec<RtcpRecord>> {
        let Some(tracks) = self.tracks.as_mut() else {
            return vec![];
        };
        let mut reports = vec![];
        for track in tracks.tracks_mut() {
            let description = track.description();
            let local_ssrc = description.local_ssrc;
            let send_remb = self.config.use_remb && description.remb;

            let report_blocks: Vec<ReportBlock> = track
                .channels_mut()
                .filter_map(|channel| {
                    let ssrc = channel.ssrc()?;
                    channel.stats_mut().create_report_block(ssrc, now)
                })
                .take(MAX_ITEM_COUNT)
                .collect();
            let remote_ssrcs: Vec<Ssrc> = report_blocks.iter().map(|block| block.ssrc).collect();

            let report = match track
                .send_stats_mut()
                .create_sender_info(local_ssrc, now, sys_now)
            {
                Some(sender_info) => RtcpRecord::SenderReport(SenderReport {
                    sender_info,
                    report_blocks,
                }),
                None if !report_blocks.is_empty() => {
                    RtcpRecord::ReceiverReport(ReceiverReport {
                        sender_ssrc: local_ssrc,
                        report_blocks,
                    })
                }
                None => continue,
            };
            let mut xr_blocks = vec![];
            if matches!(report, RtcpRecord::ReceiverReport(_)) {
                xr_blocks.push(track.receiver_rtt_mut().create_reference_time(now, sys_now));
            }
            if let Some(item) = track.send_stats_mut().take_dlrr(now) {
                xr_blocks.push(XrBlock::Dlrr(vec![item]));
            }
            let mut compound = vec![
                report,
                RtcpRecord::SourceDescription(vec![SdesChunk::cname(local_ssrc, &self.cname)]),
            ];
            if send_remb && !remote_ssrcs.is_empty() {
                compound.push(RtcpRecord::Remb {
                    sender_ssrc: local_ssrc,
                    remb: Remb {
                        bitrate_bps: self.config.remb_bitrate_bps,
                        ssrcs: remote_ssrcs,
                    },
                });
            }
            if !xr_blocks.is_empty() {
                compound.push(RtcpRecord::ExtendedReport(ExtendedReport {
                    sender_ssrc: local_ssrc,
                    blocks: xr_blocks,
                }));
            }
            reports.push(compound);
        }
        reports
    }

    /// When [`Transport::tick`] should next run.
    pub fn next_wakeup(&self, now: Instant) -> Instant {
        let mut wakeup = now + self.config.tick_interval();
        if let Some(tracks) = &self.tracks {
            for channel in tracks.tracks().flat_map(|track| track.channels()) {
                for deadline in [channel.next_deadline(), channel.nack_deadline()]
                    .into_iter()
                    .flatten()
                {
                    wakeup = wakeup.min(deadline);
                }
            }
        }
        if let Some(deadline) = self.twcc.as_ref().and_then(|twcc| twcc.next_deadline()) {
            wakeup = wakeup.min(deadline);
        }
        wakeup.max(now + Duration::MILLISECOND)
    }

    /// Starts tearing down. Only the first call does anything; it says BYE if the session
    /// was up and reports the reason to the shutdown callback.
    pub fn shutdown(&mut self, reason: ShutdownReason, now: Instant) {
        if matches!(self.state, State::ShuttingDown | State::Closed) {
            return;
        }
        let was_active = self.state == State::Active;
        self.state = State::ShuttingDown;
        info!("transport {} shutting down: {}", self.id, reason);
        event!("rtc.transport.shutdown");

        if was_active && reason != ShutdownReason::SocketReleased {
            let ssrcs: Vec<Ssrc> = self
                .tracks
                .iter()
                .flat_map(|tracks| tracks.tracks())
                .map(|track| track.description().local_ssrc)
                .take(MAX_ITEM_COUNT)
                .collect();
            if let Some(&first_ssrc) = ssrcs.first() {
                trace!("saying BYE at {:?}", now);
                self.send_rtcp(&[
                    RtcpRecord::ReceiverReport(ReceiverReport {
                        sender_ssrc: first_ssrc,
                        report_blocks: vec![],
                    }),
                    RtcpRecord::Goodbye(rtp::Goodbye {
                        ssrcs,
                        reason: Some(reason.to_string()),
                    }),
                ]);
            }
        }
        if let Some(on_shutdown) = self.on_shutdown.take() {
            on_shutdown(reason);
        }
    }

    fn send_rtcp(&mut self, records: &[RtcpRecord]) {
        if records.is_empty() {
            return;
        }
        let Some(encrypt) = &self.encrypt else {
            return;
        };
        let compound = rtp::serialize_compound(records);
        match rtp::encrypt_rtcp(compound, self.next_srtcp_index, &encrypt.rtcp) {
            Ok(encrypted) => {
                self.next_srtcp_index += 1;
                self.send_datagram(encrypted);
            }
            Err(err) => {
                event!("rtc.srtcp.encrypt_failed");
                warn!(
                    "transport {} failed to send RTCP: {}",
                    self.id,
                    if err == rtp::CryptoError::IndexExhausted {
                        Error::ResourceExhaustion("SRTCP index").to_string()
                    } else {
                        err.to_string()
                    }
                );
            }
        }
    }

    fn send_datagram(&mut self, datagram: Vec<u8>) {
        self.stats.bytes_sent += datagram.len() as u64;
        self.stats.packets_sent += 1;
        self.socket.send(datagram);
    }
}

/// PLIs for every stream the peer sends on the track, if the peer accepts them.
fn keyframe_requests(track: &mut MediaTrack, now: Instant) -> Vec<RtcpRecord> {
    let description = track.description();
    if !description.pli || !description.direction.receives() {
        return vec![];
    }
    let sender_ssrc = description.local_ssrc;
    let requests: Vec<RtcpRecord> = track
        .channels()
        .filter_map(|channel| channel.ssrc())
        .map(|media_ssrc| RtcpRecord::PictureLossIndication {
            sender_ssrc,
            media_ssrc,
        })
        .collect();
    if !requests.is_empty() {
        track.last_keyframe_request = Some(now);
    }
    requests
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;
    use rtc_common::Writer;

    use super::*;
    use crate::{
        rtp::{new_master_keys, DlrrItem, Goodbye, Nack},
        track::{test::video_track, Direction, RemoteStream},
    };

    #[derive(Clone, Default)]
    struct Outbox(Arc<Mutex<Vec<Vec<u8>>>>);

    impl PacketSink for Outbox {
        fn send(&mut self, datagram: Vec<u8>) {
            self.0.lock().push(datagram);
        }
    }

    #[derive(Clone, Default)]
    struct Counter(Arc<Mutex<usize>>);

    impl IceAgent for Counter {
        fn handle_stun(&mut self, _datagram: &[u8], _now: Instant) {
            *self.0.lock() += 1;
        }
    }

    impl DtlsSession for Counter {
        fn handle_dtls(&mut self, _datagram: &[u8], _now: Instant) {
            *self.0.lock() += 1;
        }
    }

    #[derive(Clone, Default)]
    struct Received(Arc<Mutex<Vec<(String, Option<String>, u16)>>>);

    impl MediaSink for Received {
        fn on_sorted_rtp(&mut self, mid: &str, rid: Option<&str>, packet: Arc<SortedPacket>) {
            self.0.lock().push((
                mid.to_owned(),
                rid.map(String::from),
                packet.packet.seqnum,
            ));
        }
    }

    impl Received {
        fn seqnums(&self) -> Vec<u16> {
            self.0.lock().iter().map(|(_, _, seqnum)| *seqnum).collect()
        }
    }

    /// The peer's side: encrypts what it sends and decrypts what the transport sends.
    struct Peer {
        decrypt: KeysAndSalts,
        encrypt: KeysAndSalts,
        srtcp_index: u32,
        max_seqnums: HashMap<Ssrc, FullSequenceNumber>,
    }

    impl Peer {
        fn rtp(&self, payload_type: u8, seqnum: u16, ssrc: Ssrc, payload: &[u8]) -> Vec<u8> {
            Packet::new(payload_type, seqnum, seqnum as u32 * 3000, ssrc, payload)
                .encrypt(seqnum as u64, &self.encrypt.rtp)
                .unwrap()
        }

        fn rtcp(&mut self, records: &[RtcpRecord]) -> Vec<u8> {
            self.srtcp_index += 1;
            rtp::encrypt_rtcp(
                rtp::serialize_compound(records),
                self.srtcp_index,
                &self.encrypt.rtcp,
            )
            .unwrap()
        }

        fn open(&mut self, outbox: &Outbox) -> (Vec<Packet<Vec<u8>>>, Vec<RtcpRecord>) {
            let mut media = vec![];
            let mut records = vec![];
            for mut datagram in outbox.0.lock().drain(..) {
                match classify_datagram(&datagram) {
                    DatagramKind::Rtp => {
                        let ssrc = parse_u32(&datagram[8..12]);
                        let max = self.max_seqnums.entry(ssrc).or_default();
                        let (_, packet) =
                            rtp::decrypt_srtp(datagram, max, &self.decrypt.rtp).unwrap();
                        media.push(packet);
                    }
                    DatagramKind::Rtcp => {
                        let len =
                            rtp::decrypt_rtcp_in_place(&mut datagram, &self.decrypt.rtcp).unwrap();
                        records.extend(rtp::parse_compound(&datagram[..len]));
                    }
                    kind => panic!("unexpected {} datagram", kind),
                }
            }
            (media, records)
        }
    }

    struct Setup {
        transport: Transport,
        peer: Peer,
        outbox: Outbox,
        shutdowns: Arc<Mutex<Vec<ShutdownReason>>>,
        dtls: Counter,
        ice: Counter,
    }

    fn setup(
        config: Config,
        variant: Box<dyn TransportVariant>,
        offered: Vec<TrackDescription>,
        now: Instant,
    ) -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();
        let outbox = Outbox::default();
        let shutdowns = Arc::new(Mutex::new(vec![]));
        let ice = Counter::default();
        let dtls = Counter::default();
        let mut transport = Transport::new(CreateTransportArgs {
            id: "test".to_owned(),
            config,
            variant,
            ice: Box::new(ice.clone()),
            dtls: Box::new(dtls.clone()),
            socket: Box::new(outbox.clone()),
            on_shutdown: {
                let shutdowns = shutdowns.clone();
                Box::new(move |reason| shutdowns.lock().push(reason))
            },
            now,
        });
        assert_eq!(State::Created, transport.state());
        transport.negotiate(offered, now).unwrap();
        assert_eq!(State::Negotiated, transport.state());
        transport.on_tuple_selected(now).unwrap();
        assert_eq!(State::SecuringKeys, transport.state());

        let (server_keys, client_keys) = new_master_keys(1);
        transport.on_keys_ready(&server_keys, now).unwrap();
        assert_eq!(State::Active, transport.state());
        let (decrypt, encrypt) = client_keys.derive();
        Setup {
            transport,
            peer: Peer {
                decrypt,
                encrypt,
                srtcp_index: 0,
                max_seqnums: HashMap::new(),
            },
            outbox,
            shutdowns,
            dtls,
            ice,
        }
    }

    fn offered_video() -> TrackDescription {
        TrackDescription {
            direction: Direction::SendOnly,
            ..video_track("0")
        }
    }

    fn nacked_seqnums(records: &[RtcpRecord]) -> Vec<u16> {
        records
            .iter()
            .flat_map(|record| match record {
                RtcpRecord::Nack { nack, .. } => nack.seqnums.clone(),
                _ => vec![],
            })
            .collect()
    }

    #[test]
    fn reorders_nacks_and_recovers_through_rtx() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let config = Config {
            reorder_window_ms: 100,
            nack_min_retry_interval_ms: 50,
            ..Config::default()
        };
        let received = Received::default();
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(
            config,
            Box::new(Pusher::new(Box::new(received.clone()))),
            vec![offered_video()],
            now,
        );

        // Seqnum 3 is 50ms late.
        for (seqnum, millis) in [(1, 0), (2, 10), (4, 30), (5, 40), (3, 80)] {
            transport
                .handle_datagram(peer.rtp(96, seqnum, 1000, b"video"), at(millis))
                .unwrap();
            transport.tick(at(millis)).unwrap();
        }
        transport.tick(at(90)).unwrap();
        assert_eq!(vec![1, 2, 3, 4, 5], received.seqnums());
        let (_, records) = peer.open(&outbox);
        assert!(nacked_seqnums(&records).is_empty());
        // The first tick with a stream asks for a keyframe.
        assert!(records.contains(&RtcpRecord::PictureLossIndication {
            sender_ssrc: 2000,
            media_ssrc: 1000
        }));

        // Seqnum 6 never arrives.
        transport
            .handle_datagram(peer.rtp(96, 7, 1000, b"video"), at(100))
            .unwrap();
        transport.tick(at(120)).unwrap();
        assert_eq!(Vec::<u16>::new(), nacked_seqnums(&peer.open(&outbox).1));
        transport.tick(at(150)).unwrap();
        assert_eq!(vec![6], nacked_seqnums(&peer.open(&outbox).1));
        assert_eq!(1, transport.stats().nacks_sent);

        let original = Packet::new(96, 6, 18000, 1000, b"video");
        let rtx = original
            .to_rtx(97, 1001, 1)
            .encrypt(1, &peer.encrypt.rtp)
            .unwrap();
        transport.handle_datagram(rtx, at(170)).unwrap();
        assert_eq!(vec![1, 2, 3, 4, 5, 6, 7], received.seqnums());

        // Nothing is left to NACK, and the retransmission isn't counted as received media.
        transport.tick(at(300)).unwrap();
        assert!(nacked_seqnums(&peer.open(&outbox).1).is_empty());
        let tracks = transport.tracks().unwrap();
        let channel = tracks.tracks().next().unwrap().channels().next().unwrap();
        assert_eq!(6, channel.stats().received_packets());
        assert_eq!(Some(7), channel.stats().max_seqnum());
        assert_eq!(1, transport.stats().retransmissions_received);
    }

    #[test]
    fn echo_sends_media_back_and_answers_nacks() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(Config::default(), Box::new(Echo), vec![video_track("0")], now);

        for seqnum in 1..=3 {
            transport
                .handle_datagram(peer.rtp(96, seqnum, 1000, b"hello"), at(seqnum as u64))
                .unwrap();
        }
        let (media, _) = peer.open(&outbox);
        assert_eq!(3, media.len());
        assert!(media.iter().all(|packet| packet.ssrc == 2000));
        assert_eq!(b"hello", media[1].payload());

        let nack = peer.rtcp(&[RtcpRecord::Nack {
            sender_ssrc: 1000,
            nack: Nack {
                ssrc: 2000,
                seqnums: vec![2, 40],
            },
        }]);
        transport.handle_datagram(nack, at(10)).unwrap();
        let (media, _) = peer.open(&outbox);
        assert_eq!(1, media.len());
        let rtx = &media[0];
        assert_eq!((97, 2001), (rtx.payload_type, rtx.ssrc));
        let restored = rtx.from_rtx(96, 2000).unwrap();
        assert_eq!((2, &b"hello"[..]), (restored.seqnum, restored.payload()));
        assert_eq!(1, transport.stats().nacks_received);
        assert_eq!(1, transport.stats().retransmissions_sent);

        // A PLI from the peer is passed back to the peer.
        let pli = peer.rtcp(&[RtcpRecord::PictureLossIndication {
            sender_ssrc: 1000,
            media_ssrc: 2000,
        }]);
        transport.handle_datagram(pli, at(20)).unwrap();
        let (_, records) = peer.open(&outbox);
        assert_eq!(
            vec![RtcpRecord::PictureLossIndication {
                sender_ssrc: 2000,
                media_ssrc: 1000
            }],
            records
        );
        assert_eq!(1, transport.stats().plis_received);
    }

    #[test]
    fn reports_with_sender_info_and_cname() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(Config::default(), Box::new(Echo), vec![video_track("0")], now);

        transport
            .handle_datagram(peer.rtp(96, 1, 1000, b"hello"), at(0))
            .unwrap();
        peer.open(&outbox);
        transport.tick(at(20)).unwrap();
        let (_, records) = peer.open(&outbox);
        let sender_report = records
            .iter()
            .find_map(|record| match record {
                RtcpRecord::SenderReport(report) => Some(report.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(2000, sender_report.ssrc());
        assert_eq!(1, sender_report.sender_info.packet_count);
        assert_eq!(1, sender_report.report_blocks.len());
        assert_eq!(1000, sender_report.report_blocks[0].ssrc);
        assert!(records.iter().any(|record| matches!(
            record,
            RtcpRecord::SourceDescription(chunks) if chunks[0].ssrc == 2000 && chunks[0].get_cname().is_some()
        )));

        // The peer echoes the report back, which yields an RTT.
        let lsr = rtp::get_lsr(sender_report.sender_info.ntp_ts);
        let rr = peer.rtcp(&[RtcpRecord::ReceiverReport(ReceiverReport {
            sender_ssrc: 1000,
            report_blocks: vec![ReportBlock {
                ssrc: 2000,
                last_sender_report: lsr,
                delay_last_sender_report: rtp::calculate_dlsr(at(20), at(60)),
                ..sender_report.report_blocks[0].clone()
            }],
        })]);
        transport.handle_datagram(rr, at(100)).unwrap();
        let rtt = transport
            .tracks()
            .unwrap()
            .tracks()
            .next()
            .unwrap()
            .send_stats()
            .rtt()
            .unwrap();
        assert!(
            rtt >= Duration::from_millis(39) && rtt <= Duration::from_millis(41),
            "{:?}",
            rtt
        );

        // The next reports wait for the interval.
        transport.tick(at(1000)).unwrap();
        let (_, records) = peer.open(&outbox);
        assert!(!records
            .iter()
            .any(|record| matches!(record, RtcpRecord::SenderReport(_))));
    }

    #[test]
    fn remb_replaces_transport_cc() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let config = Config {
            use_remb: true,
            remb_bitrate_bps: 500_000,
            ..Config::default()
        };
        let offered = TrackDescription {
            remb: true,
            ..offered_video()
        };
        let received = Received::default();
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(
            config,
            Box::new(Pusher::new(Box::new(received.clone()))),
            vec![offered],
            now,
        );
        let track = transport.tracks().unwrap().tracks().next().unwrap();
        assert!(!track.description().transport_cc);
        assert!(!track
            .description()
            .extensions
            .contains(ExtensionKind::TransportCc));

        transport
            .handle_datagram(peer.rtp(96, 1, 1000, b"video"), at(0))
            .unwrap();
        transport.tick(at(0)).unwrap();
        let (_, records) = peer.open(&outbox);
        assert!(records.contains(&RtcpRecord::Remb {
            sender_ssrc: 2000,
            remb: Remb {
                bitrate_bps: 500_000,
                ssrcs: vec![1000]
            }
        }));
    }

    #[test]
    fn transport_cc_feedback() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let config = Config {
            twcc_max_pending: 3,
            ..Config::default()
        };
        let received = Received::default();
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(
            config,
            Box::new(Pusher::new(Box::new(received.clone()))),
            vec![offered_video()],
            now,
        );
        for seqnum in 1..=3u16 {
            let packet = Packet::with_extensions(
                false,
                96,
                seqnum,
                0,
                1000,
                &[(3, &(seqnum + 100).to_be_bytes()[..])],
                b"video",
            )
            .encrypt(seqnum as u64, &peer.encrypt.rtp)
            .unwrap();
            transport.handle_datagram(packet, at(seqnum as u64)).unwrap();
        }
        let (_, records) = peer.open(&outbox);
        let feedback = records
            .iter()
            .find_map(|record| match record {
                RtcpRecord::TransportCc {
                    media_ssrc: 1000,
                    feedback,
                    ..
                } => Some(feedback),
                _ => None,
            })
            .unwrap();
        assert_eq!(101, feedback.base_seqnum);
        assert_eq!(3, feedback.received_count());
    }

    #[test]
    fn drops_what_it_cant_route() {
        let now = Instant::now();
        let received = Received::default();
        let Setup {
            mut transport,
            peer,
            dtls,
            ice,
            ..
        } = setup(
            Config::default(),
            Box::new(Pusher::new(Box::new(received.clone()))),
            vec![offered_video()],
            now,
        );

        assert_eq!(
            Err(Error::UnknownRoute("SSRC 5 payload type 100".to_owned())),
            transport.handle_datagram(peer.rtp(100, 1, 5, b"?"), now)
        );
        let mut tampered = peer.rtp(96, 1, 1000, b"video");
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert_eq!(
            Err(Error::MalformedPacket("SRTP")),
            transport.handle_datagram(tampered, now)
        );
        assert_eq!(
            Err(Error::MalformedPacket("datagram")),
            transport.handle_datagram(vec![255, 0, 0, 0], now)
        );
        assert_eq!(3, transport.stats().packets_dropped);
        assert!(received.seqnums().is_empty());

        transport.handle_datagram(vec![0, 1, 0, 0], now).unwrap();
        transport.handle_datagram(vec![22, 254, 253], now).unwrap();
        assert_eq!(1, *ice.0.lock());
        assert_eq!(1, *dtls.0.lock());
    }

    #[test]
    fn bye_shuts_down_once() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let Setup {
            mut transport,
            mut peer,
            outbox,
            shutdowns,
            ..
        } = setup(Config::default(), Box::new(Echo), vec![video_track("0")], now);

        let bye = peer.rtcp(&[RtcpRecord::Goodbye(Goodbye {
            ssrcs: vec![1000],
            reason: None,
        })]);
        assert_eq!(
            Err(Error::PeerInitiatedClose),
            transport.handle_datagram(bye, at(10))
        );
        assert_eq!(State::ShuttingDown, transport.state());
        let (_, records) = peer.open(&outbox);
        assert!(records.contains(&RtcpRecord::Goodbye(Goodbye {
            ssrcs: vec![2000],
            reason: Some("PeerBye".to_owned())
        })));

        transport.shutdown(ShutdownReason::Requested, at(20));
        transport.on_socket_released(at(30));
        assert_eq!(State::Closed, transport.state());
        assert_eq!(vec![ShutdownReason::PeerBye], *shutdowns.lock());
        assert_eq!(
            Err(Error::InvalidState(State::Closed)),
            transport.handle_datagram(peer.rtp(96, 1, 1000, b"late"), at(40))
        );
    }

    #[test]
    fn times_out_without_traffic() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let config = Config {
            inactivity_timeout_secs: 10,
            ..Config::default()
        };
        let Setup {
            mut transport,
            peer,
            shutdowns,
            ..
        } = setup(config, Box::new(Echo), vec![video_track("0")], now);

        transport.tick(at(5_000)).unwrap();
        transport
            .handle_datagram(peer.rtp(96, 1, 1000, b"hi"), at(6_000))
            .unwrap();
        transport.tick(at(10_000)).unwrap();
        transport.tick(at(15_000)).unwrap();
        assert_eq!(
            Err(Error::ProtocolTimeout(Duration::from_secs(14))),
            transport.tick(at(20_000))
        );
        assert_eq!(vec![ShutdownReason::Timeout], *shutdowns.lock());
        assert_eq!(State::ShuttingDown, transport.state());
    }

    #[test]
    fn negotiation_failures() {
        let now = Instant::now();
        let shutdowns = Arc::new(Mutex::new(vec![]));
        let mut transport = Transport::new(CreateTransportArgs {
            id: "test".to_owned(),
            config: Config::default(),
            variant: Box::new(Echo),
            ice: Box::new(Counter::default()),
            dtls: Box::new(Counter::default()),
            socket: Box::new(Outbox::default()),
            on_shutdown: {
                let shutdowns = shutdowns.clone();
                Box::new(move |reason| shutdowns.lock().push(reason))
            },
            now,
        });
        assert_eq!(
            Err(Error::InvalidState(State::Created)),
            transport.on_tuple_selected(now)
        );

        let duplicate_ssrc = TrackDescription {
            mid: "1".to_owned(),
            payload_type: 98,
            rtx_payload_type: None,
            local_ssrc: 3000,
            local_rtx_ssrc: None,
            remote_streams: vec![RemoteStream {
                ssrc: Some(1000),
                ..Default::default()
            }],
            ..video_track("1")
        };
        let err = transport
            .negotiate(vec![video_track("0"), duplicate_ssrc], now)
            .unwrap_err();
        assert_eq!(
            Some(&Error::Negotiation(
                "SSRC 1000 is used by more than one stream".to_owned()
            )),
            err.downcast_ref::<Error>()
        );
        assert_eq!(vec![ShutdownReason::NegotiationFailed], *shutdowns.lock());
        assert!(transport.negotiate(vec![video_track("0")], now).is_err());
    }

    #[test]
    fn player_sends_media() {
        let now = Instant::now();
        struct Keyframes(Arc<Mutex<Vec<String>>>);
        impl MediaSource for Keyframes {
            fn on_keyframe_request(&mut self, mid: &str) {
                self.0.lock().push(mid.to_owned());
            }
        }
        let keyframes = Arc::new(Mutex::new(vec![]));
        let offered = TrackDescription {
            direction: Direction::RecvOnly,
            ..video_track("0")
        };
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(
            Config::default(),
            Box::new(Player::new(Box::new(Keyframes(keyframes.clone())))),
            vec![offered],
            now,
        );

        transport
            .send_rtp(
                "0",
                Packet::new(120, 7, 700, 99, b"frame"),
                &ExtensionMap::default(),
                now,
            )
            .unwrap();
        assert_eq!(
            Err(Error::UnknownRoute("mid 9".to_owned())),
            transport.send_rtp(
                "9",
                Packet::new(120, 8, 700, 99, b"frame"),
                &ExtensionMap::default(),
                now
            )
        );
        let (media, _) = peer.open(&outbox);
        assert_eq!(1, media.len());
        assert_eq!((96, 2000, 7), (media[0].payload_type, media[0].ssrc, media[0].seqnum));

        let pli = peer.rtcp(&[RtcpRecord::PictureLossIndication {
            sender_ssrc: 1000,
            media_ssrc: 2000,
        }]);
        transport.handle_datagram(pli, now).unwrap();
        assert_eq!(vec!["0".to_owned()], *keyframes.lock());

        // A player's track doesn't receive.
        assert_eq!(
            Err(Error::UnknownRoute("mid 0 doesn't receive".to_owned())),
            transport.handle_datagram(peer.rtp(96, 1, 1000, b"?"), now)
        );
    }

    #[test]
    fn answers_reference_times_with_dlrr() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(Config::default(), Box::new(Echo), vec![video_track("0")], now);

        transport
            .handle_datagram(peer.rtp(96, 1, 1000, b"hello"), at(0))
            .unwrap();
        let ntp_ts = 0x0102_0304_0506_0708;
        let xr = peer.rtcp(&[RtcpRecord::ExtendedReport(ExtendedReport {
            sender_ssrc: 1000,
            blocks: vec![XrBlock::ReceiverReferenceTime { ntp_ts }],
        })]);
        transport.handle_datagram(xr, at(10)).unwrap();
        peer.open(&outbox);

        transport.tick(at(20)).unwrap();
        let (_, records) = peer.open(&outbox);
        assert!(records.contains(&RtcpRecord::ExtendedReport(ExtendedReport {
            sender_ssrc: 2000,
            blocks: vec![XrBlock::Dlrr(vec![DlrrItem {
                ssrc: 1000,
                last_receiver_report: 0x0304_0506,
                delay_last_receiver_report: rtp::calculate_dlsr(at(10), at(20)),
            }])],
        })));

        // Each reference time is answered once.
        transport.tick(at(5020)).unwrap();
        let (_, records) = peer.open(&outbox);
        assert!(records
            .iter()
            .any(|record| matches!(record, RtcpRecord::SenderReport(_))));
        assert!(!records
            .iter()
            .any(|record| matches!(record, RtcpRecord::ExtendedReport(_))));
    }

    #[test]
    fn receive_only_rtt_from_dlrr() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let received = Received::default();
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(
            Config::default(),
            Box::new(Pusher::new(Box::new(received.clone()))),
            vec![offered_video()],
            now,
        );

        transport
            .handle_datagram(peer.rtp(96, 1, 1000, b"video"), at(0))
            .unwrap();
        transport.tick(at(20)).unwrap();
        let (_, records) = peer.open(&outbox);
        assert!(records
            .iter()
            .any(|record| matches!(record, RtcpRecord::ReceiverReport(_))));
        let ntp_ts = records
            .iter()
            .find_map(|record| match record {
                RtcpRecord::ExtendedReport(report) if report.sender_ssrc == 2000 => {
                    match report.blocks[..] {
                        [XrBlock::ReceiverReferenceTime { ntp_ts }] => Some(ntp_ts),
                        _ => None,
                    }
                }
                _ => None,
            })
            .unwrap();

        let dlrr = peer.rtcp(&[RtcpRecord::ExtendedReport(ExtendedReport {
            sender_ssrc: 1000,
            blocks: vec![XrBlock::Dlrr(vec![DlrrItem {
                ssrc: 2000,
                last_receiver_report: rtp::get_lsr(ntp_ts),
                delay_last_receiver_report: rtp::calculate_dlsr(at(20), at(60)),
            }])],
        })]);
        transport.handle_datagram(dlrr, at(100)).unwrap();
        let rtt = transport
            .tracks()
            .unwrap()
            .tracks()
            .next()
            .unwrap()
            .receiver_rtt()
            .rtt()
            .unwrap();
        assert!(
            rtt >= Duration::from_millis(39) && rtt <= Duration::from_millis(41),
            "{:?}",
            rtt
        );
    }

    #[test]
    fn nacks_across_rollover_in_one_item() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let config = Config {
            reorder_window_ms: 500,
            nack_min_retry_interval_ms: 50,
            ..Config::default()
        };
        let received = Received::default();
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(
            config,
            Box::new(Pusher::new(Box::new(received.clone()))),
            vec![offered_video()],
            now,
        );

        transport
            .handle_datagram(peer.rtp(96, 65533, 1000, b"video"), at(0))
            .unwrap();
        transport.tick(at(0)).unwrap();
        peer.open(&outbox);
        let after_rollover = Packet::new(96, 2, 6000, 1000, b"video")
            .encrypt(0x1_0002, &peer.encrypt.rtp)
            .unwrap();
        transport.handle_datagram(after_rollover, at(10)).unwrap();
        transport.tick(at(60)).unwrap();

        let (_, records) = peer.open(&outbox);
        let nacks: Vec<&Nack> = records
            .iter()
            .filter_map(|record| match record {
                RtcpRecord::Nack { nack, .. } => Some(nack),
                _ => None,
            })
            .collect();
        assert_eq!(1, nacks.len());
        assert_eq!(vec![65534, 65535, 0, 1], nacks[0].seqnums);
        // The media SSRC and a single (pid, blp) item.
        assert_eq!(8, nacks[0].written_len());
        assert_eq!(1, transport.stats().nacks_sent);
    }

    #[test]
    fn sent_media_uses_the_tracks_extension_ids() {
        struct NoKeyframes;
        impl MediaSource for NoKeyframes {
            fn on_keyframe_request(&mut self, _mid: &str) {}
        }
        let now = Instant::now();
        let offered = TrackDescription {
            direction: Direction::RecvOnly,
            ..video_track("0")
        };
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(
            Config::default(),
            Box::new(Player::new(Box::new(NoKeyframes))),
            vec![offered],
            now,
        );

        let source = ExtensionMap::from_kinds([
            (5, ExtensionKind::TransportCc),
            (6, ExtensionKind::AudioLevel),
        ]);
        let packet = Packet::with_extensions(
            false,
            120,
            7,
            700,
            99,
            &[(5, &[0, 9][..]), (6, &[0x7f][..])],
            b"frame",
        );
        transport.send_rtp("0", packet, &source, now).unwrap();
        let (media, _) = peer.open(&outbox);
        assert_eq!(1, media.len());
        // The track has no audio level.
        assert_eq!(
            vec![(3, &[0, 9][..])],
            media[0].extensions().collect::<Vec<_>>()
        );
        assert_eq!(b"frame", media[0].payload());
    }

    #[test]
    fn echo_keeps_extension_ids() {
        let now = Instant::now();
        let Setup {
            mut transport,
            mut peer,
            outbox,
            ..
        } = setup(Config::default(), Box::new(Echo), vec![video_track("0")], now);

        let packet = Packet::with_extensions(false, 96, 1, 0, 1000, &[(3, &[0, 1][..])], b"hi")
            .encrypt(1, &peer.encrypt.rtp)
            .unwrap();
        transport.handle_datagram(packet, now).unwrap();
        let (media, _) = peer.open(&outbox);
        assert_eq!(1, media.len());
        assert_eq!(
            vec![(3, &[0, 1][..])],
            media[0].extensions().collect::<Vec<_>>()
        );
    }
}
