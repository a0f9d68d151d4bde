//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! What the transport does with media differs between players, pushers and echo tests.
//! Each is a [`TransportVariant`] that the transport calls at a few points.

use std::sync::Arc;

use anyhow::bail;
use log::*;

use crate::{
    jitter::SortedPacket,
    track::{Direction, TrackDescription},
};

/// What to do with a received packet once it is in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvAction {
    Consume,
    /// Send it back out on the same track.
    Echo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyframeAction {
    Handled,
    /// Pass the request on to the peer's sender on the same track.
    RequestFromPeer,
}

/// Receives what a pushing peer sends.
pub trait MediaSink: Send {
    fn on_sorted_rtp(&mut self, mid: &str, rid: Option<&str>, packet: Arc<SortedPacket>);
}

/// Feeds a player, and needs to hear when the peer wants a keyframe.
pub trait MediaSource: Send {
    fn on_keyframe_request(&mut self, mid: &str);
}

pub trait TransportVariant: Send {
    fn name(&self) -> &'static str;

    /// The directions this variant can serve.
    fn direction(&self) -> Direction;

    /// Adjusts a track the peer offered before it becomes part of the answer.
    fn configure(&self, track: &mut TrackDescription) {
        track.direction = track.direction.answer(self.direction());
    }

    /// Rejects an answer this variant can't work with.
    fn check_session(&self, tracks: &[TrackDescription]) -> anyhow::Result<()>;

    fn on_start(&mut self, tracks: &[TrackDescription]) {
        info!("{} started with {} tracks", self.name(), tracks.len());
    }

    fn on_sorted_rtp(
        &mut self,
        track: &TrackDescription,
        rid: Option<&str>,
        packet: Arc<SortedPacket>,
    ) -> RecvAction;

    fn on_keyframe_request(&mut self, mid: &str) -> KeyframeAction;
}

/// Sends media to the peer. Media arrives through `Transport::send_rtp`.
pub struct Player {
    source: Box<dyn MediaSource>,
}

impl Player {
    pub fn new(source: Box<dyn MediaSource>) -> Self {
        Self { source }
    }
}

impl TransportVariant for Player {
    fn name(&self) -> &'static str {
        "player"
    }

    fn direction(&self) -> Direction {
        Direction::SendOnly
    }

    fn check_session(&self, tracks: &[TrackDescription]) -> anyhow::Result<()> {
        if !tracks.iter().any(|track| track.direction.sends()) {
            bail!("the peer doesn't receive any track");
        }
        Ok(())
    }

    fn on_sorted_rtp(
        &mut self,
        track: &TrackDescription,
        _rid: Option<&str>,
        _packet: Arc<SortedPacket>,
    ) -> RecvAction {
        trace!("player ignoring media on mid {}", track.mid);
        RecvAction::Consume
    }

    fn on_keyframe_request(&mut self, mid: &str) -> KeyframeAction {
        self.source.on_keyframe_request(mid);
        KeyframeAction::Handled
    }
}

/// Receives media from the peer and hands it to a sink.
pub struct Pusher {
    sink: Box<dyn MediaSink>,
}

impl Pusher {
    pub fn new(sink: Box<dyn MediaSink>) -> Self {
        Self { sink }
    }
}

impl TransportVariant for Pusher {
    fn name(&self) -> &'static str {
        "pusher"
    }

    fn direction(&self) -> Direction {
        Direction::RecvOnly
    }

    fn check_session(&self, tracks: &[TrackDescription]) -> anyhow::Result<()> {
        if !tracks.iter().any(|track| track.direction.receives()) {
            bail!("the peer doesn't send any track");
        }
        Ok(())
    }

    fn on_sorted_rtp(
        &mut self,
        track: &TrackDescription,
        rid: Option<&str>,
        packet: Arc<SortedPacket>,
    ) -> RecvAction {
        self.sink.on_sorted_rtp(&track.mid, rid, packet);
        RecvAction::Consume
    }

    fn on_keyframe_request(&mut self, mid: &str) -> KeyframeAction {
        debug!("pusher got a keyframe request for mid {}, which it doesn't send", mid);
        KeyframeAction::Handled
    }
}

/// Sends everything the peer sends straight back.
#[derive(Default)]
pub struct Echo;

impl TransportVariant for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn direction(&self) -> Direction {
        Direction::SendRecv
    }

    fn check_session(&self, tracks: &[TrackDescription]) -> anyhow::Result<()> {
        if !tracks
            .iter()
            .any(|track| track.direction == Direction::SendRecv)
        {
            bail!("echo needs a track that goes both ways");
        }
        Ok(())
    }

    fn on_sorted_rtp(
        &mut self,
        _track: &TrackDescription,
        _rid: Option<&str>,
        _packet: Arc<SortedPacket>,
    ) -> RecvAction {
        RecvAction::Echo
    }

    fn on_keyframe_request(&mut self, _mid: &str) -> KeyframeAction {
        KeyframeAction::RequestFromPeer
    }
}
