//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Header extensions negotiated per media section (RFC 8285).

use std::collections::HashMap;

use strum_macros::{AsRefStr, Display, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
pub enum ExtensionKind {
    #[strum(serialize = "urn:ietf:params:rtp-hdrext:ssrc-audio-level")]
    AudioLevel,
    #[strum(serialize = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time")]
    AbsSendTime,
    #[strum(
        serialize = "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
    )]
    TransportCc,
    #[strum(serialize = "urn:ietf:params:rtp-hdrext:sdes:mid")]
    Mid,
    #[strum(serialize = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id")]
    RtpStreamId,
    #[strum(serialize = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id")]
    RepairedRtpStreamId,
    #[strum(serialize = "urn:3gpp:video-orientation")]
    VideoOrientation,
    #[strum(serialize = "urn:ietf:params:rtp-hdrext:toffset")]
    TransmissionOffset,
    #[strum(serialize = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay")]
    PlayoutDelay,
}

/// Maps the ids used on the wire to extension kinds, in both directions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionMap {
    kind_by_id: HashMap<u8, ExtensionKind>,
    id_by_kind: HashMap<ExtensionKind, u8>,
}

impl ExtensionMap {
    /// Entries with a URI we don't understand are left out, so their ids resolve to nothing.
    pub fn from_uris<'a>(entries: impl IntoIterator<Item = (u8, &'a str)>) -> Self {
        Self::from_kinds(
            entries
                .into_iter()
                .filter_map(|(id, uri)| Some((id, uri.parse::<ExtensionKind>().ok()?))),
        )
    }

    pub fn from_kinds(entries: impl IntoIterator<Item = (u8, ExtensionKind)>) -> Self {
        let mut map = Self::default();
        for (id, kind) in entries {
            map.insert(id, kind);
        }
        map
    }

    pub fn insert(&mut self, id: u8, kind: ExtensionKind) {
        if let Some(previous) = self.id_by_kind.insert(kind, id) {
            self.kind_by_id.remove(&previous);
        }
        self.kind_by_id.insert(id, kind);
    }

    pub fn remove_kind(&mut self, kind: ExtensionKind) {
        if let Some(id) = self.id_by_kind.remove(&kind) {
            self.kind_by_id.remove(&id);
        }
    }

    pub fn kind(&self, id: u8) -> Option<ExtensionKind> {
        self.kind_by_id.get(&id).copied()
    }

    pub fn id(&self, kind: ExtensionKind) -> Option<u8> {
        self.id_by_kind.get(&kind).copied()
    }

    pub fn contains(&self, kind: ExtensionKind) -> bool {
        self.id_by_kind.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.kind_by_id.is_empty()
    }

    /// Translates an id from this map to the id the same kind has in `to`.
    pub fn translate(&self, id: u8, to: &ExtensionMap) -> Option<u8> {
        to.id(self.kind(id)?)
    }
}
