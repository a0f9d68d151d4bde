//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The media transport of a WebRTC peer connection: SRTP, RTCP, NACK, transport-cc and
//! reordering, run on one owning loop per transport.

#[macro_use]
extern crate metrics;

pub mod config;
pub mod event_loop;
pub mod jitter;
pub mod registry;
pub mod rtp;
pub mod track;
pub mod transport;
pub mod transportcc;
