//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The owning loop of a transport. Only the loop touches the [`Transport`]; everyone else
//! posts a [`Message`] to it.

use std::sync::Arc;

use log::*;
use rtc_common::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::{
    rtp::{ExtensionMap, Packet, SrtpMasterKeys},
    track::TrackDescription,
    transport::{NegotiatedSession, ShutdownReason, State, Transport, TransportStats},
};

pub enum Message {
    /// Anything that arrived on the selected socket tuple.
    Datagram(Vec<u8>),
    Negotiate {
        offered: Vec<TrackDescription>,
        reply: oneshot::Sender<anyhow::Result<NegotiatedSession>>,
    },
    SendRtp {
        mid: String,
        packet: Packet<Vec<u8>>,
        /// The header extension ids the packet was written with.
        extensions: Arc<ExtensionMap>,
    },
    RequestKeyframe {
        mid: String,
    },
    TupleSelected,
    KeysReady(SrtpMasterKeys),
    DtlsClosed,
    GetStats(oneshot::Sender<TransportStats>),
    Shutdown,
}

/// The loop's clock. Goes through tokio so that paused test time applies.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std().into()
}

/// Runs until the transport shuts down or every sender is gone, then releases the
/// socket.
pub async fn run(mut transport: Transport, mut receiver: mpsc::UnboundedReceiver<Message>) {
    debug!("transport {} loop started", transport.id());
    loop {
        let wakeup: std::time::Instant = transport.next_wakeup(now()).into();
        tokio::select!(
            message = receiver.recv() => {
                match message {
                    Some(message) => handle_message(&mut transport, message, now()),
                    None => transport.shutdown(ShutdownReason::Requested, now()),
                }
            }
            _ = tokio::time::sleep_until(wakeup.into()) => {
                if let Err(err) = transport.tick(now()) {
                    debug!("transport {} tick: {}", transport.id(), err);
                }
            }
        );
        if matches!(transport.state(), State::ShuttingDown | State::Closed) {
            break;
        }
    }
    receiver.close();
    transport.on_socket_released(now());
    info!("transport {} closed", transport.id());
}

fn handle_message(transport: &mut Transport, message: Message, now: Instant) {
    let result = match message {
        Message::Datagram(datagram) => transport.handle_datagram(datagram, now),
        Message::Negotiate { offered, reply } => {
            // The caller may have stopped waiting.
            let _ = reply.send(transport.negotiate(offered, now));
            Ok(())
        }
        Message::SendRtp {
            mid,
            packet,
            extensions,
        } => transport.send_rtp(&mid, packet, &extensions, now),
        Message::RequestKeyframe { mid } => transport.request_keyframe(&mid, now),
        Message::TupleSelected => transport.on_tuple_selected(now),
        Message::KeysReady(keys) => transport.on_keys_ready(&keys, now),
        Message::DtlsClosed => {
            transport.on_dtls_closed(now);
            Ok(())
        }
        Message::GetStats(reply) => {
            let _ = reply.send(transport.stats());
            Ok(())
        }
        Message::Shutdown => {
            transport.shutdown(ShutdownReason::Requested, now);
            Ok(())
        }
    };
    if let Err(err) = result {
        trace!("transport {}: {}", transport.id(), err);
    }
}
