//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Finds a running transport by its id, for signaling that arrives from elsewhere
//! (trickled candidates, teardown requests).

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use anyhow::{anyhow, bail};
use log::*;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    event_loop::{self, Message},
    rtp::{ExtensionMap, Packet},
    track::TrackDescription,
    transport::{CreateTransportArgs, NegotiatedSession, Transport, TransportStats},
};

/// A way to reach a transport's owning loop. The loop runs while some handle is held.
pub struct TransportHandle {
    id: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl TransportHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns false if the transport is gone.
    pub fn post(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn shutdown(&self) {
        if !self.post(Message::Shutdown) {
            debug!("transport {} was already gone", self.id);
        }
    }

    pub fn send_rtp(
        &self,
        mid: &str,
        packet: Packet<Vec<u8>>,
        extensions: Arc<ExtensionMap>,
    ) -> bool {
        self.post(Message::SendRtp {
            mid: mid.to_owned(),
            packet,
            extensions,
        })
    }

    pub async fn negotiate(
        &self,
        offered: Vec<TrackDescription>,
    ) -> anyhow::Result<NegotiatedSession> {
        let (reply, answer) = oneshot::channel();
        if !self.post(Message::Negotiate { offered, reply }) {
            bail!("transport {} is gone", self.id);
        }
        answer
            .await
            .map_err(|_| anyhow!("transport {} closed while negotiating", self.id))?
    }

    pub async fn stats(&self) -> Option<TransportStats> {
        let (reply, stats) = oneshot::channel();
        if !self.post(Message::GetStats(reply)) {
            return None;
        }
        stats.await.ok()
    }

    /// Waits for the owning loop to finish.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

/// Every running transport by id. Construct one at startup and share it.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Mutex<HashMap<String, Weak<TransportHandle>>>,
}

impl TransportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A random id that no running transport has.
    pub fn new_id(&self) -> String {
        let transports = self.transports.lock();
        loop {
            let id = hex::encode(rand::random::<[u8; 8]>());
            if !transports.contains_key(&id) {
                return id;
            }
        }
    }

    /// Starts the transport's owning loop on the current runtime and registers it.
    /// The entry goes away when the loop ends.
    pub fn spawn(
        self: &Arc<Self>,
        args: CreateTransportArgs,
    ) -> anyhow::Result<Arc<TransportHandle>> {
        let id = args.id.clone();
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Arc::new(TransportHandle {
            id: id.clone(),
            sender,
        });
        {
            let mut transports = self.transports.lock();
            if transports
                .get(&id)
                .is_some_and(|existing| existing.strong_count() > 0)
            {
                bail!("transport {} already exists", id);
            }
            transports.insert(id.clone(), Arc::downgrade(&handle));
        }

        let transport = Transport::new(args);
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            event_loop::run(transport, receiver).await;
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id);
            }
        });
        info!("transport {} started", handle.id);
        Ok(handle)
    }

    /// None if the transport is gone or shutting down without any handle left.
    pub fn get(&self, id: &str) -> Option<Arc<TransportHandle>> {
        let mut transports = self.transports.lock();
        let handle = transports.get(id)?.upgrade();
        if handle.is_none() {
            transports.remove(id);
        }
        handle
    }

    /// Only removes an entry whose transport is gone, so a new transport that reused
    /// the id isn't dropped.
    fn remove(&self, id: &str) {
        let mut transports = self.transports.lock();
        if let Some(existing) = transports.get(id) {
            let gone = existing
                .upgrade()
                .map_or(true, |handle| handle.sender.is_closed());
            if gone {
                transports.remove(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
