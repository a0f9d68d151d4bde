//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A bounded pool of packet buffers, checked out by slot index.

use std::{
    borrow::{Borrow, BorrowMut},
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

struct Slots {
    buffers: Vec<Vec<u8>>,
    free: Vec<usize>,
    capacity: usize,
}

/// Cheap to clone; clones share the slots.
#[derive(Clone)]
pub struct PacketPool {
    slots: Arc<Mutex<Slots>>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                buffers: Vec::new(),
                free: Vec::new(),
                capacity,
            })),
        }
    }

    /// Copies `bytes` into a pooled buffer. Once every slot is checked out, the copy
    /// goes into a plain allocation that isn't returned to the pool.
    pub fn checkout(&self, bytes: &[u8]) -> PooledBuffer {
        let index = {
            let mut slots = self.slots.lock();
            match slots.free.pop() {
                Some(index) => Some((index, std::mem::take(&mut slots.buffers[index]))),
                None if slots.buffers.len() < slots.capacity => {
                    slots.buffers.push(Vec::new());
                    Some((slots.buffers.len() - 1, Vec::new()))
                }
                None => None,
            }
        };
        let (slot, mut buffer) = match index {
            Some((index, buffer)) => (Some((index, Arc::downgrade(&self.slots))), buffer),
            None => {
                event!("rtc.pool.exhausted");
                (None, Vec::new())
            }
        };
        buffer.clear();
        buffer.extend_from_slice(bytes);
        PooledBuffer { slot, buffer }
    }

    pub fn checked_out(&self) -> usize {
        let slots = self.slots.lock();
        slots.buffers.len() - slots.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }
}

/// A buffer that goes back to its pool slot when dropped.
pub struct PooledBuffer {
    slot: Option<(usize, Weak<Mutex<Slots>>)>,
    buffer: Vec<u8>,
}

impl PooledBuffer {
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some((index, pool)) = self.slot.take() {
            // The pool may already be gone.
            if let Some(slots) = pool.upgrade() {
                let mut slots = slots.lock();
                slots.buffers[index] = std::mem::take(&mut self.buffer);
                slots.free.push(index);
            }
        }
    }
}

impl Borrow<[u8]> for PooledBuffer {
    fn borrow(&self) -> &[u8] {
        &self.buffer
    }
}

impl BorrowMut<[u8]> for PooledBuffer {
    fn borrow_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("slot", &self.slot.as_ref().map(|(index, _)| index))
            .field("len", &self.buffer.len())
            .finish()
    }
}

impl PartialEq for PooledBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer
    }
}
