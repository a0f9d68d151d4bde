//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Counts one named event from one call site. Counting is a relaxed atomic add, so it can
/// happen on any packet path.
pub struct EventCountReporter {
    name: &'static str,
    enabled: AtomicBool,
    count: AtomicUsize,
}

impl EventCountReporter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(true),
            count: AtomicUsize::new(0),
        }
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn count(&self) {
        self.count_n(1);
    }

    pub fn count_n(&self, n: usize) {
        if n > 0 && self.enabled.load(Ordering::Relaxed) {
            self.count.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Takes the count so far, leaving zero.
    pub fn report(&self) -> EventReport {
        EventReport {
            name: self.name,
            event_count: self.count.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub struct EventReport {
    name: &'static str,
    event_count: usize,
}

impl EventReport {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }
}

impl fmt::Display for EventReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.event_count)
    }
}
