//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::warn;
use parking_lot::Mutex;

use crate::reporter::{EventCountReporter, EventReport};

/// A global structure that contains each of the registered event reporters.
///
/// The mutex lock is only used once to register a new reporter, and then once by the report
/// generation.
pub struct Metrics {
    enabled: AtomicBool,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    registered_names: HashSet<&'static str>,
    event_reporters: Vec<Arc<EventCountReporter>>,
}

#[derive(Debug)]
pub struct Report {
    pub events: Vec<EventReport>,
}

impl Report {
    pub fn event_count(&self, name: &str) -> usize {
        self.events
            .iter()
            .filter(|report| report.name() == name)
            .map(|report| report.event_count())
            .sum()
    }
}

impl Metrics {
    pub(crate) fn new_enabled() -> Metrics {
        Metrics {
            enabled: AtomicBool::new(true),
            registry: Default::default(),
        }
    }

    /// Locks the internal structure and adds a new event.
    pub fn create_and_register_event(&self, name: &'static str) -> Arc<EventCountReporter> {
        let event_reporter = Arc::new(EventCountReporter::new(name));
        if !self.enabled() {
            event_reporter.disable();
        }

        let mut registry = self.registry.lock();
        if !registry.registered_names.insert(name) {
            // Two call sites may share a name; they just report separately.
            warn!("metric name \"{}\" registered more than once", name);
        }
        registry.event_reporters.push(Arc::clone(&event_reporter));
        event_reporter
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Returns event counts sorted by name and resets them.
    pub fn report(&self) -> Report {
        let registry = self.registry.lock();
        let mut events = registry
            .event_reporters
            .iter()
            .map(|reporter| reporter.report())
            .collect::<Vec<_>>();
        events.sort_unstable_by_key(|report| report.name());
        Report { events }
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.registry
            .lock()
            .event_reporters
            .iter()
            .for_each(|reporter| reporter.disable());
    }
}

#[macro_export]
macro_rules! event_reporter {
    ($name:expr) => {{
        static __REPORTER: once_cell::sync::Lazy<
            std::sync::Arc<$crate::metric_config::EventCountReporter>,
        > = once_cell::sync::Lazy::new(|| $crate::__METRICS.create_and_register_event($name));

        &__REPORTER
    }};
}

#[macro_export]
macro_rules! event {
    ($name:expr) => {
        $crate::event_reporter!($name).count()
    };
    ($name:expr, $count:expr) => {
        $crate::event_reporter!($name).count_n($count)
    };
}

#[macro_export]
macro_rules! metrics {
    () => {{
        &$crate::__METRICS
    }};
}
