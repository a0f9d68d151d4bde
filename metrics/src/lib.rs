//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Process-wide event counters. Call sites count with `event!("name")`; whoever owns the
//! process drains them periodically with `metrics!().report()`.

use once_cell::sync::Lazy;

use crate::macros::Metrics;

#[doc(hidden)]
pub static __METRICS: Lazy<Metrics> = Lazy::new(Metrics::new_enabled);

pub mod metric_config {
    pub use crate::{
        macros::{Metrics, Report},
        reporter::{EventCountReporter, EventReport},
    };
}

#[macro_use]
mod macros;
mod reporter;
