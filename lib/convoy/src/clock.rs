// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Abstract time source for the worker.
//!
//! All time comparisons and waits go through a [`Clock`] so that tests can
//! substitute a deterministic source. This matters for correctness, not just
//! convenience: minion wait deadlines are anchored to the wall-clock instant
//! the controller recorded for the last phase change, not to whenever this
//! worker happened to start waiting.

use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;

pub trait Clock: Send + Sync {
    /// The current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Completes once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The ambient system clock, backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
