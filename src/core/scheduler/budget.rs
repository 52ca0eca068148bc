//! Wall-clock budget for one tick.
//!
//! A tick runs inside a bounded invocation window (function timeout minus a
//! safety buffer). Work is only *started* while enough budget remains;
//! in-flight probes always get to finish and leftover targets stay due for
//! the next tick.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct TickBudget {
    deadline: Instant,
    min_start: Duration,
}

impl TickBudget {
    pub fn start(total: Duration, min_start: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
            min_start,
        }
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether a new wave of work may be launched.
    pub fn should_start_work(&self) -> bool {
        self.remaining() >= self.min_start
    }
}
