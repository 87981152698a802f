//! Per-worker processing statistics.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use serde::Serialize;


//------------ Statistics ----------------------------------------------------

#[derive(Debug, Default)]
pub struct Statistics {
    inner: Mutex<StatisticsSnapshot>,
}

/// Marks the start of a processing event.
#[derive(Debug)]
#[must_use]
pub struct Event {
    started: Instant,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    /// Number of events started.
    pub started: u64,

    /// Number of events that completed.
    pub completed: u64,

    /// Total time spent in completed events, in milliseconds.
    pub total_duration_ms: u64,
}

impl Statistics {
    pub fn start_event(&self) -> Event {
        self.inner.lock().unwrap().started += 1;
        Event { started: Instant::now() }
    }

    pub fn end_event(&self, event: Event) {
        let elapsed = event.started.elapsed();
        let mut inner = self.inner.lock().unwrap();
        inner.completed += 1;
        inner.total_duration_ms += duration_ms(elapsed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.inner.lock().unwrap().clone()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}


//------------ Tests ---------------------------------------------------------
