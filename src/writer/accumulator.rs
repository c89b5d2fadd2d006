use crate::event::TelemetryEvent;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on the buffer's up-front allocation. Larger batches grow on demand.
const PREALLOCATE_LIMIT: usize = 1024;

/// Events drained from an [`Accumulator`] in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub events: Vec<TelemetryEvent>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// In-memory buffer for one partition claim.
///
/// Mutation takes `&mut self` and the value is owned by exactly one
/// [`PartitionWriter`](super::consumer::PartitionWriter), so appends and
/// drains can never interleave.
#[derive(Debug)]
pub struct Accumulator {
    events: Vec<TelemetryEvent>,
    max_events: usize,
    max_age: Duration,
    last_flush: Instant,
}

impl Accumulator {
    pub fn new(max_events: usize, max_age: Duration) -> Self {
        Self {
            events: Vec::with_capacity(max_events.min(PREALLOCATE_LIMIT)),
            max_events,
            max_age,
            last_flush: Instant::now(),
        }
    }

    pub fn append(&mut self, event: TelemetryEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Size trigger alone: buffered count has reached the limit.
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.max_events
    }

    pub fn should_flush(&self) -> bool {
        self.should_flush_at(Instant::now())
    }

    pub fn should_flush_at(&self, now: Instant) -> bool {
        if self.is_full() {
            return true;
        }
        !self.events.is_empty() && now.saturating_duration_since(self.last_flush) >= self.max_age
    }

    /// When the age trigger fires if nothing is drained before then.
    pub fn deadline(&self) -> Instant {
        self.last_flush + self.max_age
    }

    /// Buffered events, for encoding before the batch is known to be persisted.
    pub fn pending(&self) -> &[TelemetryEvent] {
        &self.events
    }

    /// Take every buffered event and restart the age timer.
    pub fn drain(&mut self) -> Batch {
        self.last_flush = Instant::now();
        Batch {
            events: std::mem::replace(
                &mut self.events,
                Vec::with_capacity(self.max_events.min(PREALLOCATE_LIMIT)),
            ),
        }
    }
}
