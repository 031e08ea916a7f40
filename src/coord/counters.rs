//! Produced/consumed buffer accounting for the frame in flight

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::CachePadded;

/// Per-frame buffer counters.
///
/// `produced` is advanced by the commit engine after a successful commit. `consumed` is advanced
/// by the host transport's completion callback, which may run concurrently with the lifecycle
/// task. Both only go back to zero through [`FrameCounters::reset`].
#[derive(Debug, Default)]
pub struct FrameCounters {
    produced: CachePadded<AtomicU32>,
    consumed: CachePadded<AtomicU32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub produced: u32,
    pub consumed: u32,
}

impl CounterSnapshot {
    pub fn in_flight(&self) -> u32 {
        self.produced.saturating_sub(self.consumed)
    }

    pub fn drained(&self) -> bool {
        self.produced == self.consumed
    }
}

impl FrameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_produced(&self) -> u32 {
        self.produced.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Host finished reading one committed buffer.
    ///
    /// Completions that would push `consumed` past `produced` (late callbacks for buffers
    /// discarded by a reset) are dropped and reported as `false`.
    pub fn record_consumed(&self) -> bool {
        let produced = self.produced.load(Ordering::Acquire);
        self.consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                (consumed < produced).then_some(consumed + 1)
            })
            .is_ok()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        // consumed first: it can only trail produced, so this order never observes consumed > produced
        let consumed = self.consumed.load(Ordering::Acquire);
        let produced = self.produced.load(Ordering::Acquire);
        CounterSnapshot { produced, consumed }
    }

    pub fn reset(&self) {
        self.consumed.store(0, Ordering::Release);
        self.produced.store(0, Ordering::Release);
    }
}
