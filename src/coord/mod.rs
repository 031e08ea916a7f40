//! Coordination state shared between the lifecycle task, the control task and callback context.
//!
//! Nothing outside this module touches shared mutable state directly: tasks see it only through
//! [`Coordinator`].

pub mod counters;
pub mod events;

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub use counters::{CounterSnapshot, FrameCounters};
pub use events::{EventFlags, Events};

/// Link-level booleans written from bus callbacks.
#[derive(Debug, Default)]
pub struct LinkState {
    connected: AtomicBool,
    streaming_started: AtomicBool,
    explicit_stop: AtomicBool,
    faulted: AtomicBool,
    fault_cleared: Notify,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// True once the host has read at least one buffer of the current stream.
    pub fn streaming_started(&self) -> bool {
        self.streaming_started.load(Ordering::Acquire)
    }

    pub fn set_streaming_started(&self, started: bool) {
        self.streaming_started.store(started, Ordering::Release);
    }

    /// Marks that the stop requester already reset and flushed the data path.
    pub fn mark_explicit_stop(&self) {
        self.explicit_stop.store(true, Ordering::Release);
    }

    /// Consumes the explicit stop marker.
    pub fn take_explicit_stop(&self) -> bool {
        self.explicit_stop.swap(false, Ordering::AcqRel)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub fn set_faulted(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::Release);
    }

    /// External reset: lets a halted lifecycle task arm again.
    pub fn clear_fault(&self) {
        self.faulted.store(false, Ordering::Release);
        self.fault_cleared.notify_waiters();
    }

    pub async fn wait_fault_cleared(&self) {
        loop {
            let notified = self.fault_cleared.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_faulted() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
pub struct Coordinator {
    pub events: EventFlags,
    pub counters: FrameCounters,
    pub link: LinkState,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stream abort.
    ///
    /// Only has an effect while streaming is enabled: `STREAM` is cleared and `STREAM_ABORT` set in
    /// one atomic step. Safe to call from callback context.
    pub fn abort_stream(&self) -> bool {
        self.events.swap_if_set(Events::STREAM, Events::STREAM_ABORT)
    }

    /// Host finished reading a committed buffer. Called from the host transport's completion path.
    pub fn on_buffer_consumed(&self) {
        if self.counters.record_consumed() {
            self.link.set_streaming_started(true);
        }
    }
}
