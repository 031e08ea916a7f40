//! Process-wide event flag group shared by the lifecycle and control tasks

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use tokio::sync::Notify;

bitflags! {
    /// Individual event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        /// Host committed stream parameters; stays set for as long as streaming is allowed.
        const STREAM = 1 << 0;
        /// Streaming must be torn down. Never set together with `STREAM`.
        const STREAM_ABORT = 1 << 1;
        /// Class request addressed to the video control interface is pending.
        const CONTROL_REQUEST = 1 << 2;
        /// Class request addressed to the video streaming interface is pending.
        const STREAM_REQUEST = 1 << 3;
    }
}

/// Atomic bitset with async waiters.
///
/// Setting bits is lock-free and safe from callback context; only the wait operations need a
/// task context.
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: AtomicU32,
    notify: Notify,
}

impl EventFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, events: Events) {
        self.bits.fetch_or(events.bits(), Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub fn clear(&self, events: Events) {
        self.bits.fetch_and(!events.bits(), Ordering::AcqRel);
    }

    pub fn get(&self) -> Events {
        Events::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    /// True if every bit in `events` is set.
    pub fn contains(&self, events: Events) -> bool {
        self.get().contains(events)
    }

    /// Clears `events` and returns the subset that was set.
    pub fn take(&self, events: Events) -> Events {
        let prev = self.bits.fetch_and(!events.bits(), Ordering::AcqRel);
        Events::from_bits_truncate(prev) & events
    }

    /// Atomically replaces `present` with `with`, only if all of `present` is currently set.
    pub fn swap_if_set(&self, present: Events, with: Events) -> bool {
        let swapped = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = Events::from_bits_truncate(bits);
                current
                    .contains(present)
                    .then(|| ((current - present) | with).bits())
            })
            .is_ok();

        if swapped {
            self.notify.notify_waiters();
        }
        swapped
    }

    /// Waits until every bit in `events` is set. Does not clear anything.
    pub async fn wait_all(&self, events: Events) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.contains(events) {
                return;
            }
            notified.await;
        }
    }

    /// Waits until any bit in `mask` is set, then clears and returns the set bits of `mask`.
    pub async fn wait_take_any(&self, mask: Events) -> Events {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = self.take(mask);
            if !taken.is_empty() {
                return taken;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn take_clears_only_requested_bits() {
        let flags = EventFlags::new();
        flags.set(Events::STREAM | Events::CONTROL_REQUEST);

        let taken = flags.take(Events::CONTROL_REQUEST | Events::STREAM_REQUEST);
        assert_eq!(taken, Events::CONTROL_REQUEST);
        assert_eq!(flags.get(), Events::STREAM);
    }

    #[test]
    fn swap_if_set_is_conditional() {
        let flags = EventFlags::new();
        assert!(!flags.swap_if_set(Events::STREAM, Events::STREAM_ABORT));
        assert!(flags.get().is_empty());

        flags.set(Events::STREAM);
        assert!(flags.swap_if_set(Events::STREAM, Events::STREAM_ABORT));
        assert_eq!(flags.get(), Events::STREAM_ABORT);
    }

    #[tokio::test]
    async fn waiter_wakes_on_set() {
        let flags = Arc::new(EventFlags::new());
        let waiter = {
            let flags = flags.clone();
            tokio::spawn(async move { flags.wait_take_any(Events::STREAM_REQUEST).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        flags.set(Events::STREAM_REQUEST);

        let taken = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken, Events::STREAM_REQUEST);
        assert!(flags.get().is_empty());
    }

    #[tokio::test]
    async fn wait_all_returns_immediately_when_set() {
        let flags = EventFlags::new();
        flags.set(Events::STREAM);
        tokio::time::timeout(Duration::from_millis(100), flags.wait_all(Events::STREAM))
            .await
            .unwrap();
        assert!(flags.contains(Events::STREAM));
    }
}
