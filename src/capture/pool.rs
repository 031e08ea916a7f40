//! Lock-free free-slot pool for capture buffers

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use super::buffer::{BufferDescriptor, BufferGeometry, Channel};

/// Free buffers of one capture channel
pub struct SlotPool {
    /// Ring of buffers owned by the transport and ready to be filled
    ring: HeapRb<BufferDescriptor>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    slots_taken: AtomicUsize,
    slots_returned: AtomicUsize,
    starved: AtomicUsize,
}

impl SlotPool {
    /// Pool pre-filled with `geometry.buffers_per_channel` empty buffers
    pub fn new(channel: Channel, geometry: &BufferGeometry) -> Self {
        let mut ring = HeapRb::new(geometry.buffers_per_channel);
        for _ in 0..geometry.buffers_per_channel {
            // Cannot fail: the ring is sized for exactly this many
            let _ = ring.try_push(BufferDescriptor::new(channel, geometry));
        }

        Self {
            ring,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Take an empty buffer to fill
    pub fn take(&mut self) -> Option<BufferDescriptor> {
        match self.ring.try_pop() {
            Some(buf) => {
                self.stats.slots_taken.fetch_add(1, Ordering::Relaxed);
                Some(buf)
            }
            None => {
                self.stats.starved.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a buffer after commit or teardown
    pub fn give_back(&mut self, mut buf: BufferDescriptor) {
        buf.recycle();
        if self.ring.try_push(buf).is_ok() {
            self.stats.slots_returned.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.slots_taken.load(Ordering::Relaxed),
            self.stats.slots_returned.load(Ordering::Relaxed),
            self.stats.starved.load(Ordering::Relaxed),
        )
    }
}
