//! Buffer commit engine: stamps the payload header on each captured buffer, commits it to the
//! host in capture order and detects frame boundaries.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::capture::{BufferDescriptor, CaptureEvent, CaptureTransport, TerminalState};
use crate::coord::Coordinator;
use crate::error::TransportError;
use crate::host::HostTransport;

use super::header::PayloadHeader;

/// Result of one commit attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing waiting to be committed.
    Idle,
    /// The oldest pending buffer went out. `terminal` if it carried end of frame.
    Committed { terminal: bool },
    /// Every buffer is already in flight; the host has to read some first.
    Held,
    /// The host transport refused the buffer. It stays queued and is retried.
    Failed(TransportError),
}

pub struct CommitEngine {
    coord: Arc<Coordinator>,
    capture: Arc<dyn CaptureTransport>,
    host: Arc<dyn HostTransport>,

    header: PayloadHeader,
    /// Captured buffers in capture order, not yet committed
    pending: VecDeque<BufferDescriptor>,
    in_flight_limit: u32,

    /// End of frame was signalled for the frame in progress
    eof_seen: bool,
    /// A flushed partial buffer is queued and has not been committed yet
    partial_outstanding: bool,

    consecutive_failures: u32,
    frames: u64,
}

impl CommitEngine {
    pub fn new(
        coord: Arc<Coordinator>,
        capture: Arc<dyn CaptureTransport>,
        host: Arc<dyn HostTransport>,
    ) -> Self {
        let in_flight_limit = capture.buffer_count() as u32;
        Self {
            coord,
            capture,
            host,
            header: PayloadHeader::new(),
            pending: VecDeque::new(),
            in_flight_limit,
            eof_seen: false,
            partial_outstanding: false,
            consecutive_failures: 0,
            frames: 0,
        }
    }

    pub fn on_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::SlotReady(buf) => {
                trace!(channel = ?buf.channel(), filled = buf.filled(), "buffer ready");
                self.pending.push_back(buf);
            }
            CaptureEvent::EndOfFrame(state) => self.end_of_frame(state),
        }
    }

    fn end_of_frame(&mut self, state: TerminalState) {
        self.eof_seen = true;
        match state {
            // Last buffer already went out full
            TerminalState::FullBuffer(_) => {}
            TerminalState::PartialBuffer(channel) => match self.capture.force_flush(channel) {
                Ok(buf) => {
                    self.partial_outstanding = true;
                    self.pending.push_back(buf);
                }
                Err(e) => warn!(%e, "could not flush partial buffer"),
            },
            TerminalState::Other(id) => {
                warn!(e = %TransportError::UnexpectedState(id), "frame ended in unexpected state");
            }
        }
    }

    /// Commits the oldest pending buffer.
    #[instrument(level = "trace", skip(self))]
    pub fn commit_next(&mut self) -> CommitOutcome {
        if self.pending.is_empty() {
            return CommitOutcome::Idle;
        }
        if self.coord.counters.snapshot().in_flight() >= self.in_flight_limit {
            return CommitOutcome::Held;
        }

        let header = &self.header;
        let Some(buf) = self.pending.front_mut() else {
            return CommitOutcome::Idle;
        };
        let terminal = buf.is_frame_terminal();
        let partial = !buf.is_full();
        header.write_into(buf.header_mut(), terminal);

        if let Err(e) = self.host.commit(buf.packet()) {
            self.consecutive_failures += 1;
            metrics::counter!("uvc.commit_failures").increment(1);
            warn!(%e, failures = self.consecutive_failures, "commit failed");
            return CommitOutcome::Failed(e);
        }

        self.consecutive_failures = 0;
        let produced = self.coord.counters.record_produced();
        if partial {
            self.partial_outstanding = false;
        }
        if let Some(buf) = self.pending.pop_front() {
            self.capture.release(buf);
        }
        metrics::counter!("uvc.buffers_committed").increment(1);
        trace!(produced, terminal, "buffer committed");

        CommitOutcome::Committed { terminal }
    }

    /// Closes the frame if every buffer of it was committed and read by the host.
    ///
    /// Resets the counters and toggles the frame id; returns the running frame count.
    pub fn try_finish_frame(&mut self) -> Option<u64> {
        let complete = self.eof_seen
            && !self.partial_outstanding
            && self.pending.is_empty()
            && self.coord.counters.snapshot().drained();
        if !complete {
            return None;
        }

        self.coord.counters.reset();
        self.eof_seen = false;
        self.header.toggle_frame_id();
        self.frames += 1;
        metrics::counter!("uvc.frames_completed").increment(1);
        debug!(frame = self.frames, fid = self.header.frame_id(), "frame complete");
        Some(self.frames)
    }

    /// Drops everything belonging to the current stream.
    ///
    /// Pending buffers go back to the capture pools uncommitted. The frame id is left alone: the
    /// host sees a fresh id on the next frame either way.
    pub fn abort(&mut self) {
        let discarded = self.pending.len();
        for buf in self.pending.drain(..) {
            self.capture.release(buf);
        }
        self.coord.counters.reset();
        self.eof_seen = false;
        self.partial_outstanding = false;
        self.consecutive_failures = 0;
        debug!(discarded, "commit engine reset");
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn partial_outstanding(&self) -> bool {
        self.partial_outstanding
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_id(&self) -> bool {
        self.header.frame_id()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferGeometry, SimulatedCapture};
    use crate::host::{LoopbackHost, UsbSpeed};
    use crate::pipeline::header::{FOOTER_LEN, HEADER_LEN};

    struct Rig {
        coord: Arc<Coordinator>,
        capture: Arc<SimulatedCapture>,
        host: Arc<LoopbackHost>,
        events: flume::Receiver<CaptureEvent>,
        engine: CommitEngine,
    }

    fn rig() -> Rig {
        let geometry = BufferGeometry {
            buffer_size: 16384,
            header_len: HEADER_LEN,
            footer_len: FOOTER_LEN,
            buffers_per_channel: 4,
        };
        let (tx, events) = flume::bounded(16);
        let coord = Arc::new(Coordinator::new());
        let capture = Arc::new(SimulatedCapture::new(geometry, tx));
        let host = Arc::new(LoopbackHost::new(8, UsbSpeed::Super));
        let engine = CommitEngine::new(coord.clone(), capture.clone(), host.clone());
        capture.arm().unwrap();
        capture.load_state_machine().unwrap();
        Rig {
            coord,
            capture,
            host,
            events,
            engine,
        }
    }

    impl Rig {
        fn pump(&mut self) {
            while let Ok(ev) = self.events.try_recv() {
                self.engine.on_event(ev);
            }
        }
    }

    #[test]
    fn partial_frame_end_commits_in_order() {
        let mut rig = rig();
        let reader = rig.host.reader(rig.coord.clone());
        rig.capture.push_frame(&vec![0xAB; 16368 * 3 + 5000]).unwrap();
        rig.pump();
        assert!(rig.engine.partial_outstanding());

        let mut terminals = Vec::new();
        while let CommitOutcome::Committed { terminal } = rig.engine.commit_next() {
            terminals.push(terminal);
        }
        assert_eq!(terminals, vec![false, false, false, true]);
        assert!(!rig.engine.partial_outstanding());

        // Host has not read anything yet
        assert_eq!(rig.engine.try_finish_frame(), None);

        let eof: Vec<bool> = std::iter::from_fn(|| reader.try_read_packet())
            .map(|p| p.end_of_frame())
            .collect();
        assert_eq!(eof, vec![false, false, false, true]);

        assert_eq!(rig.engine.try_finish_frame(), Some(1));
        assert!(rig.engine.frame_id());
        assert_eq!(rig.coord.counters.snapshot().produced, 0);
        assert_eq!(rig.engine.try_finish_frame(), None);
    }

    #[test]
    fn failed_commit_is_retried_without_counting() {
        let mut rig = rig();
        rig.capture.push_frame(&[1u8; 100]).unwrap();
        rig.pump();

        rig.host.fail_next_commits(1);
        assert!(matches!(rig.engine.commit_next(), CommitOutcome::Failed(_)));
        assert_eq!(rig.engine.consecutive_failures(), 1);
        assert_eq!(rig.coord.counters.snapshot().produced, 0);
        assert_eq!(rig.engine.pending(), 1);

        assert_eq!(
            rig.engine.commit_next(),
            CommitOutcome::Committed { terminal: true }
        );
        assert_eq!(rig.engine.consecutive_failures(), 0);
        assert_eq!(rig.coord.counters.snapshot().produced, 1);
    }

    #[test]
    fn holds_when_all_buffers_in_flight() {
        let mut rig = rig();
        for _ in 0..8 {
            rig.coord.counters.record_produced();
        }
        rig.capture.push_frame(&[1u8; 10]).unwrap();
        rig.pump();
        assert_eq!(rig.engine.commit_next(), CommitOutcome::Held);
    }

    #[test]
    fn abort_clears_partial_and_counters() {
        let mut rig = rig();
        rig.capture.push_frame(&vec![0u8; 16368 + 10]).unwrap();
        rig.pump();
        assert_eq!(
            rig.engine.commit_next(),
            CommitOutcome::Committed { terminal: false }
        );

        let free_before = rig.capture.free_slots();
        rig.engine.abort();
        assert!(!rig.engine.partial_outstanding());
        assert_eq!(rig.engine.pending(), 0);
        assert_eq!(rig.coord.counters.snapshot().produced, 0);
        assert_eq!(rig.capture.free_slots(), free_before + 1);
        assert_eq!(rig.engine.try_finish_frame(), None);
    }
}
