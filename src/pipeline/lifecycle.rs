//! Streaming lifecycle controller and the task that drives it

use std::fmt;
use std::sync::Arc;

use flume::Receiver;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::capture::{CaptureEvent, CaptureTransport};
use crate::coord::{Coordinator, Events};
use crate::error::TransportError;
use crate::host::HostTransport;

use super::commit::{CommitEngine, CommitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Armed,
    Streaming,
    Aborting,
    /// Persistent transport failure. Left only through a bus reset.
    Faulted,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Armed => "armed",
            StreamState::Streaming => "streaming",
            StreamState::Aborting => "aborting",
            StreamState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// What one pass of the controller found to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Streaming or tearing down; poll again after yielding.
    Busy,
    /// Nothing enabled; block until the host commits.
    Idle,
    /// Faulted; block until a bus reset clears it.
    Halted,
}

pub struct StreamController {
    coord: Arc<Coordinator>,
    capture: Arc<dyn CaptureTransport>,
    host: Arc<dyn HostTransport>,
    events: Receiver<CaptureEvent>,
    engine: CommitEngine,
    max_commit_failures: u32,
    state: StreamState,
    state_tx: watch::Sender<StreamState>,
}

impl StreamController {
    pub fn new(
        coord: Arc<Coordinator>,
        capture: Arc<dyn CaptureTransport>,
        host: Arc<dyn HostTransport>,
        events: Receiver<CaptureEvent>,
        max_commit_failures: u32,
    ) -> Self {
        let engine = CommitEngine::new(coord.clone(), capture.clone(), host.clone());
        let (state_tx, _) = watch::channel(StreamState::Idle);
        Self {
            coord,
            capture,
            host,
            events,
            engine,
            max_commit_failures,
            state: StreamState::Idle,
            state_tx,
        }
    }

    /// Observers of state transitions
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn engine(&self) -> &CommitEngine {
        &self.engine
    }

    fn set_state(&mut self, next: StreamState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "stream state");
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    /// One pass of the lifecycle loop. Never blocks.
    pub fn poll(&mut self) -> Activity {
        if self.state == StreamState::Faulted {
            if self.coord.link.is_faulted() {
                // Host requests to stream are dropped until an external reset
                self.coord.events.clear(Events::STREAM | Events::STREAM_ABORT);
                return Activity::Halted;
            }
            info!("fault cleared by bus reset");
            self.set_state(StreamState::Idle);
        }

        // An abort is always honoured first, even if the host committed again since
        let aborted = !self.coord.events.take(Events::STREAM_ABORT).is_empty();
        if aborted {
            self.teardown();
        }

        if self.coord.events.contains(Events::STREAM) {
            if self.state == StreamState::Idle {
                if let Err(e) = self.arm() {
                    self.fatal(e);
                    return Activity::Halted;
                }
            }
            self.service();
            return Activity::Busy;
        }

        if aborted {
            Activity::Busy
        } else {
            Activity::Idle
        }
    }

    /// IDLE -> ARMED
    fn arm(&mut self) -> Result<(), TransportError> {
        self.capture.arm()?;
        if self.capture.is_loaded() {
            self.capture.restart_state_machine()?;
        } else {
            self.capture.load_state_machine()?;
        }
        self.set_state(StreamState::Armed);
        Ok(())
    }

    fn service(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.engine.on_event(event);
        }

        match self.engine.commit_next() {
            CommitOutcome::Committed { .. } => {
                if self.state == StreamState::Armed {
                    self.set_state(StreamState::Streaming);
                }
            }
            CommitOutcome::Failed(e) => {
                if self.engine.consecutive_failures() >= self.max_commit_failures {
                    self.fatal(e);
                    return;
                }
            }
            CommitOutcome::Idle | CommitOutcome::Held => {}
        }

        if self.engine.try_finish_frame().is_some() {
            if let Err(e) = self.rearm_channels() {
                self.fatal(e);
            }
        }
    }

    /// Frame boundary: back to the first channel and the entry state.
    fn rearm_channels(&mut self) -> Result<(), TransportError> {
        self.capture.reset()?;
        self.capture.arm()?;
        self.capture.restart_state_machine()
    }

    /// ABORTING -> IDLE
    #[instrument(skip(self))]
    fn teardown(&mut self) {
        self.set_state(StreamState::Aborting);
        let explicit = self.coord.link.take_explicit_stop();

        self.discard_capture_events();
        self.engine.abort();

        if explicit {
            // Data path was reset by the stop requester, which left the endpoint NAKing
            self.host.set_nak(false);
            self.host.clear_stall();
        } else {
            if let Err(e) = self.capture.reset() {
                warn!(%e, "capture reset during abort failed");
            }
            self.host.flush();
        }

        self.coord.link.set_streaming_started(false);
        metrics::counter!("uvc.stream_aborts").increment(1);
        self.set_state(StreamState::Idle);
    }

    fn fatal(&mut self, e: TransportError) {
        error!(%e, "persistent transport failure, streaming halted until bus reset");
        self.coord.link.set_faulted(true);
        self.coord.events.clear(Events::STREAM | Events::STREAM_ABORT);
        self.discard_capture_events();
        self.engine.abort();
        self.capture.disable();
        if let Err(e) = self.capture.reset() {
            warn!(%e, "capture reset after fault failed");
        }
        self.host.flush();
        self.coord.link.set_streaming_started(false);
        self.set_state(StreamState::Faulted);
    }

    /// Buffers captured before an abort are stale
    fn discard_capture_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let CaptureEvent::SlotReady(buf) = event {
                self.capture.release(buf);
            }
        }
    }

    /// Lifecycle task body. Runs until the task is aborted.
    pub async fn run(mut self) {
        info!("stream lifecycle task started");
        loop {
            match self.poll() {
                Activity::Busy => {}
                Activity::Idle => self.coord.events.wait_all(Events::STREAM).await,
                Activity::Halted => self.coord.link.wait_fault_cleared().await,
            }
            tokio::task::yield_now().await;
        }
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
        ctl: StreamController,
    }

    fn rig(max_commit_failures: u32) -> Rig {
        let geometry = BufferGeometry {
            buffer_size: 256,
            header_len: HEADER_LEN,
            footer_len: FOOTER_LEN,
            buffers_per_channel: 2,
        };
        let (tx, rx) = flume::bounded(16);
        let coord = Arc::new(Coordinator::new());
        let capture = Arc::new(SimulatedCapture::new(geometry, tx));
        let host = Arc::new(LoopbackHost::new(4, UsbSpeed::High));
        let ctl = StreamController::new(
            coord.clone(),
            capture.clone(),
            host.clone(),
            rx,
            max_commit_failures,
        );
        Rig {
            coord,
            capture,
            host,
            ctl,
        }
    }

    #[test]
    fn idle_until_stream_enabled() {
        let mut rig = rig(4);
        assert_eq!(rig.ctl.poll(), Activity::Idle);

        rig.coord.events.set(Events::STREAM);
        assert_eq!(rig.ctl.poll(), Activity::Busy);
        assert_eq!(rig.ctl.state(), StreamState::Armed);
        assert!(rig.capture.is_capturing());
    }

    #[test]
    fn first_commit_moves_to_streaming() {
        let mut rig = rig(4);
        rig.coord.events.set(Events::STREAM);
        rig.ctl.poll();

        rig.capture.push_frame(&[5u8; 20]).unwrap();
        rig.ctl.poll();
        assert_eq!(rig.ctl.state(), StreamState::Streaming);
        assert_eq!(rig.host.queued(), 1);
    }

    #[test]
    fn abort_returns_to_idle_and_flushes() {
        let mut rig = rig(4);
        rig.coord.events.set(Events::STREAM);
        rig.ctl.poll();
        rig.capture.push_frame(&[5u8; 20]).unwrap();
        rig.ctl.poll();

        assert!(rig.coord.abort_stream());
        assert_eq!(rig.ctl.poll(), Activity::Busy);
        assert_eq!(rig.ctl.state(), StreamState::Idle);
        assert_eq!(rig.host.queued(), 0);
        assert_eq!(rig.coord.counters.snapshot().produced, 0);
        assert_eq!(rig.ctl.poll(), Activity::Idle);
    }

    #[test]
    fn persistent_failure_faults_until_reset() {
        let mut rig = rig(2);
        rig.coord.events.set(Events::STREAM);
        rig.ctl.poll();
        rig.capture.push_frame(&[5u8; 20]).unwrap();

        rig.host.fail_next_commits(10);
        rig.ctl.poll();
        rig.ctl.poll();
        assert_eq!(rig.ctl.state(), StreamState::Faulted);
        assert_eq!(rig.ctl.poll(), Activity::Halted);
        assert!(rig.coord.link.is_faulted());

        // Host commits again: ignored while faulted
        rig.coord.events.set(Events::STREAM);
        assert_eq!(rig.ctl.poll(), Activity::Halted);
        assert!(!rig.coord.events.contains(Events::STREAM));

        rig.coord.link.clear_fault();
        assert_eq!(rig.ctl.poll(), Activity::Idle);
        assert_eq!(rig.ctl.state(), StreamState::Idle);
    }
}
