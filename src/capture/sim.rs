//! Software capture transport: alternates buffers across two channels the way the parallel
//! capture interface does, and reports buffer-ready and end-of-frame through the event queue.

use std::sync::{Mutex, MutexGuard};

use flume::Sender;
use tracing::{debug, instrument, trace, warn};

use crate::capture::buffer::{BufferDescriptor, BufferGeometry, Channel};
use crate::capture::pool::SlotPool;
use crate::capture::transport::{CaptureEvent, CaptureTransport, TerminalState};
use crate::error::TransportError;

/// Simulated capture hardware
pub struct SimulatedCapture {
    geometry: BufferGeometry,
    events: Sender<CaptureEvent>,
    inner: Mutex<Inner>,
}

struct Inner {
    pools: [SlotPool; 2],
    /// Buffer currently being filled, if any
    filling: Option<BufferDescriptor>,
    active: Channel,
    armed: bool,
    loaded: bool,
    running: bool,
    overflows: u64,
}

/// What happened to one pushed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub buffers: usize,
    pub dropped_bytes: usize,
    pub terminal: TerminalState,
}

impl SimulatedCapture {
    pub fn new(geometry: BufferGeometry, events: Sender<CaptureEvent>) -> Self {
        let pools = Channel::ALL.map(|ch| SlotPool::new(ch, &geometry));
        Self {
            geometry,
            events,
            inner: Mutex::new(Inner {
                pools,
                filling: None,
                active: Channel::Ch0,
                armed: false,
                loaded: false,
                running: false,
                overflows: 0,
            }),
        }
    }

    pub fn geometry(&self) -> &BufferGeometry {
        &self.geometry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going with it
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the state machine is running and will accept sensor data
    pub fn is_capturing(&self) -> bool {
        let inner = self.lock();
        inner.armed && inner.running
    }

    /// Free buffers across both channels
    pub fn free_slots(&self) -> usize {
        let inner = self.lock();
        inner.pools.iter().map(SlotPool::len).sum()
    }

    pub fn overflows(&self) -> u64 {
        self.lock().overflows
    }

    /// Clock one whole frame of sensor data through the capture interface.
    ///
    /// Full buffers are handed over as they fill, alternating channels. The capture state machine
    /// then parks in its terminal state until restarted, as the hardware does at frame end.
    #[instrument(skip(self, frame), fields(len = frame.len()))]
    pub fn push_frame(&self, frame: &[u8]) -> Result<FrameReport, TransportError> {
        let mut inner = self.lock();
        if !(inner.armed && inner.running) {
            return Err(TransportError::Arm("capture state machine is not running".into()));
        }

        let mut remaining = frame;
        let mut buffers = 0;
        let mut last_full = inner.active;

        while !remaining.is_empty() {
            let channel = inner.active;
            let mut buf = match inner.filling.take() {
                Some(buf) => buf,
                None => match inner.pools[channel.index()].take() {
                    Some(buf) => buf,
                    None => {
                        // Backflow: host is not draining fast enough
                        inner.overflows += 1;
                        warn!(?channel, dropped = remaining.len(), "capture overflow");
                        break;
                    }
                },
            };

            let n = buf.fill(remaining);
            remaining = &remaining[n..];

            if buf.is_full() {
                if remaining.is_empty() {
                    buf.flag_eof();
                }
                trace!(?channel, "buffer full");
                self.hand_over(&mut inner, CaptureEvent::SlotReady(buf))?;
                buffers += 1;
                last_full = channel;
                inner.active = channel.other();
            } else {
                inner.filling = Some(buf);
            }
        }

        let terminal = match &inner.filling {
            Some(buf) => TerminalState::PartialBuffer(buf.channel()),
            None => TerminalState::FullBuffer(last_full),
        };
        inner.running = false;
        self.hand_over(&mut inner, CaptureEvent::EndOfFrame(terminal))?;

        debug!(buffers, ?terminal, "frame captured");
        Ok(FrameReport {
            buffers,
            dropped_bytes: remaining.len(),
            terminal,
        })
    }

    fn hand_over(&self, inner: &mut Inner, event: CaptureEvent) -> Result<(), TransportError> {
        // Callback context: never block on the queue
        self.events.try_send(event).map_err(|e| {
            inner.overflows += 1;
            if let CaptureEvent::SlotReady(buf) = e.into_inner() {
                let ch = buf.channel();
                inner.pools[ch.index()].give_back(buf);
            }
            TransportError::Backpressure
        })
    }
}

impl CaptureTransport for SimulatedCapture {
    fn arm(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.armed = true;
        inner.active = Channel::Ch0;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    fn load_state_machine(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.loaded = true;
        inner.running = true;
        debug!("capture state machine loaded");
        Ok(())
    }

    fn restart_state_machine(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.loaded {
            return Err(TransportError::Arm("state machine not loaded".into()));
        }
        inner.running = true;
        Ok(())
    }

    fn disable(&self) {
        let mut inner = self.lock();
        inner.loaded = false;
        inner.running = false;
    }

    fn force_flush(&self, channel: Channel) -> Result<BufferDescriptor, TransportError> {
        let mut inner = self.lock();
        match inner.filling.take() {
            Some(buf) if buf.channel() == channel => Ok(buf),
            other => {
                inner.filling = other;
                Err(TransportError::NothingToFlush(channel))
            }
        }
    }

    fn reset(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(buf) = inner.filling.take() {
            let ch = buf.channel();
            inner.pools[ch.index()].give_back(buf);
        }
        inner.armed = false;
        inner.active = Channel::Ch0;
        Ok(())
    }

    fn release(&self, buffer: BufferDescriptor) {
        let ch = buffer.channel();
        self.lock().pools[ch.index()].give_back(buffer);
    }

    fn buffer_count(&self) -> usize {
        self.geometry.buffer_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> BufferGeometry {
        BufferGeometry {
            buffer_size: 16384,
            header_len: 12,
            footer_len: 4,
            buffers_per_channel: 4,
        }
    }

    fn started() -> (SimulatedCapture, flume::Receiver<CaptureEvent>) {
        let (tx, rx) = flume::bounded(16);
        let capture = SimulatedCapture::new(geometry(), tx);
        capture.arm().unwrap();
        capture.load_state_machine().unwrap();
        (capture, rx)
    }

    #[test]
    fn frame_alternates_channels_and_leaves_partial() {
        let (capture, rx) = started();
        let cap = geometry().payload_capacity();

        let report = capture.push_frame(&vec![1u8; cap * 3 + 5000]).unwrap();
        assert_eq!(report.buffers, 3);
        assert_eq!(report.terminal, TerminalState::PartialBuffer(Channel::Ch1));

        let channels: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                CaptureEvent::SlotReady(buf) => Some(buf.channel()),
                CaptureEvent::EndOfFrame(_) => None,
            })
            .collect();
        assert_eq!(channels, vec![Channel::Ch0, Channel::Ch1, Channel::Ch0]);

        assert!(capture.force_flush(Channel::Ch0).is_err());
        let partial = capture.force_flush(Channel::Ch1).unwrap();
        assert_eq!(partial.filled(), 5000);
        assert!(!capture.is_capturing());
    }

    #[test]
    fn exact_boundary_flags_last_buffer() {
        let (capture, rx) = started();
        let cap = geometry().payload_capacity();

        let report = capture.push_frame(&vec![0u8; cap * 2]).unwrap();
        assert_eq!(report.terminal, TerminalState::FullBuffer(Channel::Ch1));

        let flagged: Vec<bool> = rx
            .try_iter()
            .filter_map(|e| match e {
                CaptureEvent::SlotReady(buf) => Some(buf.eof_flagged()),
                CaptureEvent::EndOfFrame(_) => None,
            })
            .collect();
        assert_eq!(flagged, vec![false, true]);
    }

    #[test]
    fn refuses_data_until_restarted() {
        let (capture, _rx) = started();
        capture.push_frame(&[0u8; 10]).unwrap();
        assert!(capture.push_frame(&[0u8; 10]).is_err());

        capture.reset().unwrap();
        capture.arm().unwrap();
        capture.restart_state_machine().unwrap();
        assert!(capture.push_frame(&[0u8; 10]).is_ok());
    }

    #[test]
    fn disable_forces_full_reload() {
        let (capture, _rx) = started();
        capture.disable();
        assert!(!capture.is_loaded());
        assert!(capture.restart_state_machine().is_err());
    }
}
