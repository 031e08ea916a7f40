//! In-process host: committed packets land in a bounded queue that a [`HostReader`] drains.
//! Control endpoint traffic is recorded for inspection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, trace};

use crate::coord::Coordinator;
use crate::error::TransportError;
use crate::pipeline::header::{parse_flags, HeaderFlags, HEADER_LEN};

use super::transport::{HostTransport, UsbSpeed};

/// What the device answered on the control endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ep0Reply {
    Data(Bytes),
    Ack,
    Stall,
}

pub struct LoopbackHost {
    tx: Sender<Bytes>,
    /// Kept so flushes can drain what the reader has not taken yet
    rx: Receiver<Bytes>,
    speed: AtomicU8,
    nak: AtomicBool,
    fail_commits: AtomicU32,
    ep0: Mutex<Vec<Ep0Reply>>,
}

impl LoopbackHost {
    /// `depth` is the number of packets the host side can hold before commits see backpressure.
    pub fn new(depth: usize, speed: UsbSpeed) -> Self {
        let (tx, rx) = flume::bounded(depth);
        Self {
            tx,
            rx,
            speed: AtomicU8::new(speed_to_u8(speed)),
            nak: AtomicBool::new(false),
            fail_commits: AtomicU32::new(0),
            ep0: Mutex::new(Vec::new()),
        }
    }

    /// Reader side. Every packet it takes counts as consumed.
    pub fn reader(&self, coord: Arc<Coordinator>) -> HostReader {
        HostReader {
            rx: self.rx.clone(),
            coord,
        }
    }

    pub fn set_speed(&self, speed: UsbSpeed) {
        self.speed.store(speed_to_u8(speed), Ordering::Release);
    }

    /// Makes the next `n` commits fail
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::Release);
    }

    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    pub fn is_nak(&self) -> bool {
        self.nak.load(Ordering::Acquire)
    }

    /// Drains the recorded control endpoint replies
    pub fn take_ep0_replies(&self) -> Vec<Ep0Reply> {
        let mut ep0 = self.ep0.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *ep0)
    }

    fn record(&self, reply: Ep0Reply) {
        self.ep0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply);
    }
}

impl HostTransport for LoopbackHost {
    fn commit(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.nak.load(Ordering::Acquire) {
            return Err(TransportError::Commit {
                len: packet.len(),
                reason: "endpoint is NAKing".into(),
            });
        }

        let injected = self
            .fail_commits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Commit {
                len: packet.len(),
                reason: "injected failure".into(),
            });
        }

        match self.tx.try_send(Bytes::copy_from_slice(packet)) {
            Ok(()) => {
                trace!(len = packet.len(), "packet queued to host");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }

    fn flush(&self) {
        let dropped = self.rx.drain().count();
        debug!(dropped, "video endpoint flushed");
    }

    fn set_nak(&self, nak: bool) {
        self.nak.store(nak, Ordering::Release);
    }

    fn clear_stall(&self) {
        trace!("video endpoint stall cleared");
    }

    fn stall(&self) {
        self.record(Ep0Reply::Stall);
    }

    fn ack_control_request(&self) {
        self.record(Ep0Reply::Ack);
    }

    fn send_control_data(&self, data: &[u8]) -> Result<(), TransportError> {
        self.record(Ep0Reply::Data(Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn speed(&self) -> UsbSpeed {
        speed_from_u8(self.speed.load(Ordering::Acquire))
    }
}

fn speed_to_u8(speed: UsbSpeed) -> u8 {
    match speed {
        UsbSpeed::NotConnected => 0,
        UsbSpeed::Low => 1,
        UsbSpeed::Full => 2,
        UsbSpeed::High => 3,
        UsbSpeed::Super => 4,
    }
}

fn speed_from_u8(raw: u8) -> UsbSpeed {
    match raw {
        1 => UsbSpeed::Low,
        2 => UsbSpeed::Full,
        3 => UsbSpeed::High,
        4 => UsbSpeed::Super,
        _ => UsbSpeed::NotConnected,
    }
}

/// One packet as the host received it
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    bytes: Bytes,
}

impl ReceivedPacket {
    pub fn flags(&self) -> HeaderFlags {
        parse_flags(&self.bytes).unwrap_or(HeaderFlags::empty())
    }

    pub fn frame_id(&self) -> bool {
        self.flags().contains(HeaderFlags::FRAME_ID)
    }

    pub fn end_of_frame(&self) -> bool {
        self.flags().contains(HeaderFlags::END_OF_FRAME)
    }

    pub fn payload(&self) -> &[u8] {
        self.bytes.get(HEADER_LEN..).unwrap_or_default()
    }
}

/// Host-side reader of the video endpoint
pub struct HostReader {
    rx: Receiver<Bytes>,
    coord: Arc<Coordinator>,
}

impl HostReader {
    /// Waits for the next packet. `None` once the device side is gone.
    pub async fn read_packet(&self) -> Option<ReceivedPacket> {
        let bytes = self.rx.recv_async().await.ok()?;
        self.coord.on_buffer_consumed();
        Some(ReceivedPacket { bytes })
    }

    pub fn try_read_packet(&self) -> Option<ReceivedPacket> {
        match self.rx.try_recv() {
            Ok(bytes) => {
                self.coord.on_buffer_consumed();
                Some(ReceivedPacket { bytes })
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_when_host_is_full() {
        let host = LoopbackHost::new(1, UsbSpeed::High);
        host.commit(&[0x0C, 0x8C]).unwrap();
        assert_eq!(host.commit(&[0x0C, 0x8C]), Err(TransportError::Backpressure));

        host.flush();
        assert_eq!(host.queued(), 0);
        assert!(host.commit(&[0x0C, 0x8C]).is_ok());
    }

    #[test]
    fn nak_and_injected_failures_reject_commits() {
        let host = LoopbackHost::new(4, UsbSpeed::Super);
        host.set_nak(true);
        assert!(host.commit(&[1]).is_err());
        host.set_nak(false);

        host.fail_next_commits(2);
        assert!(host.commit(&[1]).is_err());
        assert!(host.commit(&[1]).is_err());
        assert!(host.commit(&[1]).is_ok());
    }

    #[test]
    fn reader_counts_consumption() {
        let coord = Arc::new(Coordinator::new());
        let host = LoopbackHost::new(4, UsbSpeed::Super);
        let reader = host.reader(coord.clone());

        let mut packet = vec![0u8; HEADER_LEN + 3];
        packet[0] = HEADER_LEN as u8;
        packet[1] = 0x8E;
        coord.counters.record_produced();
        host.commit(&packet).unwrap();

        let got = reader.try_read_packet().unwrap();
        assert!(got.end_of_frame());
        assert!(!got.frame_id());
        assert_eq!(got.payload().len(), 3);
        assert_eq!(coord.counters.snapshot().consumed, 1);
        assert!(coord.link.streaming_started());
    }

    #[test]
    fn speed_is_switchable() {
        let host = LoopbackHost::new(1, UsbSpeed::NotConnected);
        assert!(!host.speed().is_connected());
        host.set_speed(UsbSpeed::High);
        assert_eq!(host.speed(), UsbSpeed::High);
    }
}
