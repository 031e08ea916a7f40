//! Bus callbacks: link events and setup packet classification.
//!
//! Everything here runs in callback context. It never blocks: requests are queued for the
//! control task and stream teardown is requested through the abort handler.

use std::sync::Arc;

use bytes::Bytes;
use flume::{Sender, TrySendError};
use tracing::{debug, info, instrument, warn};

use crate::capture::CaptureTransport;
use crate::control::request::{
    CLEAR_FEATURE, CONTROL_INTERFACE, SET_INTERFACE, STANDARD_ENDPOINT_OUT,
    STANDARD_INTERFACE_OUT, STREAM_INTERFACE, VIDEO_ENDPOINT,
};
use crate::control::{ControlRequest, SetupPacket};
use crate::coord::{Coordinator, Events};
use crate::host::HostTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Reset,
    Suspend,
    Disconnect,
    AltSettingChange { interface: u8, alt_setting: u8 },
}

pub struct BusMonitor {
    coord: Arc<Coordinator>,
    capture: Arc<dyn CaptureTransport>,
    host: Arc<dyn HostTransport>,
    requests: Sender<ControlRequest>,
}

impl BusMonitor {
    pub fn new(
        coord: Arc<Coordinator>,
        capture: Arc<dyn CaptureTransport>,
        host: Arc<dyn HostTransport>,
        requests: Sender<ControlRequest>,
    ) -> Self {
        Self {
            coord,
            capture,
            host,
            requests,
        }
    }

    pub fn on_bus_event(&self, event: BusEvent) {
        info!(?event, "bus event");
        match event {
            BusEvent::Reset | BusEvent::Suspend | BusEvent::Disconnect => {
                // Capture state machine needs a full reload after this
                self.capture.disable();
                self.coord.link.set_streaming_started(false);
                if event == BusEvent::Disconnect {
                    self.coord.link.set_connected(false);
                }
                if event == BusEvent::Reset && self.coord.link.is_faulted() {
                    self.coord.link.clear_fault();
                }
                self.coord.abort_stream();
            }
            BusEvent::AltSettingChange {
                interface,
                alt_setting: 0,
            } if interface == STREAM_INTERFACE => self.explicit_stop(),
            BusEvent::AltSettingChange { .. } => {}
        }
    }

    /// Setup callback. Returns false when the request is left to the bus stack.
    pub fn on_setup(&self, setup: SetupPacket, data: Bytes) -> bool {
        if setup.is_class_request() {
            let event = match setup.interface() {
                CONTROL_INTERFACE => Events::CONTROL_REQUEST,
                STREAM_INTERFACE => Events::STREAM_REQUEST,
                _ => return false,
            };
            match self.requests.try_send(ControlRequest::new(setup, data)) {
                Ok(()) => self.coord.events.set(event),
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                    warn!(?setup, "control request queue unavailable, stalling");
                    self.host.stall();
                }
            }
            return true;
        }

        match (setup.request_type, setup.request) {
            (STANDARD_INTERFACE_OUT, SET_INTERFACE)
                if setup.index == STREAM_INTERFACE as u16 && setup.value == 0 =>
            {
                self.explicit_stop();
                self.host.ack_control_request();
                true
            }
            (STANDARD_ENDPOINT_OUT, CLEAR_FEATURE) if setup.index == VIDEO_ENDPOINT => {
                // Some hosts clear the endpoint right after COMMIT; only a stop once data moved
                if self.coord.link.streaming_started() {
                    self.explicit_stop();
                } else {
                    debug!("endpoint clear before streaming started");
                }
                self.host.ack_control_request();
                true
            }
            _ => false,
        }
    }

    /// Host asked to stop: reset the data path here so the lifecycle task does not flush again.
    ///
    /// While streaming, the endpoint keeps NAKing until the lifecycle task has torn the stream
    /// down, so nothing committed after the flush can reach the host.
    #[instrument(skip(self))]
    pub fn explicit_stop(&self) {
        self.capture.disable();
        self.coord.link.set_streaming_started(false);

        self.host.set_nak(true);
        if let Err(e) = self.capture.reset() {
            warn!(%e, "capture reset on stop failed");
        }
        self.host.flush();

        self.coord.link.mark_explicit_stop();
        if !self.coord.abort_stream() {
            // Not streaming: nobody will consume the marker or release the endpoint
            self.coord.link.take_explicit_stop();
            self.host.set_nak(false);
            self.host.clear_stall();
        }
    }
}
