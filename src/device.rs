//! Wires the transports, shared state and both tasks into one running device

use std::sync::Arc;

use flume::Receiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::BusMonitor;
use crate::capture::{CaptureEvent, CaptureTransport, SimulatedCapture};
use crate::control::{ControlDispatcher, VendorCommand};
use crate::coord::Coordinator;
use crate::error::InitError;
use crate::host::{HostReader, HostTransport, LoopbackHost, UsbSpeed};
use crate::pipeline::{StreamController, StreamState};
use crate::sensor::{SensorControl, SimulatedSensor};
use crate::{Config, CONFIG};

/// Hardware handles the core runs on
pub struct DeviceParts {
    pub capture: Arc<dyn CaptureTransport>,
    pub capture_events: Receiver<CaptureEvent>,
    pub host: Arc<dyn HostTransport>,
    pub sensor: Arc<dyn SensorControl>,
}

/// Simulated hardware, kept by the caller to drive a session
pub struct SimulatedRig {
    pub capture: Arc<SimulatedCapture>,
    pub host: Arc<LoopbackHost>,
    pub sensor: Arc<SimulatedSensor>,
    pub reader: HostReader,
}

pub struct Device {
    coord: Arc<Coordinator>,
    bus: BusMonitor,
    state: watch::Receiver<StreamState>,
    lifecycle: JoinHandle<()>,
    control: JoinHandle<()>,
}

impl Device {
    /// Validates the configuration, initialises the sensor and spawns the lifecycle and control
    /// tasks. Must be called from within a tokio runtime.
    pub fn start(config: &Config, parts: DeviceParts) -> Result<Self, InitError> {
        config.validate()?;
        parts.sensor.apply_command(VendorCommand::SensorDefaults)?;

        let coord = Arc::new(Coordinator::new());
        let (req_tx, req_rx) = flume::bounded(config.control.request_queue_depth);

        let bus = BusMonitor::new(
            coord.clone(),
            parts.capture.clone(),
            parts.host.clone(),
            req_tx,
        );

        let controller = StreamController::new(
            coord.clone(),
            parts.capture,
            parts.host.clone(),
            parts.capture_events,
            config.stream.max_commit_failures,
        );
        let state = controller.subscribe();

        let dispatcher = ControlDispatcher::new(
            coord.clone(),
            parts.host,
            parts.sensor,
            &config.control,
            config.stream.default_speed,
        );

        let lifecycle = tokio::spawn(controller.run());
        let control = tokio::spawn(dispatcher.run(req_rx));
        info!("device started");

        Ok(Self {
            coord,
            bus,
            state,
            lifecycle,
            control,
        })
    }

    /// Device on simulated capture, host and sensor, configured from the current `CONFIG`.
    pub fn simulated() -> Result<(Self, SimulatedRig), InitError> {
        let config = CONFIG.load_full();
        config.validate()?;
        let geometry = config.capture.geometry();
        let (tx, rx) = flume::bounded(config.capture.event_queue_depth);

        let capture = Arc::new(SimulatedCapture::new(geometry, tx));
        let host = Arc::new(LoopbackHost::new(
            geometry.buffer_count(),
            UsbSpeed::NotConnected,
        ));
        let sensor = Arc::new(SimulatedSensor::new());

        let device = Device::start(
            &config,
            DeviceParts {
                capture: capture.clone(),
                capture_events: rx,
                host: host.clone(),
                sensor: sensor.clone(),
            },
        )?;
        let reader = host.reader(device.coordinator().clone());

        Ok((
            device,
            SimulatedRig {
                capture,
                host,
                sensor,
                reader,
            },
        ))
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coord
    }

    /// Entry points for bus callbacks
    pub fn bus(&self) -> &BusMonitor {
        &self.bus
    }

    pub fn stream_state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Waits until the lifecycle controller reaches `target`.
    pub async fn wait_for_state(&self, target: StreamState) {
        let mut rx = self.state.clone();
        // Only fails once the lifecycle task is gone
        let _ = rx.wait_for(|state| *state == target).await;
    }

    pub fn shutdown(self) {
        self.lifecycle.abort();
        self.control.abort();
        info!("device stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CaptureConfig;

    // Only test in this binary that touches CONFIG
    #[tokio::test]
    async fn simulated_device_follows_global_config() {
        let mut config = Config::default();
        config.capture = CaptureConfig {
            buffers_per_channel: 2,
            event_queue_depth: 8,
            ..CaptureConfig::default()
        };
        CONFIG.store(Arc::new(config.clone()));

        let (device, rig) = Device::simulated().unwrap();
        assert_eq!(rig.capture.buffer_count(), 4);
        assert_eq!(device.stream_state(), StreamState::Idle);
        device.shutdown();

        config.capture.event_queue_depth = 4;
        CONFIG.store(Arc::new(config));
        assert!(matches!(Device::simulated(), Err(InitError::Invalid(_))));

        CONFIG.store(Arc::new(Config::default()));
    }
}
