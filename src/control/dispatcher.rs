//! Control request dispatcher and the task that feeds it

use std::sync::Arc;

use bytes::Bytes;
use flume::Receiver;
use tracing::{debug, info, instrument, warn};

use crate::coord::{Coordinator, Events};
use crate::error::{ProtocolError, SensorIoError};
use crate::host::{HostTransport, UsbSpeed};
use crate::sensor::SensorControl;
use crate::ControlConfig;

use super::probe::{Negotiation, ProbeCommit, COMMIT_CONTROL, PROBE_CONTROL, PROBE_LEN};
use super::registry::{
    decode_pan_tilt, encode_pan_tilt, Binding, ControlDesc, ControlRegistry, UnitId, ZOOM_MIN,
};
use super::request::{
    ControlRequest, ControlResponse, RequestCode, CONTROL_INTERFACE, STREAM_INTERFACE,
};
use super::vendor::VendorCommand;

/// GET_INFO of the probe and commit controls: GET and SET supported
const STREAM_CONTROL_INFO: u8 = 0x03;

/// Values handed back when the sensor cannot be read
#[derive(Debug, Clone, Copy)]
struct LastKnown {
    brightness: u8,
    gain: u8,
    led_level: u8,
    vendor_command: u8,
}

impl Default for LastKnown {
    fn default() -> Self {
        Self {
            brightness: 255,
            gain: 1,
            led_level: 0,
            vendor_command: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ptz {
    zoom: i64,
    pan: i32,
    tilt: i32,
}

pub struct ControlDispatcher {
    coord: Arc<Coordinator>,
    host: Arc<dyn HostTransport>,
    sensor: Arc<dyn SensorControl>,
    registry: ControlRegistry,
    negotiation: Negotiation,
    last_known: LastKnown,
    ptz: Ptz,
}

impl ControlDispatcher {
    pub fn new(
        coord: Arc<Coordinator>,
        host: Arc<dyn HostTransport>,
        sensor: Arc<dyn SensorControl>,
        config: &ControlConfig,
        default_speed: UsbSpeed,
    ) -> Self {
        Self {
            coord,
            host,
            sensor,
            registry: ControlRegistry::new(config),
            negotiation: Negotiation::new(default_speed),
            last_known: LastKnown::default(),
            ptz: Ptz {
                zoom: ZOOM_MIN,
                pan: 0,
                tilt: 0,
            },
        }
    }

    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    /// Handles one class request. An error means the request must be stalled; in that case
    /// nothing was changed.
    #[instrument(level = "debug", skip(self, req), fields(setup = ?req.setup))]
    pub fn handle(&mut self, req: &ControlRequest) -> Result<ControlResponse, ProtocolError> {
        self.refresh_speed();

        let code = req.code()?;
        match req.setup.interface() {
            CONTROL_INTERFACE => self.handle_unit(req, code),
            STREAM_INTERFACE if req.setup.entity() == 0 => self.handle_streaming(req, code),
            _ => Err(ProtocolError::UnsupportedInterface(req.setup.index)),
        }
    }

    /// First request of a connection: the bus speed decides which parameter preset applies.
    fn refresh_speed(&mut self) {
        if self.coord.link.is_connected() {
            return;
        }
        let speed = self.host.speed();
        if speed.is_connected() {
            info!(?speed, "host connected");
            self.coord.link.set_connected(true);
            self.negotiation.rebase(speed);
        }
    }

    fn handle_streaming(
        &mut self,
        req: &ControlRequest,
        code: RequestCode,
    ) -> Result<ControlResponse, ProtocolError> {
        let selector = req.setup.selector();
        let w_length = req.setup.length;
        let probe = match selector {
            PROBE_CONTROL => true,
            COMMIT_CONTROL => false,
            _ => {
                return Err(ProtocolError::UnsupportedControl {
                    unit: req.setup.entity(),
                    selector,
                })
            }
        };

        let block = match (code, probe) {
            (RequestCode::GetInfo, _) => {
                return Ok(ControlResponse::data(&[STREAM_CONTROL_INFO], w_length));
            }
            (RequestCode::GetLen, _) => {
                let len = (PROBE_LEN as u16).to_le_bytes();
                return Ok(ControlResponse::data(&len, w_length));
            }
            (RequestCode::GetCur, true) => *self.negotiation.proposed(),
            (RequestCode::GetMin | RequestCode::GetMax | RequestCode::GetDef, true) => {
                self.negotiation.preset()
            }
            (RequestCode::GetCur, false) => *self.negotiation.active(),
            (RequestCode::SetCur, true) => {
                let requested = ProbeCommit::from_bytes(&req.data)?;
                self.negotiation.stage(&requested);
                debug!(interval = self.negotiation.proposed().frame_interval, "probe staged");
                return Ok(ControlResponse::Ack);
            }
            (RequestCode::SetCur, false) => {
                ProbeCommit::from_bytes(&req.data)?;
                let active = self.negotiation.commit();
                info!(
                    fps = active.frame_rate(),
                    max_frame_size = active.max_video_frame_size,
                    "stream parameters committed"
                );
                self.coord.events.set(Events::STREAM);
                return Ok(ControlResponse::Ack);
            }
            _ => {
                return Err(ProtocolError::UnsupportedRequest {
                    unit: req.setup.entity(),
                    selector,
                    request: code,
                })
            }
        };

        Ok(ControlResponse::data(&block.to_bytes(), w_length))
    }

    fn handle_unit(
        &mut self,
        req: &ControlRequest,
        code: RequestCode,
    ) -> Result<ControlResponse, ProtocolError> {
        let selector = req.setup.selector();
        let unit = UnitId::try_from(req.setup.entity())
            .map_err(|unit| ProtocolError::UnsupportedControl { unit, selector })?;
        let control = *self.registry.lookup(unit, selector, code)?;
        let w_length = req.setup.length;

        let reply = match code {
            RequestCode::SetCur => {
                let data = req.data_at_least(control.len)?;
                self.write_current(&control, selector, data)?;
                return Ok(ControlResponse::Ack);
            }
            RequestCode::GetCur => self.read_current(&control),
            RequestCode::GetInfo => Bytes::copy_from_slice(&[control.info()]),
            RequestCode::GetLen => Bytes::copy_from_slice(&(control.len as u16).to_le_bytes()),
            range => control.encode(control.value_for(range).unwrap_or_default()),
        };
        Ok(ControlResponse::data(&reply, w_length))
    }

    fn read_current(&mut self, control: &ControlDesc) -> Bytes {
        let value = match control.binding {
            Binding::Brightness => {
                let read = self.sensor.brightness();
                fallback(read, &mut self.last_known.brightness, "brightness")
            }
            Binding::Gain => {
                let read = self.sensor.gain();
                fallback(read, &mut self.last_known.gain, "gain")
            }
            Binding::LedPower => self.last_known.led_level,
            Binding::VendorCommand => self.last_known.vendor_command,
            Binding::LegacyCommand => self.sensor.trigger_inputs().unwrap_or_else(|e| {
                warn!(%e, "trigger input read failed");
                0
            }),
            Binding::Zoom => return control.encode(self.ptz.zoom),
            Binding::PanTilt => return encode_pan_tilt(self.ptz.pan, self.ptz.tilt),
        };
        Bytes::copy_from_slice(&[value])
    }

    fn write_current(
        &mut self,
        control: &ControlDesc,
        selector: u16,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        match control.binding {
            Binding::Brightness => {
                let value = data[0];
                if logged(self.sensor.set_brightness(value), "brightness") {
                    self.last_known.brightness = value;
                }
            }
            Binding::Gain => {
                let value = data[0];
                if logged(self.sensor.set_gain(value), "gain") {
                    self.last_known.gain = value;
                }
            }
            Binding::LedPower => {
                let level = data[0];
                if logged(self.sensor.set_led_power(level), "led power") {
                    self.last_known.led_level = level;
                }
            }
            Binding::VendorCommand | Binding::LegacyCommand => {
                let command = VendorCommand::from_id(data[0])?;
                metrics::counter!("uvc.vendor_commands").increment(1);
                if logged(self.sensor.apply_command(command), "vendor command") {
                    self.last_known.vendor_command = data[0];
                }
            }
            Binding::Zoom => {
                let zoom = u16::from_le_bytes([data[0], data[1]]) as i64;
                if !control.in_range(zoom) {
                    return Err(ProtocolError::OutOfRange {
                        selector,
                        value: zoom,
                    });
                }
                self.ptz.zoom = zoom;
            }
            Binding::PanTilt => {
                let (pan, tilt) = decode_pan_tilt(data).ok_or(ProtocolError::ShortData {
                    expected: control.len,
                    got: data.len(),
                })?;
                for value in [pan, tilt] {
                    if !control.in_range(value.into()) {
                        return Err(ProtocolError::OutOfRange {
                            selector,
                            value: value.into(),
                        });
                    }
                }
                self.ptz.pan = pan;
                self.ptz.tilt = tilt;
            }
        }
        Ok(())
    }

    /// Answers one request on the control endpoint.
    pub fn respond(&mut self, req: &ControlRequest) {
        match self.handle(req) {
            Ok(ControlResponse::Data(bytes)) => {
                if let Err(e) = self.host.send_control_data(&bytes) {
                    warn!(%e, "control data stage failed");
                    self.host.stall();
                }
            }
            Ok(ControlResponse::Ack) => self.host.ack_control_request(),
            Err(e) => {
                debug!(%e, "stalling control request");
                metrics::counter!("uvc.control_stalls").increment(1);
                self.host.stall();
            }
        }
    }

    /// Control task body. Runs until the task is aborted.
    pub async fn run(mut self, requests: Receiver<ControlRequest>) {
        info!("control task started");
        loop {
            self.coord
                .events
                .wait_take_any(Events::CONTROL_REQUEST | Events::STREAM_REQUEST)
                .await;
            while let Ok(req) = requests.try_recv() {
                self.respond(&req);
            }
            tokio::task::yield_now().await;
        }
    }
}

fn fallback(read: Result<u8, SensorIoError>, last: &mut u8, what: &str) -> u8 {
    match read {
        Ok(value) => {
            *last = value;
            value
        }
        Err(e) => {
            warn!(%e, what, "sensor read failed, answering last known value");
            *last
        }
    }
}

fn logged(result: Result<(), SensorIoError>, what: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(%e, what, "sensor write failed, keeping previous configuration");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::registry::selector;
    use crate::host::{Ep0Reply, LoopbackHost};
    use crate::sensor::SimulatedSensor;

    struct Rig {
        coord: Arc<Coordinator>,
        host: Arc<LoopbackHost>,
        sensor: Arc<SimulatedSensor>,
        dispatcher: ControlDispatcher,
    }

    fn rig(speed: UsbSpeed) -> Rig {
        let coord = Arc::new(Coordinator::new());
        let host = Arc::new(LoopbackHost::new(4, speed));
        let sensor = Arc::new(SimulatedSensor::new());
        let dispatcher = ControlDispatcher::new(
            coord.clone(),
            host.clone(),
            sensor.clone(),
            &ControlConfig::default(),
            UsbSpeed::Super,
        );
        Rig {
            coord,
            host,
            sensor,
            dispatcher,
        }
    }

    fn pu_get(selector: u16, code: RequestCode) -> ControlRequest {
        ControlRequest::get(CONTROL_INTERFACE, UnitId::ProcessingUnit as u8, selector, code, 2)
    }

    fn pu_set(selector: u16, value: u8) -> ControlRequest {
        ControlRequest::set_cur(
            CONTROL_INTERFACE,
            UnitId::ProcessingUnit as u8,
            selector,
            vec![value],
        )
    }

    #[test]
    fn first_request_picks_speed_preset() {
        let mut rig = rig(UsbSpeed::High);
        let req = ControlRequest::get(STREAM_INTERFACE, 0, PROBE_CONTROL, RequestCode::GetDef, 26);
        let reply = rig.dispatcher.handle(&req).unwrap();
        assert_eq!(
            reply,
            ControlResponse::Data(Bytes::copy_from_slice(&ProbeCommit::HIGH_SPEED.to_bytes()))
        );
        assert!(rig.coord.link.is_connected());
    }

    #[test]
    fn brightness_write_reaches_sensor() {
        let mut rig = rig(UsbSpeed::Super);
        rig.dispatcher
            .handle(&pu_set(selector::PU_BRIGHTNESS, 0x40))
            .unwrap();
        assert_eq!(rig.sensor.brightness().unwrap(), 0x40);

        let reply = rig
            .dispatcher
            .handle(&pu_get(selector::PU_BRIGHTNESS, RequestCode::GetCur))
            .unwrap();
        assert_eq!(reply, ControlResponse::Data(Bytes::from_static(&[0x40])));
    }

    #[test]
    fn sensor_failure_answers_last_known() {
        let mut rig = rig(UsbSpeed::Super);
        rig.dispatcher.handle(&pu_set(selector::PU_GAIN, 12)).unwrap();

        rig.sensor.fail_next_io(2);
        // Write fails but the request still completes
        assert_eq!(
            rig.dispatcher.handle(&pu_set(selector::PU_GAIN, 30)),
            Ok(ControlResponse::Ack)
        );
        let reply = rig
            .dispatcher
            .handle(&pu_get(selector::PU_GAIN, RequestCode::GetCur))
            .unwrap();
        assert_eq!(reply, ControlResponse::Data(Bytes::from_static(&[12])));
    }

    #[test]
    fn get_len_is_two_bytes() {
        let mut rig = rig(UsbSpeed::Super);
        let reply = rig
            .dispatcher
            .handle(&pu_get(selector::PU_HUE, RequestCode::GetLen))
            .unwrap();
        assert_eq!(reply, ControlResponse::Data(Bytes::from_static(&[1, 0])));
    }

    #[test]
    fn legacy_alias_dispatches_vendor_commands() {
        let mut rig = rig(UsbSpeed::Super);
        let id = VendorCommand::RecordStart.id();
        rig.dispatcher
            .handle(&pu_set(selector::PU_SATURATION, id))
            .unwrap();
        assert!(rig.sensor.state().recording());

        rig.sensor.set_trigger_inputs(0b10);
        let reply = rig
            .dispatcher
            .handle(&pu_get(selector::PU_SATURATION, RequestCode::GetCur))
            .unwrap();
        assert_eq!(reply, ControlResponse::Data(Bytes::from_static(&[0b10])));
    }

    #[test]
    fn respond_stalls_on_error() {
        let mut rig = rig(UsbSpeed::Super);
        let bogus = ControlRequest::get(CONTROL_INTERFACE, 9, 0x0100, RequestCode::GetCur, 1);
        rig.dispatcher.respond(&bogus);
        rig.dispatcher.respond(&pu_set(selector::PU_HUE, 80));
        assert_eq!(rig.host.take_ep0_replies(), vec![Ep0Reply::Stall, Ep0Reply::Ack]);
        assert_eq!(rig.sensor.state().led_level(), 80);
    }
}
