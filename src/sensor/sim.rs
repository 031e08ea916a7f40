//! Register-level sensor model

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::control::{FrameRate, VendorCommand};
use crate::error::SensorIoError;

use super::{reg, SensorControl};

/// Bus address the sensor answers on
pub const SENSOR_ADDR: u8 = 0x34;

/// Full register set written on initialisation, in write order
const INIT_SEQUENCE: &[(u16, u8)] = &[
    (reg::FRSEL, reg::FRSEL_DEFAULT),
    (reg::WINMODE, 0x40),
    (reg::VMAX[0], 0xDC),
    (reg::VMAX[1], 0x05),
    (reg::VMAX[2], 0x00),
    (reg::HMAX[0], 0x30),
    (reg::HMAX[1], 0x11),
    (reg::WINWV_OB, 0x07),
    (reg::WINWV[0], 0x08),
    (reg::WINWV[1], 0x04),
    (reg::WINWH[0], 0x08),
    (reg::WINWH[1], 0x07),
    (reg::WINPH[0], 0x00),
    (reg::WINPH[1], 0x00),
    (reg::WINPV[0], 0x00),
    (reg::WINPV[1], 0x00),
    (reg::GAIN, 0x00),
    (reg::INCKSEL[0], 0x0C),
    (reg::INCKSEL[1], 0x00),
    (reg::INCKSEL[2], 0x10),
    (reg::INCKSEL[3], 0x01),
    (reg::BLKLEVEL_LOW, 0x00),
    (reg::BLKLEVEL_HIGH, 0x00),
];

/// Everything the sensor and its board remember
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorState {
    registers: BTreeMap<u16, u8>,
    led_level: u8,
    recording: bool,
}

impl SensorState {
    pub fn register(&self, addr: u16) -> u8 {
        self.registers.get(&addr).copied().unwrap_or_default()
    }

    fn write(&mut self, addr: u16, value: u8) {
        trace!(addr = format_args!("{addr:#06x}"), value = format_args!("{value:#04x}"), "sensor write");
        self.registers.insert(addr, value);
    }

    pub fn vmax(&self) -> u32 {
        reg::VMAX
            .iter()
            .enumerate()
            .fold(0, |acc, (i, addr)| acc | (self.register(*addr) as u32) << (8 * i))
    }

    /// First active row of the vertical window
    pub fn window_rows(&self) -> u16 {
        u16::from_le_bytes([self.register(reg::WINPV[0]), self.register(reg::WINPV[1])])
    }

    pub fn high_gain(&self) -> bool {
        self.register(reg::FRSEL) & reg::FRSEL_HGC != 0
    }

    pub fn led_level(&self) -> u8 {
        self.led_level
    }

    pub fn recording(&self) -> bool {
        self.recording
    }

    fn set_frame_rate(&mut self, rate: FrameRate) {
        debug!(fps = rate.fps(), vmax = rate.vmax(), "frame rate");
        let vmax = rate.vmax().to_le_bytes();
        for (addr, byte) in reg::VMAX.iter().zip(vmax) {
            self.write(*addr, byte);
        }
    }
}

/// Sensor model backed by a register file, with optional I/O failure injection
#[derive(Debug, Default)]
pub struct SimulatedSensor {
    state: Mutex<SensorState>,
    fail_io: AtomicU32,
    triggers: AtomicU8,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SensorState {
        self.lock().clone()
    }

    /// Makes the next `n` register transactions fail
    pub fn fail_next_io(&self, n: u32) {
        self.fail_io.store(n, Ordering::Release);
    }

    /// Drive the external trigger inputs
    pub fn set_trigger_inputs(&self, levels: u8) {
        self.triggers.store(levels, Ordering::Release);
    }

    fn transaction(&self) -> Result<MutexGuard<'_, SensorState>, SensorIoError> {
        let injected = self
            .fail_io
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SensorIoError::Nack { addr: SENSOR_ADDR });
        }
        Ok(self.lock())
    }
}

impl SensorControl for SimulatedSensor {
    fn brightness(&self) -> Result<u8, SensorIoError> {
        let state = self.transaction()?;
        let low = state.register(reg::BLKLEVEL_LOW);
        let high = state.register(reg::BLKLEVEL_HIGH) & 0x01;
        Ok(high << 7 | low >> 1)
    }

    fn set_brightness(&self, value: u8) -> Result<(), SensorIoError> {
        let mut state = self.transaction()?;
        let low = if value == 0xFF { 0xFF } else { value << 1 };
        state.write(reg::BLKLEVEL_LOW, low);
        state.write(reg::BLKLEVEL_HIGH, value >> 7);
        Ok(())
    }

    fn gain(&self) -> Result<u8, SensorIoError> {
        Ok(self.transaction()?.register(reg::GAIN))
    }

    fn set_gain(&self, value: u8) -> Result<(), SensorIoError> {
        self.transaction()?.write(reg::GAIN, value.min(reg::GAIN_MAX));
        Ok(())
    }

    fn set_led_power(&self, level: u8) -> Result<(), SensorIoError> {
        self.transaction()?.led_level = level;
        Ok(())
    }

    fn trigger_inputs(&self) -> Result<u8, SensorIoError> {
        Ok(self.triggers.load(Ordering::Acquire))
    }

    fn apply_command(&self, command: VendorCommand) -> Result<(), SensorIoError> {
        debug!(?command, "vendor command");
        match command {
            VendorCommand::RecordStart => self.lock().recording = true,
            VendorCommand::RecordEnd => self.lock().recording = false,
            VendorCommand::InitFrameRate | VendorCommand::InitWindow => {}
            VendorCommand::SensorDefaults => {
                let mut state = self.transaction()?;
                for (addr, value) in INIT_SEQUENCE {
                    state.write(*addr, *value);
                }
            }
            VendorCommand::FrameRate(rate) => self.transaction()?.set_frame_rate(rate),
            VendorCommand::WindowOffset(offset) => {
                let mut state = self.transaction()?;
                let [low, high] = offset.rows().to_le_bytes();
                state.write(reg::WINPV[0], low);
                state.write(reg::WINPV[1], high);
            }
            VendorCommand::HighGainConversion(on) => {
                let frsel = if on {
                    reg::FRSEL_DEFAULT | reg::FRSEL_HGC
                } else {
                    reg::FRSEL_DEFAULT
                };
                self.transaction()?.write(reg::FRSEL, frsel);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::WindowOffset;

    #[test]
    fn brightness_round_trips_through_black_level() {
        let sensor = SimulatedSensor::new();
        for value in [0x00, 0x01, 0x7F, 0x80, 0xC3, 0xFF] {
            sensor.set_brightness(value).unwrap();
            assert_eq!(sensor.brightness().unwrap(), value);
        }
        assert_eq!(sensor.state().register(reg::BLKLEVEL_LOW), 0xFF);
        assert_eq!(sensor.state().register(reg::BLKLEVEL_HIGH), 0x01);
    }

    #[test]
    fn gain_is_clamped() {
        let sensor = SimulatedSensor::new();
        sensor.set_gain(0xFE).unwrap();
        assert_eq!(sensor.gain().unwrap(), reg::GAIN_MAX);
    }

    #[test]
    fn presets_write_registers() {
        let sensor = SimulatedSensor::new();
        sensor.apply_command(VendorCommand::SensorDefaults).unwrap();
        assert_eq!(sensor.state().vmax(), 0x05DC);

        sensor
            .apply_command(VendorCommand::FrameRate(FrameRate::Fps60))
            .unwrap();
        assert_eq!(sensor.state().vmax(), 0x0233);

        let offset = WindowOffset::new(7).unwrap();
        sensor
            .apply_command(VendorCommand::WindowOffset(offset))
            .unwrap();
        assert_eq!(sensor.state().window_rows(), 351);
        assert_eq!(sensor.state().register(reg::WINPV[1]), 0x01);

        sensor
            .apply_command(VendorCommand::HighGainConversion(true))
            .unwrap();
        assert!(sensor.state().high_gain());
        assert_eq!(sensor.state().register(reg::FRSEL), 0x12);
    }

    #[test]
    fn commands_are_idempotent() {
        let sensor = SimulatedSensor::new();
        for cmd in VendorCommand::all() {
            sensor.apply_command(cmd).unwrap();
            let once = sensor.state();
            sensor.apply_command(cmd).unwrap();
            assert_eq!(sensor.state(), once, "{cmd:?}");
        }
    }

    #[test]
    fn injected_failure_leaves_state_untouched() {
        let sensor = SimulatedSensor::new();
        sensor.set_gain(10).unwrap();
        sensor.fail_next_io(1);
        assert_eq!(
            sensor.set_gain(20),
            Err(SensorIoError::Nack { addr: SENSOR_ADDR })
        );
        assert_eq!(sensor.gain().unwrap(), 10);
    }
}
