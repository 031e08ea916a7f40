//! Image sensor control seen from the control dispatcher

pub mod sim;

pub use sim::{SensorState, SimulatedSensor};

use crate::control::VendorCommand;
use crate::error::SensorIoError;

/// Register map of the image sensor (16-bit addresses, 8-bit values)
pub mod reg {
    pub const STANDBY: u16 = 0x3000;
    pub const WINMODE: u16 = 0x3007;
    /// Frame-rate select; bit 4 is high gain conversion
    pub const FRSEL: u16 = 0x3009;
    /// Black level, 9 bits across two registers
    pub const BLKLEVEL_LOW: u16 = 0x300A;
    pub const BLKLEVEL_HIGH: u16 = 0x300B;
    pub const GAIN: u16 = 0x3014;
    /// Lines per frame, 18 bits across three registers
    pub const VMAX: [u16; 3] = [0x3018, 0x3019, 0x301A];
    pub const HMAX: [u16; 2] = [0x301C, 0x301D];
    pub const WINWV_OB: u16 = 0x303A;
    /// Vertical window position
    pub const WINPV: [u16; 2] = [0x303C, 0x303D];
    pub const WINWV: [u16; 2] = [0x303E, 0x303F];
    pub const WINPH: [u16; 2] = [0x3040, 0x3041];
    pub const WINWH: [u16; 2] = [0x3042, 0x3043];
    pub const INCKSEL: [u16; 4] = [0x305C, 0x305D, 0x305E, 0x305F];

    pub const FRSEL_DEFAULT: u8 = 0x02;
    pub const FRSEL_HGC: u8 = 0x10;
    /// Writes above this saturate the analog gain stage
    pub const GAIN_MAX: u8 = 0xF0;
}

/// Sensor and board peripherals the control path drives.
///
/// Every call is a synchronous register transaction. Failures are reported to the caller, which
/// logs them and keeps its last known value.
pub trait SensorControl: Send + Sync {
    fn brightness(&self) -> Result<u8, SensorIoError>;

    fn set_brightness(&self, value: u8) -> Result<(), SensorIoError>;

    fn gain(&self) -> Result<u8, SensorIoError>;

    /// Values above [`reg::GAIN_MAX`] are clamped.
    fn set_gain(&self, value: u8) -> Result<(), SensorIoError>;

    /// Excitation LED drive level (DAC)
    fn set_led_power(&self, level: u8) -> Result<(), SensorIoError>;

    /// Levels of the external trigger inputs, one bit per input
    fn trigger_inputs(&self) -> Result<u8, SensorIoError>;

    fn apply_command(&self, command: VendorCommand) -> Result<(), SensorIoError>;
}
