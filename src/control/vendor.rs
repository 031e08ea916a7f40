//! Vendor command space used by the acquisition software.
//!
//! Commands carry no parameters: the id alone selects what happens, so every command is a plain
//! value and applying one twice leaves the device as applying it once.

use crate::error::ProtocolError;

/// Frame-rate presets. Each maps to a fixed VMAX (lines per frame) register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameRate {
    Fps1,
    Fps2,
    Fps3,
    Fps4,
    Fps8,
    Fps30,
    Fps60,
    Fps100,
    Fps153,
    Fps200,
    Fps250,
    Fps293,
    Fps400,
    Fps500,
    Fps700,
}

impl FrameRate {
    pub fn fps(self) -> u16 {
        match self {
            FrameRate::Fps1 => 1,
            FrameRate::Fps2 => 2,
            FrameRate::Fps3 => 3,
            FrameRate::Fps4 => 4,
            FrameRate::Fps8 => 8,
            FrameRate::Fps30 => 30,
            FrameRate::Fps60 => 60,
            FrameRate::Fps100 => 100,
            FrameRate::Fps153 => 153,
            FrameRate::Fps200 => 200,
            FrameRate::Fps250 => 250,
            FrameRate::Fps293 => 293,
            FrameRate::Fps400 => 400,
            FrameRate::Fps500 => 500,
            FrameRate::Fps700 => 700,
        }
    }

    pub fn vmax(self) -> u32 {
        match self {
            FrameRate::Fps1 => 0x8000,
            FrameRate::Fps2 => 0x6000,
            FrameRate::Fps3 => 0x4000,
            FrameRate::Fps4 => 0x2000,
            FrameRate::Fps8 => 0x0FEE,
            FrameRate::Fps30 => 0x0466,
            FrameRate::Fps60 => 0x0233,
            FrameRate::Fps100 => 0x0177,
            FrameRate::Fps153 => 0x00DC,
            FrameRate::Fps200 => 0x00A8,
            FrameRate::Fps250 => 0x0087,
            FrameRate::Fps293 => 0x0073,
            FrameRate::Fps400 => 0x0054,
            FrameRate::Fps500 => 0x0043,
            FrameRate::Fps700 => 0x0030,
        }
    }
}

/// Vertical window offset preset, in steps of 50 rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowOffset(u8);

impl WindowOffset {
    pub const STEPS: u8 = 20;

    pub fn new(step: u8) -> Option<Self> {
        (step < Self::STEPS).then_some(Self(step))
    }

    pub fn step(self) -> u8 {
        self.0
    }

    /// First active row: 0, 51, 101, ... 951
    pub fn rows(self) -> u16 {
        match self.0 {
            0 => 0,
            n => n as u16 * 50 + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorCommand {
    RecordStart,
    RecordEnd,
    /// Rewrite the full sensor register set
    SensorDefaults,
    /// Sent by the host software before the first frame-rate preset; no effect.
    InitFrameRate,
    FrameRate(FrameRate),
    /// Sent by the host software before the first window preset; no effect.
    InitWindow,
    WindowOffset(WindowOffset),
    HighGainConversion(bool),
}

const FIRST_WINDOW_ID: u8 = 0x0E;

/// Id table. Window presets occupy the contiguous ids
/// `FIRST_WINDOW_ID..FIRST_WINDOW_ID + WindowOffset::STEPS` and are resolved arithmetically.
const TABLE: &[(u8, VendorCommand)] = &[
    (0x01, VendorCommand::RecordStart),
    (0x02, VendorCommand::RecordEnd),
    (0x03, VendorCommand::SensorDefaults),
    (0x04, VendorCommand::InitFrameRate),
    (0x05, VendorCommand::FrameRate(FrameRate::Fps8)),
    (0x06, VendorCommand::FrameRate(FrameRate::Fps30)),
    (0x07, VendorCommand::FrameRate(FrameRate::Fps60)),
    (0x08, VendorCommand::FrameRate(FrameRate::Fps100)),
    (0x09, VendorCommand::FrameRate(FrameRate::Fps153)),
    (0x0A, VendorCommand::FrameRate(FrameRate::Fps200)),
    (0x0B, VendorCommand::FrameRate(FrameRate::Fps250)),
    (0x0C, VendorCommand::FrameRate(FrameRate::Fps293)),
    (0x0D, VendorCommand::InitWindow),
    (0x22, VendorCommand::HighGainConversion(true)),
    (0x23, VendorCommand::HighGainConversion(false)),
    (0x24, VendorCommand::FrameRate(FrameRate::Fps500)),
    (0x25, VendorCommand::FrameRate(FrameRate::Fps700)),
    (0x26, VendorCommand::FrameRate(FrameRate::Fps400)),
    (0x27, VendorCommand::FrameRate(FrameRate::Fps1)),
    (0x28, VendorCommand::FrameRate(FrameRate::Fps2)),
    (0x29, VendorCommand::FrameRate(FrameRate::Fps3)),
    (0x2A, VendorCommand::FrameRate(FrameRate::Fps4)),
];

impl VendorCommand {
    pub fn from_id(id: u8) -> Result<Self, ProtocolError> {
        if let Some(step) = id.checked_sub(FIRST_WINDOW_ID) {
            if let Some(offset) = WindowOffset::new(step) {
                return Ok(VendorCommand::WindowOffset(offset));
            }
        }
        TABLE
            .iter()
            .find(|(raw, _)| *raw == id)
            .map(|(_, cmd)| *cmd)
            .ok_or(ProtocolError::UnknownVendorCommand(id))
    }

    pub fn id(self) -> u8 {
        if let VendorCommand::WindowOffset(offset) = self {
            return FIRST_WINDOW_ID + offset.step();
        }
        TABLE
            .iter()
            .find(|(_, cmd)| *cmd == self)
            .map(|(raw, _)| *raw)
            .unwrap_or_default()
    }

    /// Every defined command, in id order
    pub fn all() -> impl Iterator<Item = VendorCommand> {
        (0..=u8::MAX).filter_map(|id| VendorCommand::from_id(id).ok())
    }
}

impl TryFrom<u8> for VendorCommand {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        VendorCommand::from_id(id)
    }
}
