//! Which controls each unit exposes and which requests each control accepts

use std::collections::HashMap;

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::ProtocolError;
use crate::ControlConfig;

use super::request::RequestCode;

/// Entity ids on the video control interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnitId {
    Interface = 0,
    CameraTerminal = 1,
    ProcessingUnit = 2,
    ExtensionUnit = 3,
}

impl TryFrom<u8> for UnitId {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(UnitId::Interface),
            1 => Ok(UnitId::CameraTerminal),
            2 => Ok(UnitId::ProcessingUnit),
            3 => Ok(UnitId::ExtensionUnit),
            other => Err(other),
        }
    }
}

/// Control selectors, high byte of `wValue`
pub mod selector {
    pub const CT_ZOOM_ABSOLUTE: u16 = 0x0B00;
    pub const CT_PANTILT_ABSOLUTE: u16 = 0x0D00;
    pub const PU_BRIGHTNESS: u16 = 0x0200;
    pub const PU_GAIN: u16 = 0x0400;
    pub const PU_HUE: u16 = 0x0600;
    pub const PU_SATURATION: u16 = 0x0700;
    pub const XU_VENDOR_COMMAND: u16 = 0x0100;
}

bitflags! {
    /// Requests a control answers
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const INFO = 1 << 0;
        const LEN = 1 << 1;
        const GET_CUR = 1 << 2;
        const SET_CUR = 1 << 3;
        const MIN = 1 << 4;
        const MAX = 1 << 5;
        const RES = 1 << 6;
        const DEF = 1 << 7;
    }
}

impl Capabilities {
    pub const RANGE: Capabilities = Capabilities::MIN
        .union(Capabilities::MAX)
        .union(Capabilities::RES)
        .union(Capabilities::DEF);

    pub fn for_request(code: RequestCode) -> Capabilities {
        match code {
            RequestCode::SetCur => Capabilities::SET_CUR,
            RequestCode::GetCur => Capabilities::GET_CUR,
            RequestCode::GetMin => Capabilities::MIN,
            RequestCode::GetMax => Capabilities::MAX,
            RequestCode::GetRes => Capabilities::RES,
            RequestCode::GetLen => Capabilities::LEN,
            RequestCode::GetInfo => Capabilities::INFO,
            RequestCode::GetDef => Capabilities::DEF,
        }
    }

    /// GET_INFO bitmap: bit 0 GET supported, bit 1 SET supported
    pub fn info_byte(self) -> u8 {
        let mut info = 0;
        if self.contains(Capabilities::GET_CUR) {
            info |= 0x01;
        }
        if self.contains(Capabilities::SET_CUR) {
            info |= 0x02;
        }
        info
    }
}

/// What a control is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Brightness,
    Gain,
    LedPower,
    /// SET dispatches a vendor command, GET reads back the last one applied
    VendorCommand,
    /// SET dispatches a vendor command, GET reads the trigger inputs
    LegacyCommand,
    Zoom,
    PanTilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDesc {
    pub binding: Binding,
    pub caps: Capabilities,
    /// Value length on the wire
    pub len: usize,
    pub min: i64,
    pub max: i64,
    pub res: i64,
    pub def: i64,
}

impl ControlDesc {
    fn byte(binding: Binding, caps: Capabilities, min: u8, max: u8, def: u8) -> Self {
        Self {
            binding,
            caps,
            len: 1,
            min: min.into(),
            max: max.into(),
            res: 1,
            def: def.into(),
        }
    }

    pub fn info(&self) -> u8 {
        self.caps.info_byte()
    }

    pub fn value_for(&self, code: RequestCode) -> Option<i64> {
        match code {
            RequestCode::GetMin => Some(self.min),
            RequestCode::GetMax => Some(self.max),
            RequestCode::GetRes => Some(self.res),
            RequestCode::GetDef => Some(self.def),
            _ => None,
        }
    }

    /// Little-endian wire form of a value
    pub fn encode(&self, value: i64) -> Bytes {
        match self.binding {
            Binding::PanTilt => encode_pan_tilt(value as i32, value as i32),
            _ => Bytes::copy_from_slice(&value.to_le_bytes()[..self.len]),
        }
    }

    pub fn in_range(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Pan and tilt share one 8-byte value: pan first, then tilt.
pub fn encode_pan_tilt(pan: i32, tilt: i32) -> Bytes {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&pan.to_le_bytes());
    out.extend_from_slice(&tilt.to_le_bytes());
    Bytes::from(out)
}

pub fn decode_pan_tilt(data: &[u8]) -> Option<(i32, i32)> {
    let pan = i32::from_le_bytes(data.get(0..4)?.try_into().ok()?);
    let tilt = i32::from_le_bytes(data.get(4..8)?.try_into().ok()?);
    Some((pan, tilt))
}

/// Arc-seconds, +-180 degrees in whole degree steps
pub const PAN_TILT_LIMIT: i64 = 180 * 3600;
pub const ZOOM_MIN: i64 = 100;
pub const ZOOM_MAX: i64 = 500;

#[derive(Debug, Clone)]
pub struct ControlRegistry {
    controls: HashMap<(UnitId, u16), ControlDesc>,
}

impl ControlRegistry {
    pub fn new(config: &ControlConfig) -> Self {
        use selector::*;

        let read_write = Capabilities::all();
        let mut controls = HashMap::new();

        controls.insert(
            (UnitId::ProcessingUnit, PU_BRIGHTNESS),
            ControlDesc::byte(Binding::Brightness, read_write, 0, 255, 255),
        );
        controls.insert(
            (UnitId::ProcessingUnit, PU_GAIN),
            ControlDesc::byte(Binding::Gain, read_write, 1, 240, 1),
        );
        controls.insert(
            (UnitId::ProcessingUnit, PU_HUE),
            ControlDesc::byte(Binding::LedPower, read_write, 0, 255, 0),
        );
        if config.legacy_vendor_alias {
            controls.insert(
                (UnitId::ProcessingUnit, PU_SATURATION),
                ControlDesc::byte(Binding::LegacyCommand, read_write, 0, 255, 0),
            );
        }

        controls.insert(
            (UnitId::ExtensionUnit, XU_VENDOR_COMMAND),
            ControlDesc::byte(
                Binding::VendorCommand,
                // Command ids have no meaningful range
                read_write.difference(Capabilities::RANGE),
                0,
                255,
                0,
            ),
        );

        if config.ptz_support {
            controls.insert(
                (UnitId::CameraTerminal, CT_ZOOM_ABSOLUTE),
                ControlDesc {
                    binding: Binding::Zoom,
                    caps: read_write,
                    len: 2,
                    min: ZOOM_MIN,
                    max: ZOOM_MAX,
                    res: 1,
                    def: ZOOM_MIN,
                },
            );
            controls.insert(
                (UnitId::CameraTerminal, CT_PANTILT_ABSOLUTE),
                ControlDesc {
                    binding: Binding::PanTilt,
                    caps: read_write,
                    len: 8,
                    min: -PAN_TILT_LIMIT,
                    max: PAN_TILT_LIMIT,
                    res: 3600,
                    def: 0,
                },
            );
        }

        Self { controls }
    }

    /// Finds the control and checks it answers `code`.
    pub fn lookup(
        &self,
        unit: UnitId,
        selector: u16,
        code: RequestCode,
    ) -> Result<&ControlDesc, ProtocolError> {
        let control = self
            .controls
            .get(&(unit, selector))
            .ok_or(ProtocolError::UnsupportedControl {
                unit: unit as u8,
                selector,
            })?;

        if !control.caps.contains(Capabilities::for_request(code)) {
            return Err(ProtocolError::UnsupportedRequest {
                unit: unit as u8,
                selector,
                request: code,
            });
        }
        Ok(control)
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    pub fn controls(&self) -> impl Iterator<Item = (UnitId, u16, &ControlDesc)> {
        self.controls
            .iter()
            .map(|((unit, selector), control)| (*unit, *selector, control))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ptz: bool, alias: bool) -> ControlConfig {
        ControlConfig {
            ptz_support: ptz,
            legacy_vendor_alias: alias,
            ..ControlConfig::default()
        }
    }

    #[test]
    fn optional_controls_follow_config() {
        assert_eq!(ControlRegistry::new(&config(false, false)).len(), 4);
        assert_eq!(ControlRegistry::new(&config(false, true)).len(), 5);
        assert_eq!(ControlRegistry::new(&config(true, true)).len(), 7);
    }

    #[test]
    fn lookup_checks_capabilities() {
        let registry = ControlRegistry::new(&config(false, true));
        let brightness = registry
            .lookup(UnitId::ProcessingUnit, selector::PU_BRIGHTNESS, RequestCode::GetDef)
            .unwrap();
        assert_eq!(brightness.def, 255);
        assert_eq!(brightness.info(), 3);

        assert_eq!(
            registry.lookup(
                UnitId::ExtensionUnit,
                selector::XU_VENDOR_COMMAND,
                RequestCode::GetMax
            ),
            Err(ProtocolError::UnsupportedRequest {
                unit: 3,
                selector: selector::XU_VENDOR_COMMAND,
                request: RequestCode::GetMax,
            })
        );
        assert!(registry
            .lookup(UnitId::CameraTerminal, selector::CT_ZOOM_ABSOLUTE, RequestCode::GetCur)
            .is_err());
    }

    #[test]
    fn every_control_reports_info_and_len() {
        let registry = ControlRegistry::new(&config(true, true));
        assert_eq!(registry.controls().count(), registry.len());
        for (unit, selector, control) in registry.controls() {
            for code in [RequestCode::GetInfo, RequestCode::GetLen, RequestCode::GetCur] {
                assert!(registry.lookup(unit, selector, code).is_ok(), "{unit:?} {selector:#x}");
            }
            let ranged = control.caps.contains(Capabilities::RANGE);
            assert_eq!(ranged, control.binding != Binding::VendorCommand);
        }
    }

    #[test]
    fn pan_tilt_wire_form() {
        let bytes = encode_pan_tilt(-3600, 7200);
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_pan_tilt(&bytes), Some((-3600, 7200)));
        assert_eq!(decode_pan_tilt(&bytes[..5]), None);
    }
}
