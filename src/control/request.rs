//! Setup packet decoding and control response shaping

use bytes::Bytes;

use crate::error::ProtocolError;

/// `bmRequestType` of class requests to an interface
pub const CLASS_SET: u8 = 0x21;
pub const CLASS_GET: u8 = 0xA1;
/// `bmRequestType` of standard requests
pub const STANDARD_INTERFACE_OUT: u8 = 0x01;
pub const STANDARD_ENDPOINT_OUT: u8 = 0x02;

/// Standard `bRequest` codes
pub const CLEAR_FEATURE: u8 = 0x01;
pub const SET_INTERFACE: u8 = 0x0B;

pub const CONTROL_INTERFACE: u8 = 0;
pub const STREAM_INTERFACE: u8 = 1;

/// Video bulk IN endpoint address
pub const VIDEO_ENDPOINT: u16 = 0x83;

/// Class request codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestCode {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl TryFrom<u8> for RequestCode {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Ok(match raw {
            0x01 => RequestCode::SetCur,
            0x81 => RequestCode::GetCur,
            0x82 => RequestCode::GetMin,
            0x83 => RequestCode::GetMax,
            0x84 => RequestCode::GetRes,
            0x85 => RequestCode::GetLen,
            0x86 => RequestCode::GetInfo,
            0x87 => RequestCode::GetDef,
            other => return Err(ProtocolError::UnknownRequest(other)),
        })
    }
}

impl RequestCode {
    pub fn is_get(self) -> bool {
        self != RequestCode::SetCur
    }
}

/// Eight-byte setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Decodes the two little-endian words the bus controller hands to the setup callback.
    pub fn from_words(word0: u32, word1: u32) -> Self {
        Self {
            request_type: (word0 & 0xFF) as u8,
            request: ((word0 >> 8) & 0xFF) as u8,
            value: (word0 >> 16) as u16,
            index: (word1 & 0xFFFF) as u16,
            length: (word1 >> 16) as u16,
        }
    }

    pub fn to_words(&self) -> (u32, u32) {
        let word0 = self.request_type as u32
            | (self.request as u32) << 8
            | (self.value as u32) << 16;
        let word1 = self.index as u32 | (self.length as u32) << 16;
        (word0, word1)
    }

    /// Class request from the host to the given interface/entity
    pub fn class(code: RequestCode, interface: u8, entity: u8, selector: u16, length: u16) -> Self {
        Self {
            request_type: if code.is_get() { CLASS_GET } else { CLASS_SET },
            request: code as u8,
            value: selector,
            index: (entity as u16) << 8 | interface as u16,
            length,
        }
    }

    pub fn is_class_request(&self) -> bool {
        matches!(self.request_type, CLASS_SET | CLASS_GET)
    }

    pub fn interface(&self) -> u8 {
        (self.index & 0xFF) as u8
    }

    /// Unit or terminal id (high byte of `wIndex`)
    pub fn entity(&self) -> u8 {
        (self.index >> 8) as u8
    }

    /// Control selector (high byte of `wValue`, kept in place)
    pub fn selector(&self) -> u16 {
        self.value
    }
}

/// Class request as queued for the control task, with its OUT data stage if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub setup: SetupPacket,
    pub data: Bytes,
}

impl ControlRequest {
    pub fn new(setup: SetupPacket, data: Bytes) -> Self {
        Self { setup, data }
    }

    pub fn get(interface: u8, entity: u8, selector: u16, code: RequestCode, length: u16) -> Self {
        Self::new(
            SetupPacket::class(code, interface, entity, selector, length),
            Bytes::new(),
        )
    }

    pub fn set_cur(interface: u8, entity: u8, selector: u16, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let setup = SetupPacket::class(
            RequestCode::SetCur,
            interface,
            entity,
            selector,
            data.len() as u16,
        );
        Self::new(setup, data)
    }

    pub fn code(&self) -> Result<RequestCode, ProtocolError> {
        RequestCode::try_from(self.setup.request)
    }

    /// OUT data of at least `len` bytes
    pub fn data_at_least(&self, len: usize) -> Result<&[u8], ProtocolError> {
        if self.data.len() < len {
            return Err(ProtocolError::ShortData {
                expected: len,
                got: self.data.len(),
            });
        }
        Ok(&self.data[..])
    }
}

/// Successful outcome of a control request. Failures are stalls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Data(Bytes),
    Ack,
}

impl ControlResponse {
    /// IN data stage, never longer than the host asked for.
    pub fn data(bytes: &[u8], w_length: u16) -> Self {
        let n = bytes.len().min(w_length as usize);
        ControlResponse::Data(Bytes::copy_from_slice(&bytes[..n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_words_decode() {
        // GET_CUR, probe control, streaming interface, 26 bytes
        let setup = SetupPacket::from_words(0x0100_81A1, 0x001A_0001);
        assert_eq!(setup.request_type, CLASS_GET);
        assert_eq!(setup.request, RequestCode::GetCur as u8);
        assert_eq!(setup.selector(), 0x0100);
        assert_eq!(setup.interface(), STREAM_INTERFACE);
        assert_eq!(setup.entity(), 0);
        assert_eq!(setup.length, 26);
        assert_eq!(setup.to_words(), (0x0100_81A1, 0x001A_0001));
    }

    #[test]
    fn class_builder_addresses_entity() {
        let setup = SetupPacket::class(RequestCode::SetCur, 0, 2, 0x0200, 1);
        assert_eq!(setup.request_type, CLASS_SET);
        assert_eq!(setup.index, 0x0200);
        assert_eq!(setup.entity(), 2);
        assert!(setup.is_class_request());
    }

    #[test]
    fn unknown_request_code() {
        assert_eq!(
            RequestCode::try_from(0x42),
            Err(ProtocolError::UnknownRequest(0x42))
        );
    }

    #[test]
    fn response_truncated_to_w_length() {
        assert_eq!(
            ControlResponse::data(&[1, 2, 3, 4], 2),
            ControlResponse::Data(Bytes::from_static(&[1, 2]))
        );
    }
}
