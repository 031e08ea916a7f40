//! Video payload header prefixed to every committed buffer

use bitflags::bitflags;

/// Header length in bytes. Also the room every capture buffer reserves in front of its payload.
pub const HEADER_LEN: usize = 12;

/// Room reserved after the payload.
pub const FOOTER_LEN: usize = 4;

bitflags! {
    /// Bit-field header byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const FRAME_ID = 1 << 0;
        const END_OF_FRAME = 1 << 1;
        const PRESENTATION_TIME = 1 << 2;
        const SOURCE_CLOCK = 1 << 3;
        const STILL_IMAGE = 1 << 5;
        const ERROR = 1 << 6;
        const END_OF_HEADER = 1 << 7;
    }
}

impl HeaderFlags {
    /// 0x8C
    pub const DEFAULT: HeaderFlags = HeaderFlags::END_OF_HEADER
        .union(HeaderFlags::SOURCE_CLOCK)
        .union(HeaderFlags::PRESENTATION_TIME);
}

/// Header template.
///
/// The frame id lives here and is toggled once per completed frame; the end-of-frame bit is only
/// ever applied to the copy written into a buffer.
#[derive(Debug, Clone)]
pub struct PayloadHeader {
    bytes: [u8; HEADER_LEN],
}

impl Default for PayloadHeader {
    fn default() -> Self {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = HEADER_LEN as u8;
        bytes[1] = HeaderFlags::DEFAULT.bits();
        Self { bytes }
    }
}

impl PayloadHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_retain(self.bytes[1])
    }

    pub fn frame_id(&self) -> bool {
        self.flags().contains(HeaderFlags::FRAME_ID)
    }

    pub fn toggle_frame_id(&mut self) {
        self.bytes[1] ^= HeaderFlags::FRAME_ID.bits();
    }

    /// Copies the header into `dst` (the buffer's header room), marking end of frame if asked.
    pub fn write_into(&self, dst: &mut [u8], end_of_frame: bool) {
        dst[..HEADER_LEN].copy_from_slice(&self.bytes);
        if end_of_frame {
            dst[1] |= HeaderFlags::END_OF_FRAME.bits();
        }
    }
}

/// Reads the flags back out of a packet. Used on the host side.
pub fn parse_flags(packet: &[u8]) -> Option<HeaderFlags> {
    match packet {
        [len, bits, ..] if *len as usize == HEADER_LEN && packet.len() >= HEADER_LEN => {
            Some(HeaderFlags::from_bits_retain(*bits))
        }
        _ => None,
    }
}
