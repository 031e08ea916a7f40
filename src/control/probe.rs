//! Probe/commit parameter block and the negotiation state around it

use crate::error::ProtocolError;
use crate::host::UsbSpeed;

/// Streaming interface control selectors
pub const PROBE_CONTROL: u16 = 0x0100;
pub const COMMIT_CONTROL: u16 = 0x0200;

/// Wire length of the block
pub const PROBE_LEN: usize = 26;

/// Stream parameters exchanged through the probe and commit controls. All fields little endian
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCommit {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// 100 ns units
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
}

impl ProbeCommit {
    pub const SUPER_SPEED: ProbeCommit = ProbeCommit {
        hint: 0,
        format_index: 1,
        frame_index: 1,
        frame_interval: 0x001E_8480,
        key_frame_rate: 0,
        p_frame_rate: 0,
        comp_quality: 0,
        comp_window_size: 0,
        delay: 0,
        max_video_frame_size: 0x0041_FCD0,
        max_payload_transfer_size: 0x0000_4000,
    };

    pub const HIGH_SPEED: ProbeCommit = ProbeCommit {
        frame_interval: 0x0002_8B0B,
        max_video_frame_size: 0x000B_0400,
        ..ProbeCommit::SUPER_SPEED
    };

    /// Parameters offered at `speed`. Anything below super speed gets the USB 2.0 set.
    pub fn preset(speed: UsbSpeed) -> ProbeCommit {
        if speed.is_super_speed() {
            ProbeCommit::SUPER_SPEED
        } else {
            ProbeCommit::HIGH_SPEED
        }
    }

    pub fn to_bytes(&self) -> [u8; PROBE_LEN] {
        let mut out = [0u8; PROBE_LEN];
        out[0..2].copy_from_slice(&self.hint.to_le_bytes());
        out[2] = self.format_index;
        out[3] = self.frame_index;
        out[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        out[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        out[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        out[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        out[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        out[16..18].copy_from_slice(&self.delay.to_le_bytes());
        out[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<ProbeCommit, ProtocolError> {
        if b.len() < PROBE_LEN {
            return Err(ProtocolError::ShortData {
                expected: PROBE_LEN,
                got: b.len(),
            });
        }
        let u16_at = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);

        Ok(ProbeCommit {
            hint: u16_at(0),
            format_index: b[2],
            frame_index: b[3],
            frame_interval: u32_at(4),
            key_frame_rate: u16_at(8),
            p_frame_rate: u16_at(10),
            comp_quality: u16_at(12),
            comp_window_size: u16_at(14),
            delay: u16_at(16),
            max_video_frame_size: u32_at(18),
            max_payload_transfer_size: u32_at(22),
        })
    }

    /// Nominal frames per second
    pub fn frame_rate(&self) -> f64 {
        if self.frame_interval == 0 {
            return 0.0;
        }
        10_000_000.0 / self.frame_interval as f64
    }
}

/// PROPOSED and ACTIVE parameter sets.
///
/// The host may only change the frame interval; format, frame and sizes always come from the
/// preset of the connection speed.
#[derive(Debug, Clone)]
pub struct Negotiation {
    speed: UsbSpeed,
    proposed: ProbeCommit,
    active: ProbeCommit,
}

impl Negotiation {
    pub fn new(speed: UsbSpeed) -> Self {
        let preset = ProbeCommit::preset(speed);
        Self {
            speed,
            proposed: preset,
            active: preset,
        }
    }

    /// Connection speed changed: start over from that speed's preset.
    pub fn rebase(&mut self, speed: UsbSpeed) {
        if ProbeCommit::preset(speed) != ProbeCommit::preset(self.speed) {
            *self = Negotiation::new(speed);
        }
        self.speed = speed;
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn preset(&self) -> ProbeCommit {
        ProbeCommit::preset(self.speed)
    }

    pub fn proposed(&self) -> &ProbeCommit {
        &self.proposed
    }

    pub fn active(&self) -> &ProbeCommit {
        &self.active
    }

    /// Probe SET_CUR. The interval is taken as sent, zero included.
    pub fn stage(&mut self, requested: &ProbeCommit) {
        self.proposed.frame_interval = requested.frame_interval;
    }

    /// Commit SET_CUR: what was proposed becomes active.
    pub fn commit(&mut self) -> ProbeCommit {
        self.active = self.proposed;
        self.active
    }
}
