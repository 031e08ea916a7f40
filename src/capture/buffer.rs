use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// Capture source channel. The transport alternates between the two while filling a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Ch0,
    Ch1,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Ch0, Channel::Ch1];

    pub fn index(self) -> usize {
        match self {
            Channel::Ch0 => 0,
            Channel::Ch1 => 1,
        }
    }

    pub fn other(self) -> Channel {
        match self {
            Channel::Ch0 => Channel::Ch1,
            Channel::Ch1 => Channel::Ch0,
        }
    }
}

/// Size of every capture buffer and the room reserved around its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub buffer_size: usize,
    pub header_len: usize,
    pub footer_len: usize,
    pub buffers_per_channel: usize,
}

impl BufferGeometry {
    /// Bytes of video data that make a buffer "full".
    pub fn payload_capacity(&self) -> usize {
        self.buffer_size - self.header_len - self.footer_len
    }

    /// Buffers across both channels.
    pub fn buffer_count(&self) -> usize {
        self.buffers_per_channel * Channel::ALL.len()
    }
}

/// One capture buffer.
///
/// Layout of `data`: `[header room][payload capacity][footer room]`. The transport writes video
/// bytes into the payload region; the commit engine writes the protocol header into the header
/// room right before commit.
#[derive(Debug)]
pub struct BufferDescriptor {
    channel: Channel,
    data: BytesMut,
    header_len: usize,
    capacity: usize,
    filled: usize,
    eof: bool,
}

impl BufferDescriptor {
    pub fn new(channel: Channel, geometry: &BufferGeometry) -> Self {
        Self {
            channel,
            data: BytesMut::zeroed(geometry.buffer_size),
            header_len: geometry.header_len,
            capacity: geometry.payload_capacity(),
            filled: 0,
            eof: false,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.capacity
    }

    /// Set by the transport when a frame ends exactly on a buffer boundary.
    pub fn eof_flagged(&self) -> bool {
        self.eof
    }

    pub fn flag_eof(&mut self) {
        self.eof = true;
    }

    /// Mid-frame buffers are full and not flagged; anything else ends the frame.
    pub fn is_frame_terminal(&self) -> bool {
        !self.is_full() || self.eof
    }

    /// Appends video bytes, returning how many fit.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.capacity - self.filled);
        let start = self.header_len + self.filled;
        self.data[start..start + n].copy_from_slice(&bytes[..n]);
        self.filled += n;
        n
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len..self.header_len + self.filled]
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.header_len]
    }

    /// Header followed by the filled payload: what goes out on the wire.
    pub fn packet(&self) -> &[u8] {
        &self.data[..self.header_len + self.filled]
    }

    /// Forgets the contents so the slot can be refilled.
    pub fn recycle(&mut self) {
        self.filled = 0;
        self.eof = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> BufferGeometry {
        BufferGeometry {
            buffer_size: 64,
            header_len: 12,
            footer_len: 4,
            buffers_per_channel: 2,
        }
    }

    #[test]
    fn fill_stops_at_capacity() {
        let mut buf = BufferDescriptor::new(Channel::Ch1, &geometry());
        assert_eq!(buf.capacity(), 48);

        assert_eq!(buf.fill(&[7u8; 40]), 40);
        assert!(!buf.is_full());
        assert!(buf.is_frame_terminal());

        assert_eq!(buf.fill(&[9u8; 40]), 8);
        assert!(buf.is_full());
        assert!(!buf.is_frame_terminal());
        assert_eq!(buf.packet().len(), 12 + 48);
        assert_eq!(buf.payload()[39], 7);
        assert_eq!(buf.payload()[40], 9);
    }

    #[test]
    fn eof_flag_makes_full_buffer_terminal() {
        let mut buf = BufferDescriptor::new(Channel::Ch0, &geometry());
        buf.fill(&[0u8; 48]);
        buf.flag_eof();
        assert!(buf.is_frame_terminal());

        buf.recycle();
        assert_eq!(buf.filled(), 0);
        assert!(!buf.eof_flagged());
    }
}
