//! Host-facing side of the device: the video bulk endpoint and the control endpoint

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbSpeed {
    NotConnected,
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    pub fn is_connected(self) -> bool {
        self != UsbSpeed::NotConnected
    }

    /// Super speed and up
    pub fn is_super_speed(self) -> bool {
        self == UsbSpeed::Super
    }
}

/// Host link seen from the core.
///
/// Shared between the lifecycle task (video endpoint), the control task (control endpoint) and
/// bus callbacks (explicit stop), so every method takes `&self`.
pub trait HostTransport: Send + Sync {
    /// Hand one packet (header + payload) to the video endpoint. The packet bytes are copied or
    /// queued before this returns; the caller may recycle its buffer afterwards.
    fn commit(&self, packet: &[u8]) -> Result<(), TransportError>;

    /// Discard everything queued on the video endpoint.
    fn flush(&self);

    /// NAK the video endpoint while the data path is being reset.
    fn set_nak(&self, nak: bool);

    /// Clear a stall on the video endpoint and reset its sequence number.
    fn clear_stall(&self);

    /// Protocol stall on the control endpoint for the current request.
    fn stall(&self);

    /// Status-stage acknowledge with no data.
    fn ack_control_request(&self);

    /// Data stage of a GET request.
    fn send_control_data(&self, data: &[u8]) -> Result<(), TransportError>;

    fn speed(&self) -> UsbSpeed;
}
