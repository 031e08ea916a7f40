//! Contract between the core and the capture hardware

use crate::error::TransportError;

use super::buffer::{BufferDescriptor, Channel};

/// Capture state in which a frame ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Last buffer was already full and emitted; nothing left to flush.
    FullBuffer(Channel),
    /// Trailing bytes of the frame sit in a partially filled buffer on this channel.
    PartialBuffer(Channel),
    /// Any other capture state id. Not a valid place for a frame to end.
    Other(u8),
}

/// Notification pushed from capture callback context to the lifecycle task
#[derive(Debug)]
pub enum CaptureEvent {
    /// A filled buffer is handed over to the commit engine.
    SlotReady(BufferDescriptor),
    /// The sensor's frame-valid signal dropped.
    EndOfFrame(TerminalState),
}

/// Capture hardware seen from the core.
///
/// Methods take `&self`: implementations are hardware handles that synchronise internally, and
/// the explicit-stop path may drive them from callback context. Filled buffers are delivered
/// through the `CaptureEvent` queue handed to the lifecycle task, not through this trait.
pub trait CaptureTransport: Send + Sync {
    /// Queue the transfer so the first channel starts filling.
    fn arm(&self) -> Result<(), TransportError>;

    /// Whether the capture state machine is loaded and only needs a restart.
    fn is_loaded(&self) -> bool;

    /// Full configuration load of the capture state machine.
    fn load_state_machine(&self) -> Result<(), TransportError>;

    /// Jump back to the entry state of an already loaded state machine.
    fn restart_state_machine(&self) -> Result<(), TransportError>;

    /// Stop the state machine; the next start needs a full load.
    fn disable(&self);

    /// Emit the partially filled buffer on `channel` as-is.
    fn force_flush(&self, channel: Channel) -> Result<BufferDescriptor, TransportError>;

    /// Drop everything in progress and return to the first channel.
    fn reset(&self) -> Result<(), TransportError>;

    /// Ownership of a committed or discarded buffer goes back to the free pool.
    fn release(&self, buffer: BufferDescriptor);

    /// Buffers across all channels.
    fn buffer_count(&self) -> usize;
}
