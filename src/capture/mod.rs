pub mod buffer;
pub mod pool;
pub mod sim;
pub mod transport;

pub use buffer::{BufferDescriptor, BufferGeometry, Channel};
pub use pool::SlotPool;
pub use sim::{FrameReport, SimulatedCapture};
pub use transport::{CaptureEvent, CaptureTransport, TerminalState};
