pub mod loopback;
pub mod transport;

pub use loopback::{Ep0Reply, HostReader, LoopbackHost, ReceivedPacket};
pub use transport::{HostTransport, UsbSpeed};
