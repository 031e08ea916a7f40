//! Control endpoint: probe/commit negotiation, per-unit controls and vendor commands

pub mod dispatcher;
pub mod probe;
pub mod registry;
pub mod request;
pub mod vendor;

pub use dispatcher::ControlDispatcher;
pub use probe::{Negotiation, ProbeCommit, COMMIT_CONTROL, PROBE_CONTROL, PROBE_LEN};
pub use registry::{selector, Capabilities, ControlRegistry, UnitId};
pub use request::{ControlRequest, ControlResponse, RequestCode, SetupPacket};
pub use vendor::{FrameRate, VendorCommand, WindowOffset};
