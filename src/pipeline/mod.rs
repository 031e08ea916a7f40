pub mod commit;
pub mod header;
pub mod lifecycle;

pub use commit::{CommitEngine, CommitOutcome};
pub use header::{HeaderFlags, PayloadHeader, FOOTER_LEN, HEADER_LEN};
pub use lifecycle::{Activity, StreamController, StreamState};
