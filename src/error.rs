//! Error types for the streaming core.
//!
//! Each enum matches one failure class of the device:
//!
//! - [`ProtocolError`]: a malformed or unsupported control request. The control task answers
//!   every one of these with a protocol stall and changes no state.
//! - [`TransportError`]: a commit, flush or reset on the capture/host transports failed. These are
//!   logged and retried; only persistent failure escalates to the fatal handler.
//! - [`SensorIoError`]: sensor register access failed. Callers log it and keep the last known
//!   configuration.
//! - [`InitError`]: startup configuration is unusable. Nothing is started.

use thiserror::Error;

use crate::capture::Channel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown class request code {0:#04x}")]
    UnknownRequest(u8),

    #[error("request addressed to unsupported interface {0}")]
    UnsupportedInterface(u16),

    #[error("unit {unit} has no control with selector {selector:#06x}")]
    UnsupportedControl { unit: u8, selector: u16 },

    #[error("{request:?} is not supported on unit {unit} selector {selector:#06x}")]
    UnsupportedRequest {
        unit: u8,
        selector: u16,
        request: crate::control::RequestCode,
    },

    #[error("data stage too short: expected {expected} bytes, got {got}")]
    ShortData { expected: usize, got: usize },

    #[error("unknown vendor command id {0:#04x}")]
    UnknownVendorCommand(u8),

    #[error("value {value} out of range for selector {selector:#06x}")]
    OutOfRange { selector: u16, value: i64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("host endpoint has no room for another buffer")]
    Backpressure,

    #[error("commit of {len} bytes failed: {reason}")]
    Commit { len: usize, reason: String },

    #[error("no partial buffer pending on {0:?}")]
    NothingToFlush(Channel),

    #[error("capture state {0} is not a terminal state")]
    UnexpectedState(u8),

    #[error("capture transport reset failed: {0}")]
    Reset(String),

    #[error("capture transport could not be armed: {0}")]
    Arm(String),

    #[error("host link is down")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorIoError {
    #[error("sensor at {addr:#04x} did not acknowledge")]
    Nack { addr: u8 },

    #[error("sensor bus error: {0}")]
    Bus(String),
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("configuration validation error: {0}")]
    Invalid(String),

    #[error("sensor initialisation failed: {0}")]
    Sensor(#[from] SensorIoError),
}
