// Error taxonomy for the collector core. Application boundary (config load, main) uses anyhow.

use std::time::Duration;

/// Invalid device configuration. Fatal for that device only; never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("device '{device}': unknown vendor '{vendor}'")]
    UnknownVendor { device: String, vendor: String },
    #[error("device '{device}': invalid interface selection: {reason}")]
    InvalidInterface { device: String, reason: String },
    #[error("device '{device}': {reason}")]
    InvalidDevice { device: String, reason: String },
    #[error("duplicate device id '{0}'")]
    DuplicateDevice(String),
}

/// Failure of one query exchange with a device. Recovered locally: the device is skipped
/// for the cycle and polled again on the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{host}: no response within {after:?}")]
    Timeout { host: String, after: Duration },
    #[error("{host}: unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("{host}: malformed response: {reason}")]
    Malformed { host: String, reason: String },
    /// Well-formed error response from the agent (never retried).
    #[error("{host}: agent returned error status: {status}")]
    ErrorStatus { host: String, status: String },
    /// No session could be set up (bad credentials, unresolvable address).
    #[error("{host}: client setup failed: {reason}")]
    Setup { host: String, reason: String },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A raw value could not be turned into an exact counter of the declared width.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("counter not present on agent ({0})")]
    Absent(&'static str),
    #[error("unsupported wire shape: {0}")]
    UnsupportedShape(&'static str),
    #[error("value does not fit a {width}-bit counter: {detail}")]
    WidthMismatch { width: u8, detail: String },
    #[error("negative value {0} for an unsigned counter")]
    Negative(i64),
}

/// Per-device outcome of a failed poll within one cycle.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
