//! Host-stack error types

use thiserror::Error;

/// Errors surfaced by the USB host stack boundary.
///
/// The variant set mirrors the libusb error table so backends can map
/// losslessly; drivers treat everything here as an opaque lower-layer
/// failure and do not retry automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("entity not found")]
    NotFound,

    #[error("access denied")]
    Access,

    #[error("device is gone")]
    NoDevice,

    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Pipe,

    #[error("resource busy")]
    Busy,

    #[error("buffer overflow")]
    Overflow,

    #[error("I/O error")]
    Io,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("host stack error: {0}")]
    Other(String),
}

/// Type alias for host-boundary results
pub type HostResult<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let msg = format!("{}", HostError::NoDevice);
        assert!(msg.contains("gone"));

        let msg = format!("{}", HostError::Other("claim failed".to_string()));
        assert!(msg.contains("claim failed"));
    }
}
