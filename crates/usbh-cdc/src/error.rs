//! Driver error types

use thiserror::Error;
use usbh::HostError;

/// Errors returned by the CDC driver's public surface.
///
/// Partial I/O is not an error: `read`/`write` report short byte counts as
/// `Ok`. Lower-layer failures pass through as [`CdcError::Host`] and are not
/// decomposed or retried here.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum CdcError {
    /// Malformed caller input, detected locally with no side effects.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Operation attempted outside its required lifecycle phase.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Allocation or capacity limit hit; the operation fully unwound.
    #[error("resource exhausted: {0}")]
    NoMem(&'static str),

    /// A bounded wait (driver task shutdown) exceeded its guard period.
    #[error("driver task did not stop within the guard period")]
    NotFinished,

    /// Opaque host-stack failure.
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, CdcError>;
