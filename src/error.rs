use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced by the runtime.
///
/// Errors are plain values; nothing is ever thrown across a context switch.
/// `Interrupted` and `TimedOut` are the cooperative-control results reported
/// by parking calls, the rest are programming or resource errors that leave
/// the runtime state untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,

    #[error("resource busy")]
    Busy,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("operation would deadlock")]
    Deadlock,

    /// The fiber was interrupted while (or before) parking.
    #[error("interrupted")]
    Interrupted,

    /// A timed wait expired before the awaited event occurred.
    #[error("timed out")]
    TimedOut,

    #[error("out of memory")]
    NoMemory,

    #[error("i/o error: {0}")]
    Io(#[from] Errno),
}

pub type Result<T> = core::result::Result<T, Error>;
