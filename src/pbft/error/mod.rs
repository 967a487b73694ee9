//! Error related business logic of `abraxas`.
//!
//! Every fallible operation in this crate reports an [`Error`] tagged
//! with an [`ErrorKind`], classifying protocol refusals and module
//! failures under one type. Foreign errors are folded in through the
//! [`ResultExt`] extension, keeping `?` usable at the call sites.

use std::error;
use std::fmt;
use std::result;

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The kinds of errors reported throughout this crate.
///
/// The protocol kinds classify why an inbound message was refused;
/// messages failing with one of them are dropped locally, and never
/// provoke a broadcast. `PersistenceFailure` is the exception to the
/// drop policy, halting the replica.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    Config,
    Message,
    Log,
    Sync,
    Core,
    Events,
    Timeouts,
    CryptoHashRingSha2,
    CryptoHashBlake3Blake3,
    // protocol level failures
    InvalidSender,
    OutsideWatermarks,
    WrongView,
    DuplicatePrePrepare,
    DigestMismatch,
    EmptyMessage,
    StaleView,
    PersistenceFailure,
    ExecutionGap,
}

/// The error type used throughout this crate.
///
/// Carries the kind classifying it and, when one exists, the foreign
/// error it wraps.
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// Returns an error of kind `kind`, wrapping nothing.
    pub fn simple(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }

    /// Wraps an arbitrary error in an `Error` of kind `kind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error {
            kind,
            source: Some(e.into()),
        }
    }

    /// Returns the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Reclassifies this `Error` under another kind, keeping
    /// whatever it wraps.
    pub fn swap_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Extension of the standard library's `Result` type, used to wrap
/// its error in an `Error` of a given kind.
pub trait ResultExt {
    type T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

impl<T, E> ResultExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(e) => write!(f, "{:?}: {:?}", self.kind, e),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(e) => write!(f, "{:?}: {}", self.kind, e),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.source {
            Some(e) => Some(&**e),
            None => None,
        }
    }
}
