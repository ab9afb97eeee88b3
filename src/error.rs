use std::error;
use std::fmt;

/// Errors surfaced by the transport layer.
///
/// Per the layer's error policy, this is the only channel errors travel
/// through across the public boundary; the one fatal class (command-pending
/// watchdog expiry) never becomes an `Error` value because it terminates the
/// process (see [`crate::correlator::FatalHandler`]).
#[derive(Debug)]
pub enum Error {
    IOError(nix::Error),
    MutexPoisoned(String),
    AllocationFailed,
    VendorCommandSubmission(&'static str),
    NotRunning,
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::IOError(ref errno) => write!(f, "IO error: {}", errno),
            Error::MutexPoisoned(ref what) => write!(f, "mutex poisoned: {}", what),
            Error::AllocationFailed => write!(f, "packet buffer allocation failed"),
            Error::VendorCommandSubmission(cmd) => write!(f, "vendor command submission failed: {}", cmd),
            Error::NotRunning => write!(f, "hci event loop is not running"),
            Error::Other(ref msg) => write!(f, "{}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IOError(ref errno) => errno.source(),
            _ => None,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::IOError(nix::Error::Sys(e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned(e.to_string())
    }
}
