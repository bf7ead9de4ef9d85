//! Error type for fallible collector operations, and the fatal-abort path
//! for consistency violations the collector cannot recover from.

use std::fmt;
use std::io;

/// Errors returned by the collector's public API.
#[derive(Debug)]
pub enum GcError {
    /// No memory could be found for a request, even after collecting,
    /// growing the heap and consulting the out-of-memory callback.
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
    },
    /// The memory source refused to map a new chunk.
    Map(io::Error),
    /// A configuration value is out of range or could not be parsed.
    InvalidConfig(String),
    /// The calling thread already has a live registration.
    AlreadyRegistered,
    /// The kind table is full.
    TooManyKinds,
    /// A helper marker thread could not be started.
    Spawn(io::Error),
    /// The platform cannot tell where the calling thread's stack begins;
    /// register it with an explicit stack base instead.
    UnknownStackBase,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            Self::Map(err) => write!(f, "failed to map heap memory: {err}"),
            Self::InvalidConfig(msg) => write!(f, "invalid collector configuration: {msg}"),
            Self::AlreadyRegistered => f.write_str("thread is already registered with the collector"),
            Self::TooManyKinds => f.write_str("object kind table is full"),
            Self::Spawn(err) => write!(f, "failed to start marker thread: {err}"),
            Self::UnknownStackBase => f.write_str("stack base of the current thread is unknown"),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map(err) | Self::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GcError {
    fn from(err: io::Error) -> Self {
        Self::Map(err)
    }
}

/// Reports an unrecoverable consistency violation and aborts the process.
///
/// Continuing after a corrupted header, an unknown kind or a failed thread
/// suspension would let the collector free live memory.
#[cold]
#[inline(never)]
pub fn fatal_abort(args: fmt::Arguments<'_>) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!("{args}");
    eprintln!("[GC] fatal: {args}");
    std::process::abort()
}

/// `fatal!("...")` formats its arguments and aborts through [`fatal_abort`].
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal_abort(format_args!($($arg)*))
    };
}
pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_mentions_request_size() {
        let err = GcError::OutOfMemory { requested: 4096 };
        assert_eq!(err.to_string(), "out of memory allocating 4096 bytes");
    }

    #[test]
    fn map_error_exposes_source() {
        let err = GcError::from(io::Error::new(io::ErrorKind::OutOfMemory, "no room"));
        assert!(err.source().is_some());
        assert!(GcError::AlreadyRegistered.source().is_none());
    }
}
