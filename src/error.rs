//! Error and Result module.

use std::io;

/// Result type often returned from methods that can have braid `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by sockets, endpoints, streams, and asynchronous
/// operations.
///
/// The numeric codes returned by [`Error::code`] are stable across
/// releases and language bindings; new variants may be added, but codes
/// are never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The object (pipe, stream, socket) was closed.
    #[error("object closed")]
    Closed,

    /// The operation did not complete before its timeout expired.
    #[error("timed out")]
    TimedOut,

    /// The operation was canceled by the caller.
    #[error("operation canceled")]
    Canceled,

    /// The object has been stopped and will accept no further operations.
    #[error("object stopped")]
    Stopped,

    /// An allocation or resource reservation failed.
    #[error("out of memory")]
    NoMemory,

    /// The supplied address or URL could not be parsed or is not usable.
    #[error("invalid address")]
    InvalidAddress,

    /// An argument was malformed or out of range.
    #[error("invalid argument")]
    InvalidArgument,

    /// The object is busy and cannot accept the request (for example a
    /// TLS configuration that is already in use).
    #[error("resource busy")]
    Busy,

    /// The operation or option is not supported by this transport or
    /// build.
    #[error("not supported")]
    NotSupported,

    /// The peer violated the protocol (bad negotiation header, bad
    /// framing, reserved WebSocket opcode, and so on).
    #[error("protocol error")]
    ProtocolError,

    /// The connection was shut down by the peer mid-operation.
    #[error("connection shut down")]
    ConnShutdown,

    /// The remote peer refused the connection.
    #[error("connection refused")]
    ConnRefused,

    /// An inbound message exceeded the configured receive limit.
    #[error("message too large")]
    MessageTooBig,

    /// The platform denied permission for the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// The requested local address is already in use.
    #[error("address in use")]
    AddressInUse,

    /// The process is out of file descriptors or handles.
    #[error("too many open files")]
    NoFiles,
}

impl Error {
    /// The stable numeric code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Closed => 1,
            Error::TimedOut => 2,
            Error::Canceled => 3,
            Error::Stopped => 4,
            Error::NoMemory => 5,
            Error::InvalidAddress => 6,
            Error::InvalidArgument => 7,
            Error::Busy => 8,
            Error::NotSupported => 9,
            Error::ProtocolError => 10,
            Error::ConnShutdown => 11,
            Error::ConnRefused => 12,
            Error::MessageTooBig => 13,
            Error::PermissionDenied => 14,
            Error::AddressInUse => 15,
            Error::NoFiles => 16,
        }
    }

    /// Whether the error is transient: the operation failed but the
    /// endpoint may re-arm (a dialer reconnects, a listener accepts
    /// again).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TimedOut | Error::Canceled | Error::ConnShutdown | Error::ConnRefused
        )
    }

    /// Translate an I/O error from the platform layer.
    ///
    /// `WouldBlock` is deliberately absent: the platform layer never lets
    /// it escape to a completion.
    pub(crate) fn from_io(err: &io::Error) -> Error {
        use io::ErrorKind::*;

        match err.kind() {
            ConnectionRefused => Error::ConnRefused,
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                Error::ConnShutdown
            }
            AddrInUse => Error::AddressInUse,
            AddrNotAvailable | NotFound => Error::InvalidAddress,
            PermissionDenied => Error::PermissionDenied,
            TimedOut => Error::TimedOut,
            InvalidInput => Error::InvalidArgument,
            OutOfMemory => Error::NoMemory,
            _ => match err.raw_os_error() {
                Some(code) if code == ENFILE || code == EMFILE => Error::NoFiles,
                _ => Error::ConnShutdown,
            },
        }
    }
}

// ENFILE/EMFILE share these values on every Unix we build for; there is
// no stable io::ErrorKind for them.
#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;
#[cfg(not(unix))]
const ENFILE: i32 = -1;
#[cfg(not(unix))]
const EMFILE: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Closed.code(), 1);
        assert_eq!(Error::TimedOut.code(), 2);
        assert_eq!(Error::MessageTooBig.code(), 13);
        assert_eq!(Error::NoFiles.code(), 16);
    }

    #[test]
    fn io_translation() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(Error::from_io(&refused), Error::ConnRefused);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(Error::from_io(&reset), Error::ConnShutdown);

        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        assert_eq!(Error::from_io(&in_use), Error::AddressInUse);
    }

    #[test]
    fn transient_classification() {
        assert!(Error::ConnRefused.is_transient());
        assert!(Error::TimedOut.is_transient());
        assert!(!Error::ProtocolError.is_transient());
        assert!(!Error::AddressInUse.is_transient());
    }
}
