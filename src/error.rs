#[cfg(any(test, feature = "std"))]
use std::io;

use core::convert::Infallible;

/// The set of all possible errors surfaced across crate boundaries.
///
/// Most internal failures (a bad CRC, an address past the end of a block, a
/// backend read that came back short) are legitimate "this log segment ends
/// here" conditions and are reported as `bool`/`Option` at the point of use
/// instead of being promoted to this enum. `Error` exists for the handful of
/// spots where the caller can actually act on the distinction: geometry
/// construction, chain location/creation, and tree construction.
#[derive(Debug)]
pub enum Error {
    /// A geometry value failed its own sanity check (e.g. a non power-of-two
    /// sector size).
    InvalidGeometry,
    /// A block header's magic did not match at a point where the caller
    /// needed a decisive answer rather than "treat as end of log".
    BadMagic,
    /// An address fell outside the addressable range of its geometry.
    OutOfBounds(usize),
    /// The allocator could not produce a block of the requested type.
    AllocatorExhausted,
    /// The wandering super-block chain could not be located, or a link
    /// pointed at a block that did not, in turn, point back.
    CorruptChain,
    /// A `StorageBackend` read/write/erase call reported failure at a
    /// block this crate had no fallback for.
    BackendFailure(u32),
    #[cfg(any(test, feature = "std"))]
    Io(io::Error),
}

impl From<Infallible> for Error {
    fn from(_: Infallible) -> Error {
        unreachable!()
    }
}

#[cfg(any(test, feature = "std"))]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl PartialEq for Error {
    fn eq(&self, rhs: &Error) -> bool {
        match (self, rhs) {
            (&Error::InvalidGeometry, &Error::InvalidGeometry) => true,
            (&Error::BadMagic, &Error::BadMagic) => true,
            (&Error::OutOfBounds(a), &Error::OutOfBounds(b)) => a == b,
            (&Error::AllocatorExhausted, &Error::AllocatorExhausted) => true,
            (&Error::CorruptChain, &Error::CorruptChain) => true,
            (&Error::BackendFailure(a), &Error::BackendFailure(b)) => a == b,
            _ => false,
        }
    }
}
