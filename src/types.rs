// vim: tw=80
//! Common type definitions used throughout zbdfs

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use std::fmt::{self, Display, Formatter};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes a `Zone` within the device.  Zone ids are dense, starting from 0.
pub type ZoneT = u32;

/// File ID
///
/// Uniquely identifies each file hosted on the device.  File IDs are
/// monotonic and never reused.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for FileId {
    fn from(id: u64) -> Self {
        FileId(id)
    }
}

/// Engine-supplied prediction of how long written data will stay live.
///
/// The variants are ordered from shortest expected lifetime to longest.  The
/// allocator co-locates data with equal hints so that it will die together.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord,
         Primitive)]
pub enum WriteLifetime {
    #[default]
    NotSet  = 0,
    Short   = 1,
    Medium  = 2,
    Long    = 3,
    Extreme = 4,
}

impl WriteLifetime {
    /// Are two hints close enough to share a zone?  Strict equality; a
    /// `NotSet` hint matches nothing but itself.
    pub fn compatible(self, other: WriteLifetime) -> bool {
        self == other
    }
}

/// zbdfs's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum Error {
    // Standard errnos
    ENOENT      = libc::ENOENT as isize,
    EIO         = libc::EIO as isize,
    EEXIST      = libc::EEXIST as isize,
    EBUSY       = libc::EBUSY as isize,
    EINVAL      = libc::EINVAL as isize,
    ENOSPC      = libc::ENOSPC as isize,
    ENOTSUP     = libc::EOPNOTSUPP as isize,
    ESHUTDOWN   = libc::ESHUTDOWN as isize,
    EOVERFLOW   = libc::EOVERFLOW as isize,

    // zbdfs custom error types below
    EUNKNOWN    = 256,
    /// Metadata failed its self-check and cannot be trusted
    EINTEGRITY  = 257,
}

/// zbdfs's result type.
pub type Result<T = ()> = std::result::Result<T, Error>;

impl Error {
    pub fn unhandled<E: fmt::Debug>(e: E) {
        panic!("Unhandled error {e:?}")
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::from_i32(e as i32).unwrap_or(Error::EUNKNOWN)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            // Integrity errors are a special case of I/O errors
            Error::EINTEGRITY => Error::EIO.to_i32().unwrap(),
            _ => e.to_i32().unwrap()
        }
    }
}

// LCOV_EXCL_STOP
