// vim: tw=80
//! zbdfs: a log-structured file layer for Zoned Block Devices.
//!
//! A zoned device only ever accepts sequential writes within a zone, and
//! reclaims space a whole zone at a time.  zbdfs maps append-style files
//! (immutable sorted tables plus a write-ahead log) onto such a device:
//! a lifetime- and level-aware allocator places data that will die together
//! in the same zone, files are ordered lists of extents, and a cleaner
//! relocates the last live extents out of mostly-dead zones so they can be
//! reset.

pub mod cleaner;
pub mod device;
pub mod file;
pub mod handle;
pub mod label;
pub mod types;
pub mod util;
pub mod zbd;
pub mod zbd_file;
pub mod zone;

pub use crate::types::*;
pub use crate::util::*;
