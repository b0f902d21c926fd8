// vim: tw=80

use byteorder::{BigEndian, ByteOrder};
use crate::types::*;
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::hash::Hasher;
use uuid::Uuid;

/*
 * On-disk Superblock Format:
 *
 * Magic:       16 bytes
 * Checksum:    8 bytes     MetroHash64.  Covers all of Length and Contents.
 * Length:      8 bytes     Length of Contents in bytes
 * Contents:    variable    bincode-encoded Label
 * Pad:         variable    0-padding fills the remainder of one block
 *
 * The superblock occupies the first block of the first metadata zone and is
 * written exactly once, at format time.
 */
/// The superblock magic is "zbdfs superblk\0\0"
const MAGIC: &[u8; MAGIC_LEN] = b"zbdfs superblk\0\0";
const MAGIC_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;
const LENGTH_LEN: usize = 8;

/// Format-time identity and geometry of the device.
///
/// Geometry is recorded so that an open can detect a device that was
/// reformatted or swapped underneath the file system.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Label {
    pub uuid:             Uuid,
    /// Salt for `unique_id`; fixed at format time
    pub generation:       u32,
    pub block_sz:         u64,
    pub zone_sz:          u64,
    pub nr_zones:         ZoneT,
    pub meta_zones:       ZoneT,
    pub reserved_zones:   ZoneT,
    pub max_active:       u32,
    pub max_open:         u32,
    pub finish_threshold: u32,
}

fn checksum(contents: &[u8]) -> u64 {
    let mut hasher = MetroHash64::new();
    hasher.write_u64((contents.len() as u64).to_be());
    hasher.write(contents);
    hasher.finish()
}

/// Parse and verify a superblock read from the device.
pub fn read_label(buf: &[u8]) -> Result<Label> {
    if buf.len() < MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN {
        return Err(Error::EINVAL);
    }
    if MAGIC[..] != buf[0..MAGIC_LEN] {
        return Err(Error::EINVAL);
    }
    let stored = BigEndian::read_u64(&buf[MAGIC_LEN..MAGIC_LEN + CHECKSUM_LEN]);
    let length_start = MAGIC_LEN + CHECKSUM_LEN;
    let contents_start = length_start + LENGTH_LEN;
    let contents_len = BigEndian::read_u64(&buf[length_start..contents_start])
        as usize;
    if contents_start + contents_len > buf.len() {
        return Err(Error::EINTEGRITY);
    }
    let contents = &buf[contents_start..contents_start + contents_len];
    if stored != checksum(contents) {
        return Err(Error::EINTEGRITY);
    }
    bincode::deserialize(contents).map_err(|_| Error::EINTEGRITY)
}

/// Serialize `label` into a single zero-padded block of `block_sz` bytes.
pub fn write_label(label: &Label, block_sz: u64) -> Result<Vec<u8>> {
    let contents = bincode::serialize(label).unwrap();
    let header_len = MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN;
    if header_len + contents.len() > block_sz as usize {
        return Err(Error::EOVERFLOW);
    }
    let mut buf = vec![0u8; block_sz as usize];
    buf[0..MAGIC_LEN].copy_from_slice(&MAGIC[..]);
    BigEndian::write_u64(&mut buf[MAGIC_LEN..], checksum(&contents));
    let length_start = MAGIC_LEN + CHECKSUM_LEN;
    BigEndian::write_u64(&mut buf[length_start..],
                         contents.len() as u64);
    buf[header_len..header_len + contents.len()].copy_from_slice(&contents);
    Ok(buf)
}

// LCOV_EXCL_STOP
