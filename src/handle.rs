// vim: tw=80
//! POSIX-shaped file handles over `ZoneFile`.
//!
//! The writable handle turns unaligned engine writes into block-granular
//! appends; the read handles translate byte offsets through the extent
//! list.  Handles are single-owner: the engine wraps them in whatever
//! sharing it needs.

use crate::{
    device::ZonedDevice,
    file::{MetadataWriter, ZoneFile},
    types::*,
};
use std::{cmp, sync::Arc};

/// Staging buffer size, in blocks.  Large enough that table builders mostly
/// write whole buffers, small enough not to matter per open file.
const BUFFER_BLOCKS: usize = 256;

/// Append-only writable file.
///
/// Buffers unaligned writes into a block-aligned staging buffer, flushing to
/// the underlying `ZoneFile` on fill or on an explicit flush/sync/close.
/// `close` also persists the file's metadata record through the supplied
/// `MetadataWriter`.
pub struct ZonedWritableFile {
    dev: Arc<ZonedDevice>,
    file: Arc<ZoneFile>,
    metadata_writer: Option<Arc<dyn MetadataWriter>>,
    buffered: bool,
    buffer: Vec<u8>,
    buffer_sz: usize,
    block_sz: usize,
    /// Logical file size including bytes still in the staging buffer
    wp: u64,
    closed: bool,
}

impl ZonedWritableFile {
    pub fn new(dev: Arc<ZonedDevice>, file: Arc<ZoneFile>, buffered: bool,
               metadata_writer: Option<Arc<dyn MetadataWriter>>) -> Self
    {
        file.set_appending(true);
        let block_sz = dev.block_size() as usize;
        let buffer_sz = block_sz * BUFFER_BLOCKS;
        ZonedWritableFile {
            wp: file.size(),
            dev,
            file,
            metadata_writer,
            buffered,
            buffer: Vec::with_capacity(buffer_sz),
            buffer_sz,
            block_sz,
            closed: false,
        }
    }

    pub fn append(&mut self, data: &[u8]) -> Result {
        if self.buffered {
            self.buffered_write(data)
        } else {
            // Direct mode: the engine already writes block-granular
            if data.len() % self.block_sz != 0 {
                return Err(Error::EINVAL);
            }
            self.file.append(&self.dev, data, data.len())?;
            self.wp += data.len() as u64;
            Ok(())
        }
    }

    /// The device is append-only; `offset` must equal the current size.
    pub fn positioned_append(&mut self, data: &[u8], offset: u64) -> Result {
        if offset != self.wp {
            return Err(Error::ENOTSUP);
        }
        self.append(data)
    }

    /// Growing to the current size is a no-op; anything else cannot be done
    /// on sequential-write media.
    pub fn truncate(&mut self, size: u64) -> Result {
        if size == self.wp {
            Ok(())
        } else {
            Err(Error::ENOTSUP)
        }
    }

    pub fn flush(&mut self) -> Result {
        self.flush_buffer()
    }

    /// Flush staged data, make it durable, and persist the file's metadata
    /// record.
    pub fn sync(&mut self) -> Result {
        self.flush_buffer()?;
        self.file.append_buffer(&self.dev)?;
        self.dev.zbd().sync_all()?;
        self.persist_metadata()
    }

    pub fn fsync(&mut self) -> Result {
        self.sync()
    }

    /// The device offers no finer durability granularity than a full sync.
    pub fn range_sync(&mut self, _offset: u64, _nbytes: u64) -> Result {
        self.sync()
    }

    pub fn close(&mut self) -> Result {
        self.flush_buffer()?;
        self.file.close_wr(&self.dev)?;
        self.dev.zbd().sync_all()?;
        self.persist_metadata()?;
        self.closed = true;
        Ok(())
    }

    pub fn set_write_lifetime_hint(&mut self, hint: WriteLifetime) {
        self.file.set_lifetime(hint);
    }

    /// Declare the file a sorted table; feeds the allocator's placement.
    pub fn set_key_range(&mut self, smallest: &[u8], largest: &[u8],
                         level: u32)
    {
        self.file.set_key_range(smallest, largest, level);
    }

    pub fn required_buffer_alignment(&self) -> usize {
        self.block_sz
    }

    pub fn size(&self) -> u64 {
        self.wp
    }

    fn buffered_write(&mut self, mut data: &[u8]) -> Result {
        while !data.is_empty() {
            let room = self.buffer_sz - self.buffer.len();
            let n = cmp::min(room, data.len());
            self.buffer.extend_from_slice(&data[..n]);
            self.wp += n as u64;
            data = &data[n..];
            if self.buffer.len() == self.buffer_sz {
                self.flush_buffer()?;
            }
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let valid = self.buffer.len();
        // ZoneFile pads the tail out to the block size; the padding lands
        // on media but not in the file
        self.file.append(&self.dev, &self.buffer, valid)?;
        self.buffer.clear();
        Ok(())
    }

    fn persist_metadata(&self) -> Result {
        if let Some(w) = &self.metadata_writer {
            w.persist(&self.dev, &self.file)?;
            self.file.metadata_synced();
        }
        Ok(())
    }
}

impl Drop for ZonedWritableFile {
    fn drop(&mut self) {
        if !self.closed {
            // Best effort: give the active zone back so its open slot does
            // not leak.  Metadata is not persisted on this path.
            let _ = self.flush_buffer();
            let _ = self.file.close_wr(&self.dev);
        }
    }
}

/// Cursor-style sequential reader.
pub struct ZonedSequentialFile {
    dev: Arc<ZonedDevice>,
    file: Arc<ZoneFile>,
    /// Read position
    rp: u64,
    direct: bool,
}

impl ZonedSequentialFile {
    pub fn new(dev: Arc<ZonedDevice>, file: Arc<ZoneFile>, direct: bool)
        -> Self
    {
        ZonedSequentialFile { dev, file, rp: 0, direct }
    }

    /// Read up to `buf.len()` bytes, advancing the cursor.  Short reads
    /// happen only at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file.positioned_read(&self.dev, self.rp, buf,
                                          self.direct)?;
        self.rp += n as u64;
        Ok(n)
    }

    pub fn positioned_read(&self, offset: u64, buf: &mut [u8])
        -> Result<usize>
    {
        self.file.positioned_read(&self.dev, offset, buf, self.direct)
    }

    pub fn skip(&mut self, n: u64) -> Result {
        self.rp += n;
        Ok(())
    }

    pub fn required_buffer_alignment(&self) -> usize {
        self.dev.block_size() as usize
    }
}

/// Stateless positional reader.
pub struct ZonedRandomAccessFile {
    dev: Arc<ZonedDevice>,
    file: Arc<ZoneFile>,
    direct: bool,
}

impl ZonedRandomAccessFile {
    pub fn new(dev: Arc<ZonedDevice>, file: Arc<ZoneFile>, direct: bool)
        -> Self
    {
        ZonedRandomAccessFile { dev, file, direct }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.positioned_read(&self.dev, offset, buf, self.direct)
    }

    /// Stable identifier for block-cache keying; survives renames and
    /// cleaning.
    pub fn unique_id(&self, out: &mut [u8]) -> usize {
        self.file.unique_id(out)
    }

    pub fn required_buffer_alignment(&self) -> usize {
        self.dev.block_size() as usize
    }
}

// LCOV_EXCL_STOP
