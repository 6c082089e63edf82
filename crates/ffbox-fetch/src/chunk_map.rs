//! Shared writable mmap over a placeholder file.
//!
//! Downloader tasks write disjoint chunk ranges concurrently; reader tasks
//! only touch ranges already published as downloaded. Publication goes
//! through the reader's state mutex, which provides the happens-before edge
//! between a chunk's memcpy and any read of it.

use std::fs::File;
use std::io;

use bytes::Bytes;
use memmap2::MmapMut;

pub(crate) struct ChunkMap {
    // Kept alive for the mapping; all access goes through `ptr`.
    map: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// The raw pointer targets the mapped region, which outlives every user of
// this struct. Range disjointness is the callers' contract (see below).
unsafe impl Send for ChunkMap {}
unsafe impl Sync for ChunkMap {}

impl ChunkMap {
    /// Map `file` read-write at exactly `len` bytes. The file must already
    /// be sized to `len`.
    pub fn new(file: &File, len: u64) -> io::Result<ChunkMap> {
        let mut map = unsafe { MmapMut::map_mut(file)? };
        if map.len() as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mapped {} bytes, expected {len}", map.len()),
            ));
        }
        let ptr = map.as_mut_ptr();
        Ok(ChunkMap {
            map,
            ptr,
            len: len as usize,
        })
    }

    /// Write `data` at `offset`.
    ///
    /// SAFETY: the caller must be the only writer of
    /// `[offset, offset + data.len())` for the duration of the call.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len);
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
    }

    /// Copy `[offset, offset + len)` out of the map.
    ///
    /// SAFETY: every byte of the range must have been written and published
    /// (no writer may still touch it).
    pub unsafe fn read(&self, offset: usize, len: usize) -> Bytes {
        debug_assert!(offset + len <= self.len);
        Bytes::copy_from_slice(std::slice::from_raw_parts(self.ptr.add(offset), len))
    }

    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(16).unwrap();

        let map = ChunkMap::new(&file, 16).unwrap();
        unsafe {
            map.write(0, b"01234567");
            map.write(8, b"89abcdef");
            assert_eq!(&map.read(4, 8)[..], b"456789ab");
        }
        map.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789abcdef");
    }

    #[test]
    fn size_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(8).unwrap();
        assert!(ChunkMap::new(&file, 16).is_err());
    }
}
