//! Block Device Adapters
//!
//! Implements the `BlockDevice` port over files and in-memory buffers.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::domain::BlockDevice;

/// A regular file or block special file opened read-only.
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        // Block special files report a zero length in their metadata
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }
}

/// A device backed by a byte vector.
///
/// Supports in-place corruption and injected read failures so tests can
/// exercise every recovery path.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    failing: RwLock<Option<Range<u64>>>,
    reads: AtomicU64,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            ..Default::default()
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Overwrite bytes starting at `offset`.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data.write();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Flip bits of the byte at `offset`.
    pub fn corrupt(&self, offset: u64, mask: u8) {
        self.data.write()[offset as usize] ^= mask;
    }

    /// Fail every read that touches `range` (byte offsets).
    pub fn fail_reads(&self, range: Option<Range<u64>>) {
        *self.failing.write() = range;
    }

    /// Number of `read_at` calls served.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let end = offset + buf.len() as u64;
        if let Some(range) = self.failing.read().as_ref() {
            if offset < range.end && range.start < end {
                return Err(io::Error::other(format!(
                    "injected read failure at offset {}",
                    offset
                )));
            }
        }

        let data = self.data.read();
        if end > data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} past end of device", buf.len(), offset),
            ));
        }
        buf.copy_from_slice(&data[offset as usize..end as usize]);
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.data.read().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_device_reads() {
        let dev = MemoryDevice::new((0..=255u8).collect());
        let mut buf = [0u8; 4];
        dev.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [10, 11, 12, 13]);
        assert_eq!(dev.size_blocks(64), 4);
        assert_eq!(dev.reads(), 1);

        assert!(dev.read_at(254, &mut buf).is_err());
    }

    #[test]
    fn test_memory_device_corruption_and_failures() {
        let dev = MemoryDevice::zeroed(1024);
        dev.corrupt(5, 0xff);
        let mut buf = [0u8; 8];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[5], 0xff);

        dev.fail_reads(Some(512..1024));
        assert!(dev.read_at(0, &mut buf).is_ok());
        assert!(dev.read_at(508, &mut buf).is_err());

        dev.fail_reads(None);
        assert!(dev.read_at(508, &mut buf).is_ok());
    }

    #[test]
    fn test_file_device() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 8192]).unwrap();
        file.flush().unwrap();

        let dev = FileDevice::open(file.path()).unwrap();
        assert_eq!(dev.size_bytes(), 8192);

        let mut buf = [0u8; 16];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
        assert!(dev.read_at(8190, &mut buf).is_err());
    }
}
