//! Raw, cache-bypassing device I/O.
//!
//! The wipe engine talks to devices exclusively through the [`RawWriter`] and
//! [`RawReader`] traits so the same code path runs against real block devices
//! and simulated ones. The file-backed implementation here opens block
//! devices with `O_DIRECT` (falling back to synchronous writes) and flushes
//! controller caches on `flush_to_media`.

use std::alloc::{alloc, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::ptr::NonNull;

/// Alignment required for Direct I/O transfers
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Unbuffered sequential writer over a raw device
pub trait RawWriter: Send {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    fn seek(&mut self, offset: u64) -> std::io::Result<()>;
    /// Push written data past the OS and ask the controller to commit it
    fn flush_to_media(&mut self) -> std::io::Result<()>;
}

/// Unbuffered sequential reader over a raw device
pub trait RawReader: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn seek(&mut self, offset: u64) -> std::io::Result<()>;
}

/// Page-aligned heap buffer satisfying `O_DIRECT` transfer requirements
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    size: usize,
}

impl AlignedBuffer {
    pub fn new(size: usize) -> std::io::Result<Self> {
        Self::with_alignment(size, DIRECT_IO_ALIGNMENT)
    }

    pub fn with_alignment(size: usize, alignment: usize) -> std::io::Result<Self> {
        assert!(alignment.is_power_of_two());
        let aligned_size = (size + alignment - 1) & !(alignment - 1);

        let layout = Layout::from_size_align(aligned_size, alignment)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

        let ptr = unsafe {
            let raw = alloc(layout);
            if raw.is_null() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    format!("failed to allocate {aligned_size} aligned bytes"),
                ));
            }
            raw.write_bytes(0, aligned_size);
            NonNull::new_unchecked(raw)
        };

        Ok(Self {
            ptr,
            layout,
            size: aligned_size,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// The buffer owns its allocation exclusively
unsafe impl Send for AlignedBuffer {}

/// How the underlying file handle bypasses the page cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheBypass {
    /// `O_DIRECT`: transfers go straight to the device
    Direct,
    /// `O_SYNC` / fsync-per-flush fallback for filesystems without O_DIRECT
    Synchronous,
}

/// File-backed implementation of [`RawWriter`] and [`RawReader`]
pub struct RawDeviceFile {
    file: File,
    bypass: CacheBypass,
    is_block_device: bool,
}

impl RawDeviceFile {
    pub fn open_write(path: &Path) -> std::io::Result<Self> {
        let is_block_device = Self::is_block_device(path);

        #[cfg(target_os = "linux")]
        if is_block_device {
            use std::os::unix::fs::OpenOptionsExt;
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_DIRECT)
                .open(path)
            {
                Ok(file) => {
                    return Ok(Self {
                        file,
                        bypass: CacheBypass::Direct,
                        is_block_device,
                    })
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e,
                        "O_DIRECT unavailable, falling back to synchronous writes");
                }
            }
        }

        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self {
            file,
            bypass: CacheBypass::Synchronous,
            is_block_device,
        })
    }

    pub fn open_read(path: &Path) -> std::io::Result<Self> {
        let is_block_device = Self::is_block_device(path);
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            bypass: CacheBypass::Synchronous,
            is_block_device,
        })
    }

    fn is_block_device(path: &Path) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            std::fs::metadata(path)
                .map(|m| m.file_type().is_block_device())
                .unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            false
        }
    }

    /// Current length by seeking to the end; callers restore position
    pub fn seek_end(&mut self) -> std::io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    /// Drop the kernel's buffer cache for the device after a flush
    #[cfg(target_os = "linux")]
    fn flush_kernel_buffers(&self) {
        use std::os::unix::io::AsRawFd;

        nix::ioctl_none!(blkflsbuf, 0x12, 97);
        if self.is_block_device {
            // Best effort: a failed cache drop does not fail the wipe
            let _ = unsafe { blkflsbuf(self.file.as_raw_fd()) };
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn flush_kernel_buffers(&self) {}
}

impl RawWriter for RawDeviceFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn flush_to_media(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        if self.bypass == CacheBypass::Direct || self.is_block_device {
            self.flush_kernel_buffers();
        }
        Ok(())
    }
}

impl RawReader for RawDeviceFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn aligned_buffer_rounds_up_and_aligns() {
        let buf = AlignedBuffer::new(1000).unwrap();
        assert_eq!(buf.len(), DIRECT_IO_ALIGNMENT);
        assert_eq!(buf.as_slice().as_ptr() as usize % DIRECT_IO_ALIGNMENT, 0);
    }

    #[test]
    fn write_seek_read_roundtrip_on_regular_file() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 8192]).unwrap();

        let mut writer = RawDeviceFile::open_write(tmp.path()).unwrap();
        RawWriter::seek(&mut writer, 4096).unwrap();
        assert_eq!(writer.write(&[0xA5u8; 512]).unwrap(), 512);
        writer.flush_to_media().unwrap();

        let mut reader = RawDeviceFile::open_read(tmp.path()).unwrap();
        RawReader::seek(&mut reader, 4096).unwrap();
        let mut back = [0u8; 512];
        assert_eq!(reader.read(&mut back).unwrap(), 512);
        assert!(back.iter().all(|&b| b == 0xA5));
    }
}
