//! A [`BlockDevice`] backed by a device node or a plain image file.
use super::{BlockDevice, check_block_aligned, check_block_range};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Block size assumed for plain files when none is given.
pub const DEFAULT_FILE_BLOCK_SIZE: usize = 512;

#[cfg(target_os = "linux")]
mod ioctl {
    use nix::{ioctl_read, ioctl_read_bad};

    ioctl_read!(blkgetsize64, 0x12, 114, u64);
    ioctl_read_bad!(blksszget, 0x1268, libc::c_int);
}

/// A block device accessed through positional reads and writes on a file
/// handle. Positional I/O keeps `&self` calls from different workers from
/// racing on a shared cursor.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    path: PathBuf,
    block_size: usize,
    block_count: u64,
}

impl FileBlockDevice {
    /// Opens `path` for reading and writing.
    ///
    /// Device nodes report their logical block size and byte size to the
    /// kernel; on Linux they are also opened with `O_EXCL`, which fails with
    /// `EBUSY` while any partition of the device is mounted. For plain files
    /// `block_size` (or [`DEFAULT_FILE_BLOCK_SIZE`]) is used and trailing
    /// bytes that do not fill a whole block are not addressable.
    pub fn open(path: &Path, block_size: Option<usize>) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let is_device = is_block_device(&metadata);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if is_device {
            request_exclusive(&mut options);
        }
        let file = options.open(path)?;

        let (block_size, size_bytes) = if is_device {
            query_device_geometry(&file)?
        } else {
            (
                block_size.unwrap_or(DEFAULT_FILE_BLOCK_SIZE),
                file.metadata()?.len(),
            )
        };

        if block_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block size must be greater than zero",
            ));
        }

        let block_count = size_bytes / block_size as u64;
        debug!(
            path = %path.display(),
            block_size,
            block_count,
            is_device,
            "Opened block device"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
            block_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, first_block: u64, buf: &mut [u8]) -> io::Result<()> {
        check_block_aligned(buf.len(), self.block_size)?;
        check_block_range(first_block, (buf.len() / self.block_size) as u64, self.block_count)?;
        read_exact_at(&self.file, buf, first_block * self.block_size as u64)
    }

    fn write_blocks(&self, first_block: u64, buf: &[u8]) -> io::Result<()> {
        check_block_aligned(buf.len(), self.block_size)?;
        check_block_range(first_block, (buf.len() / self.block_size) as u64, self.block_count)?;
        write_all_at(&self.file, buf, first_block * self.block_size as u64)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(unix)]
fn is_block_device(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn request_exclusive(options: &mut OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.custom_flags(libc::O_EXCL);
}

#[cfg(not(target_os = "linux"))]
fn request_exclusive(_options: &mut OpenOptions) {}

/// Returns `(logical block size, size in bytes)` of a device node.
#[cfg(target_os = "linux")]
fn query_device_geometry(file: &File) -> io::Result<(usize, u64)> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let mut size_bytes: u64 = 0;
    let mut block_size: libc::c_int = 0;
    // SAFETY: both ioctls only write into the provided integers.
    unsafe {
        ioctl::blkgetsize64(fd, &mut size_bytes).map_err(io::Error::from)?;
        ioctl::blksszget(fd, &mut block_size).map_err(io::Error::from)?;
    }
    let block_size = usize::try_from(block_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative block size"))?;
    Ok((block_size, size_bytes))
}

#[cfg(not(target_os = "linux"))]
fn query_device_geometry(file: &File) -> io::Result<(usize, u64)> {
    Ok((DEFAULT_FILE_BLOCK_SIZE, file.metadata()?.len()))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_file_geometry_ignores_trailing_bytes() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&vec![0u8; 4096 + 100]).unwrap();
        image.flush().unwrap();

        let device = FileBlockDevice::open(image.path(), Some(1024)).unwrap();
        assert_eq!(device.block_size(), 1024);
        assert_eq!(device.block_count(), 4);
        assert_eq!(device.capacity(), 4096);
    }

    #[test]
    fn positional_round_trip() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&vec![0u8; 512 * 8]).unwrap();
        image.flush().unwrap();

        let device = FileBlockDevice::open(image.path(), None).unwrap();
        let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        device.write_blocks(3, &data).unwrap();

        let mut back = vec![0u8; 1024];
        device.read_blocks(3, &mut back).unwrap();
        assert_eq!(back, data);

        let on_disk = fs::read(image.path()).unwrap();
        assert_eq!(&on_disk[3 * 512..5 * 512], &data[..]);
    }

    #[test]
    fn rejects_out_of_range_and_unaligned_requests() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&vec![0u8; 512 * 2]).unwrap();
        image.flush().unwrap();

        let device = FileBlockDevice::open(image.path(), None).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(device.read_blocks(2, &mut buf).is_err());
        assert!(device.write_blocks(0, &buf[..100]).is_err());
    }

    #[test]
    fn missing_path_is_not_found() {
        let err = FileBlockDevice::open(Path::new("/nonexistent/burnr-device"), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
