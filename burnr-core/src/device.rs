//! The block device contract consumed by the streaming engine.
//!
//! A [`BlockDevice`] is an opaque array of fixed-size blocks. The engine only
//! issues whole-block requests, and every request it has in flight targets a
//! block range disjoint from the others, so implementations need `&self`
//! methods that are safe to call from the background I/O workers.
//!
//! Two implementations are provided:
//! - [`FileBlockDevice`]: a raw device node (`/dev/sdX`) or a plain file.
//! - [`MemoryBlockDevice`]: RAM-backed, with fault injection for tests and
//!   simulations.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod file;
mod memory;

pub use self::file::FileBlockDevice;
pub use self::memory::{IoOp, MemoryBlockDevice};

/// A storage target addressable only in fixed-size blocks.
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes. Always greater than zero.
    fn block_size(&self) -> usize;

    /// Total number of blocks on the device.
    fn block_count(&self) -> u64;

    /// Reads `buf.len() / block_size()` consecutive blocks starting at
    /// `first_block`. `buf.len()` must be a multiple of the block size.
    fn read_blocks(&self, first_block: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf.len() / block_size()` consecutive blocks starting at
    /// `first_block`. `buf.len()` must be a multiple of the block size.
    fn write_blocks(&self, first_block: u64, buf: &[u8]) -> io::Result<()>;

    /// Pushes any device-side caches to stable storage.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Capacity in bytes.
    fn capacity(&self) -> u64 {
        self.block_size() as u64 * self.block_count()
    }
}

/// Produces the device a transfer runs against.
///
/// The orchestrator opens the device itself so that open failures are
/// classified the same way as failures later in the pass.
pub trait DeviceOpener {
    fn open_device(&self) -> io::Result<Arc<dyn BlockDevice>>;
}

impl<D: BlockDevice + 'static> DeviceOpener for Arc<D> {
    fn open_device(&self) -> io::Result<Arc<dyn BlockDevice>> {
        let device: Arc<dyn BlockDevice> = self.clone();
        Ok(device)
    }
}

impl DeviceOpener for Arc<dyn BlockDevice> {
    fn open_device(&self) -> io::Result<Arc<dyn BlockDevice>> {
        Ok(Arc::clone(self))
    }
}

/// A device node or image file to be opened as a [`FileBlockDevice`].
#[derive(Clone, Debug)]
pub struct DevicePath {
    pub path: PathBuf,
    /// Block size to use for plain files. Device nodes report their own.
    pub block_size: Option<usize>,
}

impl DevicePath {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_size: None,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }
}

impl DeviceOpener for DevicePath {
    fn open_device(&self) -> io::Result<Arc<dyn BlockDevice>> {
        let device = FileBlockDevice::open(&self.path, self.block_size)?;
        Ok(Arc::new(device))
    }
}

/// Bytes in a stream slot of `blocks` blocks, if it is addressable.
pub(crate) fn slot_len(blocks: u64, block_size: usize) -> io::Result<usize> {
    usize::try_from(blocks)
        .ok()
        .and_then(|blocks| blocks.checked_mul(block_size))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("a slot of {blocks} blocks of {block_size} bytes is too large"),
            )
        })
}

/// Checks that `buf` spans whole blocks of `block_size`.
pub(crate) fn check_block_aligned(buf_len: usize, block_size: usize) -> io::Result<()> {
    if buf_len % block_size != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {buf_len} bytes is not a multiple of the {block_size}-byte block size"),
        ));
    }
    Ok(())
}

/// Checks that `blocks` blocks starting at `first_block` fit on the device.
pub(crate) fn check_block_range(first_block: u64, blocks: u64, block_count: u64) -> io::Result<()> {
    match first_block.checked_add(blocks) {
        Some(end) if end <= block_count => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("blocks {first_block}..+{blocks} are outside a device of {block_count} blocks"),
        )),
    }
}
