//! A RAM-backed [`BlockDevice`] with fault injection.
//!
//! Used by the test suites and handy for dry runs: it can be told to fail
//! every request from a given block onwards (a device unplugged mid-transfer)
//! or to stall on a given block (a wedged device), and it keeps a journal of
//! the requests it served.
use super::{BlockDevice, check_block_aligned, check_block_range};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Kind of request recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

#[derive(Default)]
struct Faults {
    fail_from_block: Option<(u64, String)>,
    stall_at_block: Option<(u64, Duration)>,
}

pub struct MemoryBlockDevice {
    block_size: usize,
    block_count: u64,
    data: Mutex<Vec<u8>>,
    faults: Mutex<Faults>,
    journal: Mutex<Vec<(IoOp, u64, u64)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBlockDevice {
    /// Creates a zero-filled device of `block_count` blocks.
    pub fn new(block_count: u64, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be greater than zero");
        Self::from_parts(vec![0u8; block_count as usize * block_size], block_size, block_count)
    }

    /// Creates a device holding `contents`. Trailing bytes that do not fill a
    /// whole block are dropped.
    pub fn with_contents(mut contents: Vec<u8>, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be greater than zero");
        let block_count = (contents.len() / block_size) as u64;
        contents.truncate(block_count as usize * block_size);
        Self::from_parts(contents, block_size, block_count)
    }

    fn from_parts(data: Vec<u8>, block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            data: Mutex::new(data),
            faults: Mutex::new(Faults::default()),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Fills every byte with `pattern(byte offset)`.
    pub fn fill_with(&self, pattern: impl Fn(usize) -> u8) {
        for (i, byte) in lock(&self.data).iter_mut().enumerate() {
            *byte = pattern(i);
        }
    }

    /// A snapshot of the whole device.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }

    /// Makes every request touching `block` or any later block fail with an
    /// I/O error carrying `message`.
    pub fn fail_from_block(&self, block: u64, message: impl Into<String>) {
        lock(&self.faults).fail_from_block = Some((block, message.into()));
    }

    /// Makes requests covering `block` sleep for `delay` before being served.
    pub fn stall_at_block(&self, block: u64, delay: Duration) {
        lock(&self.faults).stall_at_block = Some((block, delay));
    }

    pub fn clear_faults(&self) {
        *lock(&self.faults) = Faults::default();
    }

    /// Requests served so far as `(op, first block, block count)`, in the
    /// order the device received them.
    pub fn journal(&self) -> Vec<(IoOp, u64, u64)> {
        lock(&self.journal).clone()
    }

    pub fn clear_journal(&self) {
        lock(&self.journal).clear();
    }

    fn admit(&self, op: IoOp, first_block: u64, buf_len: usize) -> io::Result<std::ops::Range<usize>> {
        check_block_aligned(buf_len, self.block_size)?;
        let blocks = (buf_len / self.block_size) as u64;
        check_block_range(first_block, blocks, self.block_count)?;
        let last_block = first_block + blocks;

        let stall = {
            let faults = lock(&self.faults);
            if let Some((from, message)) = &faults.fail_from_block {
                if last_block > *from {
                    return Err(io::Error::other(message.clone()));
                }
            }
            faults
                .stall_at_block
                .filter(|(block, _)| (first_block..last_block).contains(block))
                .map(|(_, delay)| delay)
        };
        if let Some(delay) = stall {
            thread::sleep(delay);
        }

        lock(&self.journal).push((op, first_block, blocks));
        let start = first_block as usize * self.block_size;
        Ok(start..start + buf_len)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, first_block: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = self.admit(IoOp::Read, first_block, buf.len())?;
        buf.copy_from_slice(&lock(&self.data)[range]);
        Ok(())
    }

    fn write_blocks(&self, first_block: u64, buf: &[u8]) -> io::Result<()> {
        let range = self.admit(IoOp::Write, first_block, buf.len())?;
        lock(&self.data)[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_from_the_configured_block_onwards() {
        let device = MemoryBlockDevice::new(8, 512);
        device.fail_from_block(4, "unplugged");

        let mut buf = vec![0u8; 512 * 2];
        assert!(device.read_blocks(0, &mut buf).is_ok());
        let err = device.read_blocks(3, &mut buf).unwrap_err();
        assert!(err.to_string().contains("unplugged"));
        assert!(device.write_blocks(6, &buf).is_err());

        device.clear_faults();
        assert!(device.write_blocks(6, &buf).is_ok());
    }

    #[test]
    fn journal_records_served_requests() {
        let device = MemoryBlockDevice::new(4, 512);
        let buf = vec![1u8; 512];
        device.write_blocks(1, &buf).unwrap();
        device.write_blocks(2, &buf).unwrap();
        assert_eq!(
            device.journal(),
            vec![(IoOp::Write, 1, 1), (IoOp::Write, 2, 1)]
        );
        assert_eq!(&device.contents()[512..1536], &vec![1u8; 1024][..]);
    }

    #[test]
    fn with_contents_truncates_to_whole_blocks() {
        let device = MemoryBlockDevice::with_contents(vec![7u8; 1000], 512);
        assert_eq!(device.block_count(), 1);
        assert_eq!(device.contents().len(), 512);
    }
}
