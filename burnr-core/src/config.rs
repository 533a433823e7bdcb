//! Transfer tuning: buffer geometry, queue depth and timeouts.
use crate::device::slot_len;
use std::io;
use std::time::Duration;

/// Largest accepted `buffer_blocks`.
pub const MAX_BUFFER_BLOCKS: u64 = 64 * 1024;
/// Largest accepted `queue_size`.
pub const MAX_QUEUE_SIZE: usize = 64;
/// Largest accepted `verify_chunk`, in bytes.
pub const MAX_VERIFY_CHUNK: usize = 64 * 1024 * 1024;

/// Tuning knobs for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Device blocks read from the source per write-pass chunk. Each stream
    /// slot covers `buffer_blocks / queue_size` blocks, and a resumed write
    /// steps back `2 * buffer_blocks` blocks.
    pub buffer_blocks: u64,
    /// Write queue depth and read prefetch depth.
    pub queue_size: usize,
    /// Longest stretch without progress before a pass is failed.
    pub io_timeout: Duration,
    /// Minimum spacing between progress updates.
    pub progress_interval: Duration,
    /// Bytes compared per step of the verify pass.
    pub verify_chunk: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_blocks: 4096,
            queue_size: 2,
            io_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_secs(1),
            verify_chunk: 64 * 1024,
        }
    }
}

impl TransferConfig {
    pub fn with_buffer_blocks(mut self, buffer_blocks: u64) -> Self {
        self.buffer_blocks = buffer_blocks;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn with_progress_interval(mut self, progress_interval: Duration) -> Self {
        self.progress_interval = progress_interval;
        self
    }

    pub fn with_verify_chunk(mut self, verify_chunk: usize) -> Self {
        self.verify_chunk = verify_chunk;
        self
    }

    /// Blocks covered by one stream slot.
    pub fn slot_blocks(&self) -> u64 {
        (self.buffer_blocks / self.queue_size.max(1) as u64).max(1)
    }

    pub fn validate(&self) -> io::Result<()> {
        let invalid = |what: &str| {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{what} must be greater than zero"),
            ))
        };
        if self.buffer_blocks == 0 {
            return invalid("buffer_blocks");
        }
        if self.queue_size == 0 {
            return invalid("queue_size");
        }
        if self.io_timeout.is_zero() {
            return invalid("io_timeout");
        }
        if self.verify_chunk == 0 {
            return invalid("verify_chunk");
        }

        let too_large = |what: &str, max: u64| {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{what} must be at most {max}"),
            ))
        };
        if self.buffer_blocks > MAX_BUFFER_BLOCKS {
            return too_large("buffer_blocks", MAX_BUFFER_BLOCKS);
        }
        if self.queue_size > MAX_QUEUE_SIZE {
            return too_large("queue_size", MAX_QUEUE_SIZE as u64);
        }
        if self.verify_chunk > MAX_VERIFY_CHUNK {
            return too_large("verify_chunk", MAX_VERIFY_CHUNK as u64);
        }
        Ok(())
    }

    /// Bytes of source read per write-pass chunk on a device with
    /// `block_size`-byte blocks.
    pub fn chunk_len(&self, block_size: usize) -> io::Result<usize> {
        slot_len(self.buffer_blocks, block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TransferConfig::default();
        config.validate().unwrap();
        assert_eq!(config.slot_blocks(), 2048);
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(TransferConfig::default().with_buffer_blocks(0).validate().is_err());
        assert!(TransferConfig::default().with_queue_size(0).validate().is_err());
        assert!(TransferConfig::default().with_io_timeout(Duration::ZERO).validate().is_err());
        assert!(TransferConfig::default().with_verify_chunk(0).validate().is_err());
    }

    #[test]
    fn oversized_values_are_rejected() {
        let config = TransferConfig::default().with_buffer_blocks(MAX_BUFFER_BLOCKS);
        config.validate().unwrap();
        assert!(config.with_buffer_blocks(u64::MAX).validate().is_err());
        assert!(TransferConfig::default().with_queue_size(MAX_QUEUE_SIZE + 1).validate().is_err());
        assert!(
            TransferConfig::default()
                .with_verify_chunk(MAX_VERIFY_CHUNK + 1)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn chunk_len_refuses_to_overflow() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_len(512).unwrap(), 4096 * 512);
        assert!(config.with_buffer_blocks(u64::MAX).chunk_len(4096).is_err());
    }

    #[test]
    fn slot_never_shrinks_to_nothing() {
        let config = TransferConfig::default().with_buffer_blocks(1).with_queue_size(4);
        assert_eq!(config.slot_blocks(), 1);
    }
}
