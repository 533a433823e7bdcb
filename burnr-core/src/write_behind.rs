//! A byte-oriented output over a block device with write-behind.
//!
//! Bytes are gathered into slots of `buffer_blocks` blocks. A full slot is
//! handed to the stream's I/O worker and the caller goes on filling the
//! next one; at most `queue_size` slots exist at once, counting the one
//! being filled, so `write` blocks once every other slot is still draining.
//!
//! A slot may start or end in the middle of a block (after a `flush` or a
//! `seek` to an unaligned position). The worker then reads the edge blocks
//! back and merges them before writing, so bytes outside the slot survive.
use crate::device::{BlockDevice, slot_len};
use crate::error::StreamError;
use crate::watchdog::{Watchdog, wait_for};
use crate::worker::{IoWorker, WorkerThread};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender};
use tracing::{debug, error, warn};

struct DrainJob {
    first_block: u64,
    /// Offset of the first payload byte inside the first block.
    head: usize,
    /// Payload length in bytes.
    len: usize,
    buffer: Vec<u8>,
    done: SyncSender<Drained>,
}

struct Drained {
    buffer: Vec<u8>,
    result: io::Result<()>,
}

enum WriterJob {
    Drain(DrainJob),
    Sync(SyncSender<io::Result<()>>),
}

struct Filling {
    first_block: u64,
    head: usize,
    len: usize,
    buffer: Vec<u8>,
}

impl Filling {
    fn room(&self) -> usize {
        self.buffer.len() - self.head - self.len
    }
}

struct InFlight {
    first_block: u64,
    end_offset: u64,
    done: Receiver<Drained>,
}

pub struct WriteBehindStream {
    block_size: u64,
    block_count: u64,
    buffer_blocks: u64,
    queue_size: usize,
    position: u64,
    confirmed: u64,
    filling: Option<Filling>,
    in_flight: VecDeque<InFlight>,
    spare: Vec<Vec<u8>>,
    worker: IoWorker<WriterJob>,
    watchdog: Option<Watchdog>,
    poisoned: bool,
    closed: bool,
}

/// Writes the payload bytes of `job` to the device, merging the parts of
/// the edge blocks that lie outside the payload.
fn drain(device: &dyn BlockDevice, job: &mut DrainJob, watchdog: Option<&Watchdog>) -> io::Result<()> {
    let bs = device.block_size();
    let end = job.head + job.len;
    let blocks = end.div_ceil(bs);
    let tail = end % bs;

    if job.head > 0 || tail != 0 {
        let mut edge = vec![0u8; bs];
        if job.head > 0 {
            device.read_blocks(job.first_block, &mut edge)?;
            job.buffer[..job.head].copy_from_slice(&edge[..job.head]);
            if blocks == 1 && tail != 0 {
                job.buffer[tail..bs].copy_from_slice(&edge[tail..]);
            }
        }
        if tail != 0 && !(blocks == 1 && job.head > 0) {
            let last = job.first_block + blocks as u64 - 1;
            device.read_blocks(last, &mut edge)?;
            let start = (blocks - 1) * bs;
            job.buffer[start + tail..start + bs].copy_from_slice(&edge[tail..]);
        }
        if let Some(watchdog) = watchdog {
            watchdog.bump();
        }
    }

    device.write_blocks(job.first_block, &job.buffer[..blocks * bs])
}

impl WriteBehindStream {
    /// Opens a stream at byte 0 of `device`.
    ///
    /// Waits inside the stream fail once `watchdog` expires; the worker
    /// bumps it after every completed device request.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        buffer_blocks: u64,
        queue_size: usize,
        watchdog: Option<Watchdog>,
    ) -> io::Result<Self> {
        if buffer_blocks == 0 || queue_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer_blocks and queue_size must be greater than zero",
            ));
        }
        slot_len(buffer_blocks, device.block_size())?;

        let worker_device = device.clone();
        let worker_watchdog = watchdog.clone();
        let worker = IoWorker::spawn("burnr-drain", queue_size + 1, move |job: WriterJob, cancelled| {
            match job {
                WriterJob::Drain(mut job) => {
                    let result = if cancelled {
                        Err(io::Error::new(io::ErrorKind::Interrupted, "drain cancelled"))
                    } else {
                        drain(worker_device.as_ref(), &mut job, worker_watchdog.as_ref())
                    };
                    if result.is_ok() {
                        if let Some(watchdog) = &worker_watchdog {
                            watchdog.bump();
                        }
                    }
                    let _ = job.done.send(Drained {
                        buffer: job.buffer,
                        result,
                    });
                }
                WriterJob::Sync(done) => {
                    let result = if cancelled {
                        Err(io::Error::new(io::ErrorKind::Interrupted, "sync cancelled"))
                    } else {
                        worker_device.flush()
                    };
                    let _ = done.send(result);
                }
            }
        })?;

        Ok(Self {
            block_size: device.block_size() as u64,
            block_count: device.block_count(),
            buffer_blocks,
            queue_size,
            position: 0,
            confirmed: 0,
            filling: None,
            in_flight: VecDeque::with_capacity(queue_size),
            spare: Vec::new(),
            worker,
            watchdog,
            poisoned: false,
            closed: false,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.block_size * self.block_count
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Byte offset the next `write` lands at.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// End offset of the most recent slot the device acknowledged, or the
    /// last seek target if nothing was acknowledged since.
    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    /// Buffers `data` for writing at the cursor.
    ///
    /// Fails with [`StreamError::NoSpace`] if `data` reaches past the end of
    /// the device. The bytes that still fit are buffered first, so the
    /// cursor stops exactly at the capacity.
    pub fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.ensure_usable()?;
        let capacity = self.capacity();
        let fits = (capacity - self.position).min(data.len() as u64) as usize;

        let mut rest = &data[..fits];
        while !rest.is_empty() {
            let slot = match self.filling.take() {
                Some(slot) => slot,
                None => self.acquire_slot()?,
            };
            let slot = self.filling.insert(slot);
            let n = slot.room().min(rest.len());
            let start = slot.head + slot.len;
            slot.buffer[start..start + n].copy_from_slice(&rest[..n]);
            slot.len += n;
            let full = slot.room() == 0;

            self.position += n as u64;
            rest = &rest[n..];
            if full {
                self.submit_filling()?;
            }
        }

        if let Some(watchdog) = &self.watchdog {
            watchdog.bump();
        }
        if fits < data.len() {
            warn!(offset = capacity, "Write reaches past the end of the device");
            return Err(StreamError::NoSpace { offset: capacity });
        }
        Ok(())
    }

    /// Queues the partially filled slot, waits for every outstanding write
    /// and asks the device to persist them.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.ensure_usable()?;
        self.submit_filling()?;
        while !self.in_flight.is_empty() {
            self.reap_oldest()?;
        }

        let (done, rx) = mpsc::sync_channel(1);
        if let Err(err) = self.worker.submit(WriterJob::Sync(done)) {
            self.poison();
            return Err(err);
        }
        let result = match wait_for(&rx, self.watchdog.as_ref()) {
            Ok(result) => result,
            Err(err) => {
                self.poison();
                return Err(err);
            }
        };
        if let Err(source) = result {
            error!(error = %source, "Device flush failed");
            self.poison();
            return Err(StreamError::Device {
                block: self.position / self.block_size,
                source,
            });
        }

        if let Some(watchdog) = &self.watchdog {
            watchdog.bump();
        }
        debug!(position = self.position, "Write-behind stream flushed");
        Ok(())
    }

    /// Moves the cursor to `position` for the following writes. Buffered
    /// bytes are queued first.
    pub fn seek(&mut self, position: u64) -> Result<u64, StreamError> {
        self.ensure_usable()?;
        let capacity = self.capacity();
        if position > capacity {
            return Err(StreamError::InvalidSeek { position, capacity });
        }
        self.submit_filling()?;
        self.position = position;
        self.confirmed = position;
        Ok(position)
    }

    /// Flushes and releases the stream. Idempotent; after a failure the
    /// stream is released without flushing.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        let result = if self.poisoned { Ok(()) } else { self.flush() };
        self.closed = true;
        if result.is_ok() && !self.poisoned {
            self.worker.shutdown();
        } else {
            self.worker.abort();
        }
        self.release();
        debug!(position = self.position, "Write-behind stream closed");
        result
    }

    /// Drops buffered data and cancels outstanding writes without waiting
    /// for the device.
    pub fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.worker.abort();
        self.release();
        debug!(position = self.position, "Write-behind stream aborted");
    }

    /// The I/O thread of a closed or aborted stream, if it was not joined.
    pub(crate) fn take_worker_thread(&mut self) -> Option<WorkerThread> {
        self.worker.take_thread()
    }

    fn ensure_usable(&self) -> Result<(), StreamError> {
        if self.closed {
            Err(StreamError::Closed)
        } else if self.poisoned {
            Err(StreamError::Aborted)
        } else {
            Ok(())
        }
    }

    fn acquire_slot(&mut self) -> Result<Filling, StreamError> {
        while self.in_flight.len() >= self.queue_size {
            self.reap_oldest()?;
        }
        let first_block = self.position / self.block_size;
        let head = (self.position % self.block_size) as usize;
        let blocks = self.buffer_blocks.min(self.block_count - first_block);
        let mut buffer = self.spare.pop().unwrap_or_default();
        buffer.resize((blocks * self.block_size) as usize, 0);
        Ok(Filling {
            first_block,
            head,
            len: 0,
            buffer,
        })
    }

    fn submit_filling(&mut self) -> Result<(), StreamError> {
        let Some(slot) = self.filling.take() else {
            return Ok(());
        };
        if slot.len == 0 {
            self.spare.push(slot.buffer);
            return Ok(());
        }

        let end_offset = slot.first_block * self.block_size + (slot.head + slot.len) as u64;
        let (done, rx) = mpsc::sync_channel(1);
        let job = DrainJob {
            first_block: slot.first_block,
            head: slot.head,
            len: slot.len,
            buffer: slot.buffer,
            done,
        };
        if let Err(err) = self.worker.submit(WriterJob::Drain(job)) {
            self.poison();
            return Err(err);
        }
        self.in_flight.push_back(InFlight {
            first_block: slot.first_block,
            end_offset,
            done: rx,
        });
        Ok(())
    }

    fn reap_oldest(&mut self) -> Result<(), StreamError> {
        let Some(pending) = self.in_flight.pop_front() else {
            return Ok(());
        };
        let drained = match wait_for(&pending.done, self.watchdog.as_ref()) {
            Ok(drained) => drained,
            Err(err) => {
                error!(first_block = pending.first_block, error = %err, "Waiting for queued write failed");
                self.poison();
                return Err(err);
            }
        };
        match drained.result {
            Ok(()) => {
                self.confirmed = pending.end_offset;
                self.spare.push(drained.buffer);
                Ok(())
            }
            Err(source) => {
                error!(first_block = pending.first_block, error = %source, "Block write failed");
                self.poison();
                Err(StreamError::Device {
                    block: pending.first_block,
                    source,
                })
            }
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.worker.abort();
        self.release();
    }

    fn release(&mut self) {
        self.filling = None;
        self.in_flight.clear();
        self.spare.clear();
    }
}

impl Drop for WriteBehindStream {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "Write-behind stream dropped with unflushed data");
        }
    }
}

impl io::Write for WriteBehindStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let room = (self.capacity() - self.position).min(buf.len() as u64) as usize;
        if room == 0 {
            return Err(StreamError::NoSpace {
                offset: self.capacity(),
            }
            .into());
        }
        WriteBehindStream::write(self, &buf[..room])?;
        Ok(room)
    }

    fn flush(&mut self) -> io::Result<()> {
        WriteBehindStream::flush(self).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{IoOp, MemoryBlockDevice};

    #[test]
    fn unaligned_flush_keeps_the_rest_of_the_block() {
        let device = Arc::new(MemoryBlockDevice::new(4, 512));
        device.fill_with(|_| 0xAA);
        let mut stream = WriteBehindStream::new(device.clone(), 2, 2, None).unwrap();

        stream.write(&[1u8; 100]).unwrap();
        stream.flush().unwrap();

        let contents = device.contents();
        assert_eq!(&contents[..100], &[1u8; 100][..]);
        assert!(contents[100..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn writing_after_an_unaligned_flush_continues_in_the_same_block() {
        let device = Arc::new(MemoryBlockDevice::new(4, 512));
        let mut stream = WriteBehindStream::new(device.clone(), 2, 2, None).unwrap();

        stream.write(&[1u8; 300]).unwrap();
        stream.flush().unwrap();
        stream.write(&[2u8; 300]).unwrap();
        stream.close().unwrap();

        let contents = device.contents();
        assert_eq!(&contents[..300], &[1u8; 300][..]);
        assert_eq!(&contents[300..600], &[2u8; 300][..]);
        assert!(contents[600..].iter().all(|&b| b == 0));
    }

    #[test]
    fn full_device_write_stops_exactly_at_capacity() {
        let device = Arc::new(MemoryBlockDevice::new(4, 512));
        let mut stream = WriteBehindStream::new(device.clone(), 3, 2, None).unwrap();

        let err = stream.write(&[7u8; 2100]).unwrap_err();
        assert!(matches!(err, StreamError::NoSpace { offset: 2048 }));
        assert!(err.to_string().contains("No space left on device"));
        assert_eq!(stream.position(), 2048);
        stream.close().unwrap();
        assert!(device.contents().iter().all(|&b| b == 7));
    }

    #[test]
    fn seek_past_capacity_is_rejected() {
        let device = Arc::new(MemoryBlockDevice::new(4, 512));
        let mut stream = WriteBehindStream::new(device, 2, 2, None).unwrap();
        assert_eq!(stream.seek(2048).unwrap(), 2048);
        assert!(matches!(
            stream.seek(2049),
            Err(StreamError::InvalidSeek { position: 2049, capacity: 2048 })
        ));
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let device = Arc::new(MemoryBlockDevice::new(4, 512));
        let mut stream = WriteBehindStream::new(device.clone(), 2, 2, None).unwrap();
        stream.write(&[3u8; 1024]).unwrap();
        stream.close().unwrap();
        stream.close().unwrap();
        assert!(matches!(stream.write(&[0u8; 1]), Err(StreamError::Closed)));
        assert_eq!(device.journal(), vec![(IoOp::Write, 0, 2)]);
    }

    #[test]
    fn device_failure_poisons_the_stream() {
        let device = Arc::new(MemoryBlockDevice::new(16, 512));
        device.fail_from_block(4, "unplugged");
        let mut stream = WriteBehindStream::new(device, 2, 2, None).unwrap();

        let err = stream.write(&[0u8; 512 * 16]).unwrap_err();
        assert!(matches!(err, StreamError::Device { block: 4, .. }));
        assert_eq!(stream.confirmed(), 512 * 4);
        assert!(matches!(stream.write(&[0u8; 1]), Err(StreamError::Aborted)));
        stream.close().unwrap();
    }
}
