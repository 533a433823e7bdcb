//! A byte-oriented, seekable input over a block device with read-ahead.
//!
//! The stream keeps a ring of up to `prefetch_buffers` slots, each covering
//! `buffer_blocks` device blocks. Slots form one contiguous window of the
//! device, fetched in increasing block order by the stream's I/O worker
//! while the caller consumes earlier slots. Consumed slots stay in the ring
//! until their room is needed, so short rewinds are served from memory.
//!
//! Seeking is free: the cursor just moves, and the next read re-centres the
//! window if the cursor left it. A [`mark`](ReadAheadStream::mark) widens the
//! ring to twice its size so the bytes between mark and cursor are kept
//! around; [`reset`](ReadAheadStream::reset) always returns the exact bytes,
//! re-fetching them if the ring had to let them go.
use crate::device::{BlockDevice, slot_len};
use crate::error::StreamError;
use crate::watchdog::{Watchdog, wait_for};
use crate::worker::{IoWorker, WorkerThread};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender};
use tracing::{debug, error};

/// Result of a [`ReadAheadStream::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied. Short only when the read hit the end of
    /// the device.
    Data(usize),
    /// The cursor was already at the end of the device.
    EndOfDevice,
}

struct FetchJob {
    first_block: u64,
    buffer: Vec<u8>,
    done: SyncSender<Fetched>,
}

struct Fetched {
    buffer: Vec<u8>,
    result: io::Result<()>,
}

enum SlotState {
    Pending(Receiver<Fetched>),
    Ready(Vec<u8>),
}

struct Slot {
    first_block: u64,
    blocks: u64,
    state: SlotState,
}

impl Slot {
    fn end_block(&self) -> u64 {
        self.first_block + self.blocks
    }

    fn contains(&self, block: u64) -> bool {
        (self.first_block..self.end_block()).contains(&block)
    }
}

pub struct ReadAheadStream {
    block_size: u64,
    block_count: u64,
    buffer_blocks: u64,
    prefetch_buffers: usize,
    position: u64,
    mark: Option<u64>,
    ring: VecDeque<Slot>,
    /// First block not covered by the window.
    next_block: u64,
    spare: Vec<Vec<u8>>,
    worker: IoWorker<FetchJob>,
    watchdog: Option<Watchdog>,
    poisoned: bool,
    closed: bool,
}

impl ReadAheadStream {
    /// Opens a stream at byte 0 of `device`.
    ///
    /// At most `prefetch_buffers` fetches of `buffer_blocks` blocks each are
    /// outstanding at any time. Waits inside the stream fail once `watchdog`
    /// expires; the worker bumps it after every completed fetch.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        buffer_blocks: u64,
        prefetch_buffers: usize,
        watchdog: Option<Watchdog>,
    ) -> io::Result<Self> {
        if buffer_blocks == 0 || prefetch_buffers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer_blocks and prefetch_buffers must be greater than zero",
            ));
        }
        slot_len(buffer_blocks, device.block_size())?;

        let worker_device = device.clone();
        let worker_watchdog = watchdog.clone();
        let worker = IoWorker::spawn("burnr-prefetch", prefetch_buffers * 2, move |job: FetchJob, cancelled| {
            let FetchJob {
                first_block,
                mut buffer,
                done,
            } = job;
            let result = if cancelled {
                Err(io::Error::new(io::ErrorKind::Interrupted, "fetch cancelled"))
            } else {
                worker_device.read_blocks(first_block, &mut buffer)
            };
            if let Some(watchdog) = &worker_watchdog {
                if result.is_ok() {
                    watchdog.bump();
                }
            }
            // The stream may have given up on this slot already.
            let _ = done.send(Fetched { buffer, result });
        })?;

        Ok(Self {
            block_size: device.block_size() as u64,
            block_count: device.block_count(),
            buffer_blocks,
            prefetch_buffers,
            position: 0,
            mark: None,
            ring: VecDeque::with_capacity(prefetch_buffers * 2),
            next_block: 0,
            spare: Vec::new(),
            worker,
            watchdog,
            poisoned: false,
            closed: false,
        })
    }

    /// Size of the device in bytes; the cursor never goes past it.
    pub fn capacity(&self) -> u64 {
        self.block_size * self.block_count
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Copies bytes at the cursor into `buf` and advances the cursor.
    ///
    /// Fills `buf` completely unless the end of the device is reached
    /// first. Returns [`ReadOutcome::EndOfDevice`] only when the cursor
    /// already sits at the end of the device and `buf` is not empty.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, StreamError> {
        self.ensure_usable()?;
        if buf.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }
        if self.position >= self.capacity() {
            return Ok(ReadOutcome::EndOfDevice);
        }

        let mut copied = 0;
        while copied < buf.len() && self.position < self.capacity() {
            let index = self.ready_slot_for(self.position / self.block_size)?;
            let slot = &self.ring[index];
            let SlotState::Ready(data) = &slot.state else {
                unreachable!("ready_slot_for returned a pending slot");
            };
            let offset = (self.position - slot.first_block * self.block_size) as usize;
            let n = (data.len() - offset).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&data[offset..offset + n]);
            copied += n;
            self.position += n as u64;
        }

        if let Some(watchdog) = &self.watchdog {
            watchdog.bump();
        }
        Ok(ReadOutcome::Data(copied))
    }

    /// Reads one byte, or `None` at the end of the device.
    pub fn read_byte(&mut self) -> Result<Option<u8>, StreamError> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            ReadOutcome::Data(1) => Ok(Some(byte[0])),
            _ => Ok(None),
        }
    }

    /// Moves the cursor by `delta` bytes, clamped to `[0, capacity]`.
    /// Returns how far the cursor actually moved.
    pub fn skip(&mut self, delta: i64) -> i64 {
        let target = (self.position as i128 + delta as i128).clamp(0, self.capacity() as i128) as u64;
        let moved = target as i128 - self.position as i128;
        self.position = target;
        moved as i64
    }

    /// Moves the cursor to `position`, clamped to the capacity.
    pub fn seek_to(&mut self, position: u64) -> u64 {
        self.position = position.min(self.capacity());
        self.position
    }

    /// Remembers the current cursor for a later [`reset`](Self::reset).
    /// Replaces any earlier mark.
    pub fn mark(&mut self) {
        self.mark = Some(self.position);
    }

    /// Returns the cursor to the mark and clears it.
    pub fn reset(&mut self) -> Result<u64, StreamError> {
        let mark = self.mark.take().ok_or(StreamError::NoMark)?;
        self.position = mark;
        Ok(mark)
    }

    /// Cancels outstanding fetches and releases the ring. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.worker.abort();
        self.ring.clear();
        self.spare.clear();
        debug!(position = self.position, "Read-ahead stream closed");
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

    fn ring_limit(&self) -> usize {
        if self.mark.is_some() {
            self.prefetch_buffers * 2
        } else {
            self.prefetch_buffers
        }
    }

    fn in_window(&self, block: u64) -> bool {
        self.ring
            .front()
            .is_some_and(|front| front.first_block <= block && block < self.next_block)
    }

    /// Returns the ring index of the slot holding `block`, fetched.
    fn ready_slot_for(&mut self, block: u64) -> Result<usize, StreamError> {
        if !self.in_window(block) {
            self.recentre(block);
        }
        self.top_up(block)?;

        let index = self
            .ring
            .iter()
            .position(|slot| slot.contains(block))
            .ok_or(StreamError::Closed)?;

        if let SlotState::Pending(_) = self.ring[index].state {
            let state = std::mem::replace(&mut self.ring[index].state, SlotState::Ready(Vec::new()));
            let SlotState::Pending(rx) = state else {
                unreachable!();
            };
            let first_block = self.ring[index].first_block;
            let data = self.await_fetch(first_block, &rx)?;
            self.ring[index].state = SlotState::Ready(data);
        }
        Ok(index)
    }

    fn await_fetch(&mut self, first_block: u64, rx: &Receiver<Fetched>) -> Result<Vec<u8>, StreamError> {
        let fetched = match wait_for(rx, self.watchdog.as_ref()) {
            Ok(fetched) => fetched,
            Err(err) => {
                error!(first_block, error = %err, "Waiting for prefetched blocks failed");
                self.poison();
                return Err(err);
            }
        };
        match fetched.result {
            Ok(()) => Ok(fetched.buffer),
            Err(source) => {
                error!(first_block, error = %source, "Block read failed");
                self.poison();
                Err(StreamError::Device {
                    block: first_block,
                    source,
                })
            }
        }
    }

    /// Drops the whole window and restarts it at `block`.
    fn recentre(&mut self, block: u64) {
        debug!(block, "Re-centring read-ahead window");
        while let Some(slot) = self.ring.pop_front() {
            self.recycle(slot);
        }
        self.next_block = block;
    }

    /// Keeps `prefetch_buffers` slots queued at or after `block`, evicting
    /// the oldest consumed slots when the ring is full.
    fn top_up(&mut self, block: u64) -> Result<(), StreamError> {
        while self.next_block < self.block_count {
            let ahead = self.ring.iter().filter(|slot| slot.end_block() > block).count();
            if ahead >= self.prefetch_buffers {
                break;
            }
            if self.ring.len() >= self.ring_limit() {
                match self.ring.front() {
                    Some(front) if front.end_block() <= block => {
                        if let Some(front) = self.ring.pop_front() {
                            self.recycle(front);
                        }
                    }
                    _ => break,
                }
            }
            self.submit_next()?;
        }
        Ok(())
    }

    fn submit_next(&mut self) -> Result<(), StreamError> {
        let first_block = self.next_block;
        let blocks = self.buffer_blocks.min(self.block_count - first_block);
        let mut buffer = self.spare.pop().unwrap_or_default();
        buffer.resize((blocks * self.block_size) as usize, 0);

        let (done, rx) = mpsc::sync_channel(1);
        if let Err(err) = self.worker.submit(FetchJob {
            first_block,
            buffer,
            done,
        }) {
            self.poison();
            return Err(err);
        }
        self.ring.push_back(Slot {
            first_block,
            blocks,
            state: SlotState::Pending(rx),
        });
        self.next_block += blocks;
        Ok(())
    }

    /// Returns a slot's buffer to the spare pool, waiting out its fetch if
    /// needed. Errors from fetches nobody will consume are ignored.
    fn recycle(&mut self, slot: Slot) {
        match slot.state {
            SlotState::Ready(buffer) => self.spare.push(buffer),
            SlotState::Pending(rx) => {
                if let Ok(fetched) = wait_for(&rx, self.watchdog.as_ref()) {
                    self.spare.push(fetched.buffer);
                }
            }
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.worker.abort();
        self.ring.clear();
    }
}

impl Drop for ReadAheadStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for ReadAheadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match ReadAheadStream::read(self, buf)? {
            ReadOutcome::Data(n) => Ok(n),
            ReadOutcome::EndOfDevice => Ok(0),
        }
    }
}

impl io::Seek for ReadAheadStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => offset as i128,
            io::SeekFrom::End(delta) => self.capacity() as i128 + delta as i128,
            io::SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the device",
            ));
        }
        Ok(self.seek_to(u64::try_from(target).unwrap_or(u64::MAX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;

    fn growing_device(blocks: u64, block_size: usize) -> Arc<MemoryBlockDevice> {
        let device = MemoryBlockDevice::new(blocks, block_size);
        device.fill_with(|i| (i % 0xFF) as u8);
        Arc::new(device)
    }

    #[test]
    fn empty_buffer_reads_nothing_even_at_the_end() {
        let device = growing_device(4, 512);
        let mut stream = ReadAheadStream::new(device, 2, 2, None).unwrap();
        stream.seek_to(u64::MAX);
        assert_eq!(stream.read(&mut []).unwrap(), ReadOutcome::Data(0));
        assert_eq!(stream.read(&mut [0u8; 4]).unwrap(), ReadOutcome::EndOfDevice);
    }

    #[test]
    fn zero_sized_rings_are_rejected() {
        let device = growing_device(4, 512);
        assert!(ReadAheadStream::new(device.clone(), 0, 2, None).is_err());
        assert!(ReadAheadStream::new(device, 2, 0, None).is_err());
    }

    #[test]
    fn reset_without_mark_fails() {
        let device = growing_device(4, 512);
        let mut stream = ReadAheadStream::new(device, 2, 2, None).unwrap();
        assert!(matches!(stream.reset(), Err(StreamError::NoMark)));
    }

    #[test]
    fn closed_stream_refuses_reads() {
        let device = growing_device(4, 512);
        let mut stream = ReadAheadStream::new(device, 2, 2, None).unwrap();
        stream.close();
        stream.close();
        assert!(matches!(stream.read(&mut [0u8; 4]), Err(StreamError::Closed)));
    }

    #[test]
    fn short_rewind_is_served_from_the_ring() {
        let device = growing_device(64, 512);
        let mut stream = ReadAheadStream::new(device.clone(), 4, 2, None).unwrap();
        let mut buf = vec![0u8; 512 * 6];
        stream.read(&mut buf).unwrap();

        stream.skip(-(512 * 2));
        let mut again = vec![0u8; 512];
        stream.read(&mut again).unwrap();
        assert_eq!(again, buf[512 * 4..512 * 5]);

        let fetches_of_slot = device
            .journal()
            .iter()
            .filter(|(_, first_block, _)| *first_block == 4)
            .count();
        assert_eq!(fetches_of_slot, 1);
    }
}
