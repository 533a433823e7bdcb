//! The write-then-verify driver.
//!
//! [`TransferOrchestrator::start_write`] runs the whole job: it opens the
//! device, checks that the image fits, writes the image from a resume
//! offset and verifies the complete image. Each pass runs under its own
//! watchdog, so a device that stops answering fails the pass with a
//! [`TransferError::Communication`] instead of hanging it.
//!
//! ```rust,no_run
//! use burnr_core::config::TransferConfig;
//! use burnr_core::device::DevicePath;
//! use burnr_core::source::FileImage;
//! use burnr_core::transfer::{TransferControl, TransferOrchestrator};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let control = TransferControl::new();
//! let image = FileImage::open(Path::new("disk.img.xz"), &control, |_| {})?;
//! let orchestrator = TransferOrchestrator::new(TransferConfig::default(), control);
//! let report = orchestrator.start_write(&image, &DevicePath::new("/dev/sdb"), 0, false, &())?;
//! println!("{} bytes verified", report.verified_bytes);
//! # Ok(())
//! # }
//! ```
use crate::config::TransferConfig;
use crate::device::{BlockDevice, DeviceOpener};
use crate::error::{FailureKind, StreamError, TransferError, TransferFailure};
use crate::progress::{Progress, ProgressMeter};
use crate::read_ahead::{ReadAheadStream, ReadOutcome};
use crate::source::ImageSource;
use crate::watchdog::{Watchdog, timeout_watchdog};
use crate::worker::WorkerThread;
use crate::write_behind::WriteBehindStream;
use anyhow::anyhow;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Flags a front-end flips from another thread to steer a running transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    aborted: Arc<AtomicBool>,
    skip_verification: Arc<AtomicBool>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the transfer at the next chunk with
    /// [`TransferError::CancelledByUser`].
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Ends the verify pass cleanly at the next chunk.
    pub fn cancel_verification(&self) {
        self.skip_verification.store(true, Ordering::SeqCst);
    }

    pub fn is_verification_cancelled(&self) -> bool {
        self.skip_verification.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Writing,
    Verifying,
    Done,
    Failed,
    /// Failed, but the caller may reconnect the device and resume.
    Recoverable,
}

/// Receives events from a running transfer. Every method defaults to a
/// no-op; `()` ignores everything.
pub trait TransferObserver {
    fn on_phase(&self, _phase: TransferPhase) {}

    /// Called at the start of each pass, then at most once per progress
    /// interval.
    fn on_progress(&self, _progress: &Progress) {}

    fn on_error(&self, _failure: &TransferFailure) {}

    fn on_finished(&self, _total_bytes: u64) {}

    /// Called before every chunk so the caller can keep the system awake.
    fn grab_resource(&self) {}
}

impl TransferObserver for () {}

/// How a verify pass ended, with the number of bytes compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Completed(u64),
    Cancelled(u64),
}

impl VerifyOutcome {
    pub fn verified_bytes(&self) -> u64 {
        match *self {
            VerifyOutcome::Completed(n) | VerifyOutcome::Cancelled(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub total_bytes: u64,
    /// Bytes written by this run; less than the total after a resume.
    pub written_bytes: u64,
    pub verified_bytes: u64,
    pub verification_skipped: bool,
}

/// Where a write resumed at `requested` actually restarts: the block
/// boundary at or below it, stepped back `2 * buffer_blocks` blocks to
/// rewrite data a previous attempt may not have committed.
pub fn resume_offset(requested: u64, block_size: usize, buffer_blocks: u64) -> u64 {
    let block_size = block_size as u64;
    let aligned = requested - requested % block_size;
    aligned.saturating_sub(block_size.saturating_mul(buffer_blocks).saturating_mul(2))
}

/// Reads until `buf` is full or the source ends. Returns the bytes read.
fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn source_read_failed(err: io::Error, offset: u64) -> TransferError {
    TransferError::Unknown(anyhow::Error::from(err).context(format!("reading the image at byte {offset}")))
}

/// Runs transfers against a device. Reuse one orchestrator for every pass
/// on the same device: it keeps track of I/O threads from failed passes that
/// are still inside a device request, and a new pass waits for them.
pub struct TransferOrchestrator {
    config: TransferConfig,
    control: TransferControl,
    lingering: Mutex<Vec<WorkerThread>>,
}

impl TransferOrchestrator {
    pub fn new(config: TransferConfig, control: TransferControl) -> Self {
        Self {
            config,
            control,
            lingering: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn control(&self) -> &TransferControl {
        &self.control
    }

    /// Writes `source` to the device from `resume_offset` (see
    /// [`resume_offset()`]) and verifies the whole image. With `verify_only`
    /// the write pass is skipped.
    ///
    /// Failures are reported to `observer` before being returned.
    pub fn start_write(
        &self,
        source: &dyn ImageSource,
        device: &dyn DeviceOpener,
        resume_offset: u64,
        verify_only: bool,
        observer: &dyn TransferObserver,
    ) -> Result<TransferReport, TransferFailure> {
        let result = self.run(source, device, resume_offset, verify_only, observer);
        if let Err(failure) = &result {
            let phase = match failure.kind() {
                FailureKind::Recoverable => {
                    warn!(
                        category = %failure.category(),
                        bytes_processed = failure.bytes_processed,
                        "Transfer interrupted; it can be resumed"
                    );
                    TransferPhase::Recoverable
                }
                FailureKind::Fatal => {
                    error!(
                        category = %failure.category(),
                        bytes_processed = failure.bytes_processed,
                        error = %failure.error,
                        "Transfer failed"
                    );
                    TransferPhase::Failed
                }
            };
            observer.on_error(failure);
            observer.on_phase(phase);
        }
        result
    }

    fn run(
        &self,
        source: &dyn ImageSource,
        opener: &dyn DeviceOpener,
        requested_offset: u64,
        verify_only: bool,
        observer: &dyn TransferObserver,
    ) -> Result<TransferReport, TransferFailure> {
        self.config.validate().map_err(|e| {
            TransferFailure::new(
                TransferError::Unknown(anyhow::Error::from(e).context("invalid transfer configuration")),
                0,
                0,
            )
        })?;

        let image_len = source
            .len()
            .map_err(|e| TransferFailure::new(TransferError::OpenSource(e), 0, 0))?;
        self.await_lingering()
            .map_err(|e| TransferFailure::new(TransferError::Communication(e), requested_offset, image_len))?;
        let device = opener.open_device().map_err(|e| {
            TransferFailure::new(TransferError::from_device_open(e), requested_offset, image_len)
        })?;

        let capacity = device.capacity();
        info!(
            block_size = device.block_size(),
            block_count = device.block_count(),
            capacity,
            image_len,
            "Target device ready"
        );
        if capacity < image_len {
            return Err(TransferFailure::new(
                TransferError::InsufficientSpace {
                    image_size: image_len,
                    device_size: capacity,
                },
                0,
                image_len,
            ));
        }

        let mut written_bytes = 0;
        if verify_only {
            info!("Skipping the write pass, verifying only");
        } else {
            let start = resume_offset(
                requested_offset.min(image_len),
                device.block_size(),
                self.config.buffer_blocks,
            );
            if requested_offset > 0 {
                info!(requested = requested_offset, start, "Resuming write");
            }
            observer.on_phase(TransferPhase::Writing);
            let mut reader = source
                .open()
                .map_err(|e| TransferFailure::new(TransferError::OpenSource(e), start, image_len))?;
            written_bytes = self.write_image(device.clone(), reader.as_mut(), image_len, start, observer)?;
        }

        observer.on_phase(TransferPhase::Verifying);
        let mut reader = source
            .open()
            .map_err(|e| TransferFailure::new(TransferError::OpenSource(e), 0, image_len))?;
        let outcome = self.verify_image(device, reader.as_mut(), image_len, observer)?;

        observer.on_phase(TransferPhase::Done);
        observer.on_finished(image_len);
        Ok(TransferReport {
            total_bytes: image_len,
            written_bytes,
            verified_bytes: outcome.verified_bytes(),
            verification_skipped: matches!(outcome, VerifyOutcome::Cancelled(_)),
        })
    }

    /// Streams `source` onto the device from byte `start_offset` up to
    /// `image_len`, then flushes and closes the write stream.
    ///
    /// `source` is positioned at byte 0; the first `start_offset` bytes are
    /// skipped. Returns the number of bytes written. On failure the
    /// reported offset is the end of the last write the device
    /// acknowledged.
    pub fn write_image(
        &self,
        device: Arc<dyn BlockDevice>,
        source: &mut dyn Read,
        image_len: u64,
        start_offset: u64,
        observer: &dyn TransferObserver,
    ) -> Result<u64, TransferFailure> {
        info!(start_offset, image_len, "Write pass started");
        let mut worker_thread = None;
        let result = timeout_watchdog(self.config.io_timeout, |watchdog| {
            let mut stream = WriteBehindStream::new(
                device.clone(),
                self.config.slot_blocks(),
                self.config.queue_size,
                Some(watchdog.clone()),
            )
            .map_err(|e| TransferFailure::new(TransferError::Initialization(e), start_offset, image_len))?;

            let outcome = match self.drive_write(&mut stream, source, image_len, start_offset, watchdog, observer) {
                Err(failure) => {
                    stream.abort();
                    Err(failure)
                }
                Ok(()) => match stream.close() {
                    Ok(()) => Ok(image_len - start_offset),
                    Err(err) => Err(TransferFailure::new(
                        TransferError::from_stream(err, image_len, device.capacity()),
                        stream.confirmed(),
                        image_len,
                    )),
                },
            };
            worker_thread = stream.take_worker_thread();
            outcome
        });
        self.settle(worker_thread);
        if result.is_ok() {
            info!(image_len, "Write pass finished");
        }
        result
    }

    fn drive_write(
        &self,
        stream: &mut WriteBehindStream,
        source: &mut dyn Read,
        image_len: u64,
        start_offset: u64,
        watchdog: &Watchdog,
        observer: &dyn TransferObserver,
    ) -> Result<(), TransferFailure> {
        let capacity = stream.capacity();
        let stream_failed = |stream: &WriteBehindStream, err: StreamError| {
            TransferFailure::new(
                TransferError::from_stream(err, image_len, capacity),
                stream.confirmed(),
                image_len,
            )
        };

        let skipped = io::copy(&mut Read::take(&mut *source, start_offset), &mut io::sink())
            .map_err(|e| TransferFailure::new(source_read_failed(e, 0), start_offset, image_len))?;
        if skipped < start_offset {
            return Err(TransferFailure::new(
                TransferError::Unknown(anyhow!(
                    "image ended at byte {skipped}, before the resume offset {start_offset}"
                )),
                skipped,
                image_len,
            ));
        }
        stream.seek(start_offset).map_err(|e| stream_failed(stream, e))?;

        let chunk_len = self
            .config
            .chunk_len(stream.block_size())
            .map_err(|e| TransferFailure::new(TransferError::Initialization(e), start_offset, image_len))?;
        let mut buffer = vec![0u8; chunk_len];
        let mut meter = ProgressMeter::new(self.config.progress_interval, image_len, false);
        observer.on_progress(&meter.start(start_offset));
        let mut offset = start_offset;

        while offset < image_len {
            if self.control.is_aborted() {
                info!(offset, "Write pass aborted by user");
                return Err(TransferFailure::new(
                    TransferError::CancelledByUser,
                    stream.confirmed(),
                    image_len,
                ));
            }
            observer.grab_resource();
            watchdog.bump();

            let want = (image_len - offset).min(chunk_len as u64) as usize;
            let read = match source.read(&mut buffer[..want]) {
                Ok(0) => {
                    warn!(offset, image_len, "Image ended before its reported length");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TransferFailure::new(
                        source_read_failed(e, offset),
                        stream.confirmed(),
                        image_len,
                    ));
                }
            };

            watchdog.check().map_err(|e| stream_failed(stream, e))?;
            watchdog.bump();
            stream.write(&buffer[..read]).map_err(|e| stream_failed(stream, e))?;
            watchdog.bump();

            offset += read as u64;
            if let Some(progress) = meter.record(read as u64, offset) {
                observer.on_progress(&progress);
            }
        }

        watchdog.bump();
        stream.flush().map_err(|e| stream_failed(stream, e))?;
        watchdog.bump();
        debug!(offset, "Write stream flushed");
        Ok(())
    }

    /// Compares the first `image_len` bytes of `source` with the device,
    /// always starting at byte 0.
    ///
    /// Stops at the first differing byte with
    /// [`TransferError::VerificationMismatch`]. A verification cancelled
    /// through [`TransferControl::cancel_verification`] ends without error.
    pub fn verify_image(
        &self,
        device: Arc<dyn BlockDevice>,
        source: &mut dyn Read,
        image_len: u64,
        observer: &dyn TransferObserver,
    ) -> Result<VerifyOutcome, TransferFailure> {
        info!(image_len, "Verify pass started");
        let block_size = device.block_size() as u64;
        let mut worker_thread = None;
        let result = timeout_watchdog(self.config.io_timeout, |watchdog| {
            let mut stream = ReadAheadStream::new(
                device,
                self.config.slot_blocks(),
                self.config.queue_size,
                Some(watchdog.clone()),
            )
            .map_err(|e| TransferFailure::new(TransferError::Initialization(e), 0, image_len))?;

            let outcome = self.drive_verify(&mut stream, source, image_len, block_size, watchdog, observer);
            stream.close();
            worker_thread = stream.take_worker_thread();
            outcome
        });
        self.settle(worker_thread);
        match &result {
            Ok(VerifyOutcome::Completed(n)) => info!(verified = n, "Verify pass finished"),
            Ok(VerifyOutcome::Cancelled(n)) => info!(verified = n, "Verification skipped by user"),
            Err(_) => {}
        }
        result
    }

    /// Waits up to the I/O timeout for a stream's thread to exit. A thread
    /// still stuck in the device is kept for the next pass to wait on.
    fn settle(&self, thread: Option<WorkerThread>) {
        let Some(thread) = thread else {
            return;
        };
        if let Err(thread) = thread.join_within(self.config.io_timeout) {
            warn!(worker = thread.name(), "I/O thread still inside a device request");
            self.lingering
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(thread);
        }
    }

    /// Waits for the threads of earlier failed passes, so none of their
    /// requests reaches the device during this pass.
    fn await_lingering(&self) -> Result<(), StreamError> {
        let mut lingering = self.lingering.lock().unwrap_or_else(PoisonError::into_inner);
        let mut still_busy = Vec::new();
        for thread in lingering.drain(..) {
            if let Err(thread) = thread.join_within(self.config.io_timeout) {
                still_busy.push(thread);
            }
        }
        if still_busy.is_empty() {
            return Ok(());
        }
        warn!(threads = still_busy.len(), "Device still busy with a cancelled pass");
        *lingering = still_busy;
        Err(StreamError::Busy)
    }

    fn drive_verify(
        &self,
        stream: &mut ReadAheadStream,
        source: &mut dyn Read,
        image_len: u64,
        block_size: u64,
        watchdog: &Watchdog,
        observer: &dyn TransferObserver,
    ) -> Result<VerifyOutcome, TransferFailure> {
        let chunk = self.config.verify_chunk;
        let mut expected = vec![0u8; chunk];
        let mut actual = vec![0u8; chunk];
        let mut meter = ProgressMeter::new(self.config.progress_interval, image_len, true);
        let mut offset = 0u64;

        observer.on_progress(&meter.start(0));
        watchdog.bump();

        while offset < image_len {
            if self.control.is_verification_cancelled() {
                return Ok(VerifyOutcome::Cancelled(offset));
            }
            if self.control.is_aborted() {
                return Err(TransferFailure::new(TransferError::CancelledByUser, offset, image_len));
            }
            observer.grab_resource();
            watchdog.bump();

            let want = (image_len - offset).min(chunk as u64) as usize;
            let read = read_full(source, &mut expected[..want])
                .map_err(|e| TransferFailure::new(source_read_failed(e, offset), offset, image_len))?;
            if read == 0 {
                warn!(offset, image_len, "Image ended before its reported length");
                break;
            }

            watchdog.bump();
            let communication = |err: StreamError| {
                TransferFailure::new(TransferError::Communication(err), offset, image_len)
            };
            match stream.read(&mut actual[..read]).map_err(communication)? {
                ReadOutcome::Data(n) if n == read => {}
                _ => {
                    return Err(communication(StreamError::Device {
                        block: (offset + read as u64) / block_size,
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "device ended before the image",
                        ),
                    }));
                }
            }
            watchdog.bump();

            if let Some(i) = expected[..read].iter().zip(&actual[..read]).position(|(a, b)| a != b) {
                let at = offset + i as u64;
                error!(offset = at, "Device content differs from the image");
                return Err(TransferFailure::new(
                    TransferError::VerificationMismatch { offset: at },
                    at,
                    image_len,
                ));
            }

            offset += read as u64;
            if let Some(progress) = meter.record(read as u64, offset) {
                observer.on_progress(&progress);
            }
            if read < want {
                warn!(offset, image_len, "Image ended before its reported length");
                break;
            }
        }

        Ok(VerifyOutcome::Completed(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_offset_rounds_down_and_steps_back() {
        // Two buffers of 4 blocks of 512 bytes.
        assert_eq!(resume_offset(10 * 4096 + 100, 512, 4), 10 * 4096 - 4096);
        assert_eq!(resume_offset(1000, 512, 4096), 0);
        assert_eq!(resume_offset(0, 512, 4096), 0);
    }

    #[test]
    fn resume_offset_saturates_huge_step_backs() {
        assert_eq!(resume_offset(u64::MAX - 7, 4096, u64::MAX), 0);
    }

    #[test]
    fn resume_offset_uses_the_device_block_size() {
        let bs = 666;
        let requested = 100 * bs as u64 + 5;
        assert_eq!(resume_offset(requested, bs, 8), (100 - 16) * bs as u64);
    }

    #[test]
    fn read_full_stops_at_the_end_of_the_source() {
        let mut source: &[u8] = &[1, 2, 3];
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut source, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn control_flags_are_shared_between_clones() {
        let control = TransferControl::new();
        let remote = control.clone();
        remote.cancel_verification();
        assert!(control.is_verification_cancelled());
        assert!(!control.is_aborted());
        remote.abort();
        assert!(control.is_aborted());
    }
}
