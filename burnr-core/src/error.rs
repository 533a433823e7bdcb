//! Error types for the streaming engine and the write/verify driver.
//!
//! Failures come in two layers. [`StreamError`] is raised by the buffered
//! streams and the watchdog; it describes what went wrong with the device
//! I/O itself. [`TransferError`] is the taxonomy seen by front-ends: every
//! stream failure during a pass is folded into
//! [`TransferError::Communication`], the only category a caller can recover
//! from by reconnecting the device and resuming.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`crate::read_ahead::ReadAheadStream`],
/// [`crate::write_behind::WriteBehindStream`] and the watchdog.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The block device failed a read or write request.
    #[error("block device I/O failed at block {block}: {source}")]
    Device {
        block: u64,
        #[source]
        source: io::Error,
    },

    /// A write targeted a block past the end of the device.
    #[error("No space left on device (offset {offset})")]
    NoSpace { offset: u64 },

    /// The watchdog was not bumped within its timeout window.
    #[error("device stalled: no progress for {0:?}")]
    Timeout(Duration),

    /// The stream was closed while an operation was waiting on it.
    #[error("stream closed")]
    Closed,

    /// The stream was poisoned by an earlier failure.
    #[error("stream aborted after a previous failure")]
    Aborted,

    /// A request from an earlier, cancelled pass is still inside the device.
    #[error("device still busy with a request from a cancelled pass")]
    Busy,

    #[error("cannot seek to byte {position}: device capacity is {capacity} bytes")]
    InvalidSeek { position: u64, capacity: u64 },

    #[error("reset called without a mark")]
    NoMark,
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::Device { source, .. } => source.kind(),
            StreamError::NoSpace { .. } => io::ErrorKind::StorageFull,
            StreamError::Timeout(_) => io::ErrorKind::TimedOut,
            StreamError::Closed | StreamError::Aborted => io::ErrorKind::BrokenPipe,
            StreamError::Busy => io::ErrorKind::ResourceBusy,
            StreamError::InvalidSeek { .. } | StreamError::NoMark => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}

/// The failure taxonomy reported to front-ends.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to initialize the target device: {0}")]
    Initialization(#[source] io::Error),

    #[error("target device not found: {0}")]
    MissingDevice(#[source] io::Error),

    #[error("failed to open the image: {0}")]
    OpenSource(#[source] io::Error),

    #[error("image is {image_size} bytes but the device only holds {device_size} bytes")]
    InsufficientSpace { image_size: u64, device_size: u64 },

    /// Device I/O failed or stalled. Reconnect and resume from the reported offset.
    #[error("communication with the device failed: {0}")]
    Communication(#[source] StreamError),

    #[error("verification failed: device content differs from the image at byte {offset}")]
    VerificationMismatch { offset: u64 },

    #[error("operation cancelled by user")]
    CancelledByUser,

    #[error("unexpected failure: {0}")]
    Unknown(#[source] anyhow::Error),
}

/// Flat, copyable mirror of [`TransferError`] for UI decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Initialization,
    MissingDevice,
    OpenSource,
    InsufficientSpace,
    Communication,
    VerificationMismatch,
    CancelledByUser,
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::Initialization => "initialization",
            FailureCategory::MissingDevice => "missing device",
            FailureCategory::OpenSource => "open source",
            FailureCategory::InsufficientSpace => "insufficient space",
            FailureCategory::Communication => "communication",
            FailureCategory::VerificationMismatch => "verification mismatch",
            FailureCategory::CancelledByUser => "cancelled by user",
            FailureCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl TransferError {
    pub fn category(&self) -> FailureCategory {
        match self {
            TransferError::Initialization(_) => FailureCategory::Initialization,
            TransferError::MissingDevice(_) => FailureCategory::MissingDevice,
            TransferError::OpenSource(_) => FailureCategory::OpenSource,
            TransferError::InsufficientSpace { .. } => FailureCategory::InsufficientSpace,
            TransferError::Communication(_) => FailureCategory::Communication,
            TransferError::VerificationMismatch { .. } => FailureCategory::VerificationMismatch,
            TransferError::CancelledByUser => FailureCategory::CancelledByUser,
            TransferError::Unknown(_) => FailureCategory::Unknown,
        }
    }

    /// Only communication failures can be retried by resuming the pass.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransferError::Communication(_))
    }

    /// Classifies an error raised by a stream during a pass.
    pub(crate) fn from_stream(err: StreamError, image_size: u64, device_size: u64) -> Self {
        match err {
            StreamError::NoSpace { .. } => TransferError::InsufficientSpace {
                image_size,
                device_size,
            },
            other => TransferError::Communication(other),
        }
    }

    /// Classifies a failure to open the target device.
    pub(crate) fn from_device_open(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            TransferError::MissingDevice(err)
        } else {
            TransferError::Initialization(err)
        }
    }
}

/// Where a failed transfer ended up in the pass state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The caller may reconnect the device and resume.
    Recoverable,
    Fatal,
}

/// A failed pass, carrying the byte offset it reached.
#[derive(Debug, Error)]
#[error("{error} (after {bytes_processed} of {total_bytes} bytes)")]
pub struct TransferFailure {
    #[source]
    pub error: TransferError,
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

impl TransferFailure {
    pub fn new(error: TransferError, bytes_processed: u64, total_bytes: u64) -> Self {
        Self {
            error,
            bytes_processed,
            total_bytes,
        }
    }

    pub fn category(&self) -> FailureCategory {
        self.error.category()
    }

    pub fn kind(&self) -> FailureKind {
        if self.error.is_recoverable() {
            FailureKind::Recoverable
        } else {
            FailureKind::Fatal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_communication_is_recoverable() {
        let comm = TransferError::Communication(StreamError::Timeout(Duration::from_secs(1)));
        assert!(comm.is_recoverable());
        assert_eq!(comm.category(), FailureCategory::Communication);

        let busy = TransferError::Communication(StreamError::Busy);
        assert!(busy.is_recoverable());
        let io_err: io::Error = StreamError::Busy.into();
        assert_eq!(io_err.kind(), io::ErrorKind::ResourceBusy);

        let mismatch = TransferError::VerificationMismatch { offset: 42 };
        assert!(!mismatch.is_recoverable());
        assert_eq!(
            TransferFailure::new(mismatch, 42, 100).kind(),
            FailureKind::Fatal
        );
    }

    #[test]
    fn no_space_maps_to_insufficient_space() {
        let err = TransferError::from_stream(StreamError::NoSpace { offset: 512 }, 1024, 512);
        assert_eq!(err.category(), FailureCategory::InsufficientSpace);

        let err = TransferError::from_stream(StreamError::Closed, 1024, 512);
        assert_eq!(err.category(), FailureCategory::Communication);
    }

    #[test]
    fn device_open_classification() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(
            TransferError::from_device_open(missing).category(),
            FailureCategory::MissingDevice
        );
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            TransferError::from_device_open(denied).category(),
            FailureCategory::Initialization
        );
    }

    #[test]
    fn no_space_message_is_stable() {
        let err = StreamError::NoSpace { offset: 10 };
        assert!(err.to_string().contains("No space left on device"));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::StorageFull);
    }
}
