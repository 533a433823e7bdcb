//! The core, UI-agnostic library for the `burnr` flasher.
//!
//! `burnr-core` streams a disk image onto a block device and verifies it by
//! reading it back. It is meant to be driven by any front-end: the `burnr`
//! command-line tool, or anything else that can implement
//! [`transfer::TransferObserver`].
//!
//! The library is structured into these modules:
//! - [`device`]: the [`BlockDevice`](device::BlockDevice) contract, a
//!   file/device-node implementation and a RAM-backed one with fault
//!   injection.
//! - [`read_ahead`] and [`write_behind`]: byte-oriented streams over a block
//!   device that keep a bounded number of block buffers in flight on a
//!   background worker.
//! - [`watchdog`]: fails a pass that stops making progress.
//! - [`transfer`]: the write-then-verify driver with resumable offsets.
//! - [`source`]: image sources, including on-the-fly decompression.
//! - [`progress`], [`config`] and [`error`]: supporting types.
//!
//! ## Example: flashing an in-memory image onto a simulated device
//!
//! ```rust
//! use burnr_core::config::TransferConfig;
//! use burnr_core::device::MemoryBlockDevice;
//! use burnr_core::source::MemoryImage;
//! use burnr_core::transfer::{TransferControl, TransferOrchestrator};
//! use std::sync::Arc;
//!
//! let device = Arc::new(MemoryBlockDevice::new(64, 512));
//! let image = MemoryImage::new(vec![0x5A; 10_000]);
//!
//! let config = TransferConfig::default().with_buffer_blocks(8);
//! let orchestrator = TransferOrchestrator::new(config, TransferControl::new());
//! let report = orchestrator
//!     .start_write(&image, &device, 0, false, &())
//!     .expect("transfer failed");
//!
//! assert_eq!(report.verified_bytes, 10_000);
//! assert_eq!(&device.contents()[..10_000], image.bytes());
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod progress;
pub mod read_ahead;
pub mod source;
pub mod transfer;
pub mod watchdog;
pub mod write_behind;
mod worker;
