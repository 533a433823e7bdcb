mod logging;
mod terminal;

use anyhow::{Context, Result};
use burnr_core::config::TransferConfig;
use burnr_core::device::{DeviceOpener, DevicePath};
use burnr_core::error::{FailureKind, TransferError, TransferFailure};
use burnr_core::progress::Progress;
use burnr_core::source::{FileImage, ImageSource};
use burnr_core::transfer::{TransferControl, TransferObserver, TransferOrchestrator, TransferPhase};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "burnr")]
#[command(about = "Write disk images to block devices and verify them", version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

const DEFAULT_BUFFER_BLOCKS: u64 = 4096;
const DEFAULT_QUEUE_SIZE: usize = 2;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Args)]
struct TransferArgs {
    /// Image file to write (.gz, .xz and .zst are decompressed first)
    image: PathBuf,

    /// Target block device or image file
    device: PathBuf,

    /// Block size to use when the target is a plain file
    #[arg(long)]
    block_size: Option<usize>,

    /// Device blocks per write chunk
    #[arg(long, default_value_t = DEFAULT_BUFFER_BLOCKS)]
    buffer_blocks: u64,

    /// Buffers kept in flight per stream
    #[arg(long, default_value_t = DEFAULT_QUEUE_SIZE)]
    queue_size: usize,

    /// Seconds without device progress before giving up
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,
}

impl TransferArgs {
    fn config(&self) -> TransferConfig {
        TransferConfig::default()
            .with_buffer_blocks(self.buffer_blocks)
            .with_queue_size(self.queue_size)
            .with_io_timeout(Duration::from_secs(self.timeout))
    }

    fn device(&self) -> DevicePath {
        DevicePath {
            path: self.device.clone(),
            block_size: self.block_size,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device, then verify it
    Write {
        #[command(flatten)]
        args: TransferArgs,

        /// Resume an interrupted write from this byte offset
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Compare a device with an image without writing
    Verify {
        #[command(flatten)]
        args: TransferArgs,
    },
    /// Show the geometry of a device
    Info {
        device: PathBuf,

        /// Block size to use when the target is a plain file
        #[arg(long)]
        block_size: Option<usize>,
    },
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{msg}}, {{eta}})"
    );
    Ok(ProgressStyle::default_bar().template(&template)?.progress_chars("■ "))
}

/// Drives one progress bar from the transfer's events and tells the Ctrl-C
/// handler which pass is running.
struct CliObserver {
    bar: ProgressBar,
    write_style: ProgressStyle,
    verify_style: ProgressStyle,
    verifying: Arc<AtomicBool>,
}

impl CliObserver {
    fn new(verifying: Arc<AtomicBool>) -> Result<Self> {
        Ok(Self {
            bar: ProgressBar::new(0),
            write_style: bar_style("green")?,
            verify_style: bar_style("magenta")?,
            verifying,
        })
    }
}

impl TransferObserver for CliObserver {
    fn on_phase(&self, phase: TransferPhase) {
        match phase {
            TransferPhase::Writing => {
                self.bar.set_style(self.write_style.clone());
                self.bar.set_prefix("Writing");
            }
            TransferPhase::Verifying => {
                self.verifying.store(true, Ordering::SeqCst);
                self.bar.set_style(self.verify_style.clone());
                self.bar.set_prefix("Verifying");
                self.bar.set_position(0);
            }
            TransferPhase::Done => self.bar.finish_with_message("done"),
            TransferPhase::Failed | TransferPhase::Recoverable => self.bar.abandon(),
        }
    }

    fn on_progress(&self, progress: &Progress) {
        self.bar.set_length(progress.total_bytes);
        self.bar.set_position(progress.processed_bytes);
        self.bar.set_message(format!("{}/s", HumanBytes(progress.speed as u64)));
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmation)
}

fn is_compressed(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_lowercase().as_str(), "gz" | "gzip" | "xz" | "zst" | "zstd"))
}

fn open_image(path: &Path, control: &TransferControl) -> Result<FileImage> {
    let spinner = if is_compressed(path) {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {bytes} ({bytes_per_sec})")?,
        );
        spinner.set_prefix("Decompress");
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    } else {
        ProgressBar::hidden()
    };

    let image = FileImage::open(path, control, |bytes| spinner.set_position(bytes));
    match &image {
        Ok(_) => spinner.finish(),
        Err(_) => spinner.abandon(),
    }
    image.with_context(|| format!("failed to open image {}", path.display()))
}

/// The command line that repeats this transfer from `offset`, keeping the
/// tuning flags the user chose.
fn resume_command(args: &TransferArgs, offset: u64, verify_only: bool) -> String {
    let mut command = if verify_only {
        format!("burnr verify {} {}", args.image.display(), args.device.display())
    } else {
        format!(
            "burnr write {} {} --offset {offset}",
            args.image.display(),
            args.device.display()
        )
    };
    if let Some(block_size) = args.block_size {
        command.push_str(&format!(" --block-size {block_size}"));
    }
    if args.buffer_blocks != DEFAULT_BUFFER_BLOCKS {
        command.push_str(&format!(" --buffer-blocks {}", args.buffer_blocks));
    }
    if args.queue_size != DEFAULT_QUEUE_SIZE {
        command.push_str(&format!(" --queue-size {}", args.queue_size));
    }
    if args.timeout != DEFAULT_TIMEOUT_SECS {
        command.push_str(&format!(" --timeout {}", args.timeout));
    }
    command
}

fn report_failure(failure: &TransferFailure, args: &TransferArgs, verify_only: bool) {
    eprintln!();
    match (&failure.error, failure.kind()) {
        (TransferError::CancelledByUser, _) => {
            eprintln!("{} Operation cancelled.", style("Stopped:").yellow().bold());
        }
        (_, FailureKind::Recoverable) => {
            eprintln!(
                "{} {} after {} of {}.",
                style("Interrupted:").yellow().bold(),
                failure.error,
                HumanBytes(failure.bytes_processed),
                HumanBytes(failure.total_bytes),
            );
            eprintln!("Reconnect the device and resume with:");
            eprintln!(
                "  {}",
                style(resume_command(args, failure.bytes_processed, verify_only)).cyan()
            );
        }
        (_, FailureKind::Fatal) => {
            eprintln!("{} {}", style("Failed:").red().bold(), failure.error);
        }
    }
}

fn run_transfer(args: &TransferArgs, offset: u64, verify_only: bool) -> Result<()> {
    if !verify_only {
        println!(
            "{} This will erase all data on '{}'.",
            style("WARNING:").red().bold(),
            args.device.display()
        );
    }
    println!("  Device: {}", style(args.device.display()).cyan());
    println!("  Image:  {}", style(args.image.display()).cyan());
    if offset > 0 {
        println!("  Resume: from byte {offset}");
    }
    println!();

    if !args.yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Operation cancelled.");
        return Ok(());
    }

    let control = TransferControl::new();
    let verifying = Arc::new(AtomicBool::new(verify_only));
    {
        let control = control.clone();
        let verifying = verifying.clone();
        ctrlc::set_handler(move || {
            if verifying.load(Ordering::SeqCst) {
                control.cancel_verification();
            } else {
                control.abort();
            }
        })
        .context("failed to install the Ctrl-C handler")?;
    }

    let image = open_image(&args.image, &control)?;
    debug!(len = image.len()?, decompressed = image.is_decompressed(), "Image ready");

    let observer = CliObserver::new(verifying)?;
    let orchestrator = TransferOrchestrator::new(args.config(), control);
    match orchestrator.start_write(&image, &args.device(), offset, verify_only, &observer) {
        Ok(report) => {
            if report.verification_skipped {
                println!(
                    "\n{} Verification skipped after {} of {}.",
                    style("Note:").yellow().bold(),
                    HumanBytes(report.verified_bytes),
                    HumanBytes(report.total_bytes)
                );
            }
            println!(
                "\n✨ Successfully {} {} with {}.",
                if verify_only { "verified" } else { "flashed" },
                style(args.device.display()).cyan(),
                style(args.image.display()).cyan()
            );
            Ok(())
        }
        Err(failure) => {
            report_failure(&failure, args, verify_only);
            Err(failure.into())
        }
    }
}

fn show_info(device: PathBuf, block_size: Option<usize>) -> Result<()> {
    let target = DevicePath {
        path: device.clone(),
        block_size,
    };
    let opened = target
        .open_device()
        .with_context(|| format!("failed to open {}", device.display()))?;
    println!("  Device:      {}", style(device.display()).cyan());
    println!("  Block size:  {} bytes", opened.block_size());
    println!("  Block count: {}", opened.block_count());
    println!("  Capacity:    {} ({} bytes)", HumanBytes(opened.capacity()), opened.capacity());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose,
    });

    // Dropped when main() returns, restoring the terminal.
    let _echo_guard = terminal::EchoGuard::new();

    match cli.command {
        Commands::Write { args, offset } => run_transfer(&args, offset, false),
        Commands::Verify { args } => run_transfer(&args, 0, true),
        Commands::Info { device, block_size } => show_info(device, block_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> TransferArgs {
        match Cli::parse_from(argv).command {
            Commands::Write { args, .. } | Commands::Verify { args } => args,
            _ => panic!("not a transfer command"),
        }
    }

    #[test]
    fn resume_command_keeps_tuning_flags() {
        let args = parse(&[
            "burnr", "write", "disk.img", "/dev/sdz", "--block-size", "4096", "--buffer-blocks", "256",
            "--queue-size", "4", "--timeout", "30",
        ]);
        assert_eq!(
            resume_command(&args, 1048576, false),
            "burnr write disk.img /dev/sdz --offset 1048576 --block-size 4096 \
             --buffer-blocks 256 --queue-size 4 --timeout 30"
        );
    }

    #[test]
    fn resume_command_omits_defaults() {
        let args = parse(&["burnr", "verify", "disk.img", "/dev/sdz"]);
        assert_eq!(resume_command(&args, 512, true), "burnr verify disk.img /dev/sdz");
    }
}
