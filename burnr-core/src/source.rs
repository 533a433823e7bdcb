//! Image sources for the write and verify passes.
//!
//! A source has a known length, checked against the device capacity before
//! anything is written, and can be opened more than once: the verify pass
//! reads it again from byte 0.
use crate::transfer::TransferControl;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

pub trait ImageSource: Send + Sync {
    /// Length of the image in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Opens a fresh reader positioned at byte 0.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// An image file on disk, decompressed to a temporary file first if its
/// extension says it is compressed.
#[derive(Debug)]
pub struct FileImage {
    path: PathBuf,
    original: PathBuf,
    len: u64,
    temp: Option<TempPath>,
}

impl FileImage {
    /// Opens the image at `path`.
    ///
    /// `.gz`, `.xz` and `.zst` images are decompressed into a temporary file
    /// that lives as long as the returned value. `on_progress` receives the
    /// number of decompressed bytes so far. An abort requested through
    /// `control` stops decompression with [`io::ErrorKind::Interrupted`].
    pub fn open<F>(path: &Path, control: &TransferControl, mut on_progress: F) -> io::Result<Self>
    where
        F: FnMut(u64),
    {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let input = File::open(path)?;
        let mut reader: Box<dyn Read> = match ext.as_str() {
            "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(input))),
            "xz" => Box::new(XzDecoder::new(BufReader::new(input))),
            "zst" | "zstd" => Box::new(ZstdDecoder::new(BufReader::new(input))?),
            _ => {
                let len = input.metadata()?.len();
                debug!(path = %path.display(), len, "Using image in place");
                return Ok(Self {
                    path: path.to_path_buf(),
                    original: path.to_path_buf(),
                    len,
                    temp: None,
                });
            }
        };

        info!(path = %path.display(), format = %ext, "Decompressing image");
        let mut temp = NamedTempFile::new()?;
        let mut total: u64 = 0;
        {
            let mut writer = BufWriter::new(&mut temp);
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                if control.is_aborted() {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "Decompression cancelled by user",
                    ));
                }
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buffer[..n])?;
                total += n as u64;
                on_progress(total);
            }
            writer.flush()?;
        }

        let temp = temp.into_temp_path();
        info!(len = total, "Image decompressed");
        Ok(Self {
            path: temp.to_path_buf(),
            original: path.to_path_buf(),
            len: total,
            temp: Some(temp),
        })
    }

    /// The path the user gave, before any decompression.
    pub fn original_path(&self) -> &Path {
        &self.original
    }

    pub fn is_decompressed(&self) -> bool {
        self.temp.is_some()
    }
}

impl ImageSource for FileImage {
    fn len(&self) -> io::Result<u64> {
        Ok(self.len)
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }
}

/// An image held in memory.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    data: Arc<[u8]>,
}

impl MemoryImage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self { data: data.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl ImageSource for MemoryImage {
    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}
