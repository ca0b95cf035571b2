//! Firmware image sources.
//!
//! The session reads the image through [`PageSource`], one page-sized chunk
//! at a time, and never holds more than one page in memory.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;

/// Sequential producer of page-sized chunks.
pub trait PageSource {
    /// Total image size in bytes, known before the first read.
    fn total_size(&self) -> u64;

    /// Fill `buf` with the next chunk.
    ///
    /// Returns the number of bytes written. Only the last chunk may be
    /// shorter than `buf`; `0` means the image is exhausted.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

impl<S: PageSource + ?Sized> PageSource for &mut S {
    fn total_size(&self) -> u64 {
        (**self).total_size()
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_chunk(buf)
    }
}

/// Firmware image backed by any reader.
#[derive(Debug)]
pub struct FirmwareImage<R> {
    reader: R,
    size: u64,
}

impl FirmwareImage<BufReader<File>> {
    /// Open a raw binary firmware file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file
            .metadata()?
            .len();
        Self::new(BufReader::new(file), size)
    }
}

impl FirmwareImage<Cursor<Vec<u8>>> {
    /// Wrap an in-memory image.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let size = data.len() as u64;
        Self::new(Cursor::new(data), size)
    }
}

impl<R: Read> FirmwareImage<R> {
    /// Wrap a reader that will produce exactly `size` bytes.
    pub fn new(reader: R, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::EmptyImage);
        }
        Ok(Self { reader, size })
    }

    /// Image size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: Read> PageSource for FirmwareImage<R> {
    fn total_size(&self) -> u64 {
        self.size
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self
                .reader
                .read(&mut buf[filled..])
            {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(filled)
    }
}
