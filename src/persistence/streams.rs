//! Byte-stream abstraction for saving and loading indices.
//!
//! The serializer depends only on these two small traits, so an index can
//! be written to or read from anything byte-shaped: a local file, an
//! in-memory buffer, or a non-seekable remote source wrapped in
//! [`ReaderInputStream`].

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{ProximaError, Result};

/// A readable byte stream. Like `std::io::Read` with just enough extra
/// surface for format detection: position tracking, optional seeking, and
/// a four-byte peek used once at load to sniff the file magic.
pub trait InputStream {
    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Current offset from the start of the stream.
    fn position(&mut self) -> u64;

    /// Whether `seek` is supported.
    fn seekable(&self) -> bool;

    /// Reposition the stream. Returns `false` when unsupported or failed.
    fn seek(&mut self, position: u64) -> bool;

    /// Read the next four bytes as a little-endian u32 without consuming
    /// them.
    fn peek_u32(&mut self) -> Result<u32>;
}

/// A writable byte stream.
pub trait OutputStream {
    /// Write the whole buffer. Returns `false` on failure.
    fn write(&mut self, buf: &[u8]) -> bool;

    /// Flush buffered bytes to the underlying sink.
    fn flush(&mut self);
}

/// Fill `buf` completely or fail. A short read means the payload ended
/// early, which is reported as corruption rather than an I/O error.
pub(crate) fn read_exact(stream: &mut dyn InputStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(ProximaError::Corrupt(format!(
                "stream ended after {filled} of {} expected bytes",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(())
}

pub(crate) fn read_u8(stream: &mut dyn InputStream) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(stream, &mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u32(stream: &mut dyn InputStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_i32(stream: &mut dyn InputStream) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn read_u64(stream: &mut dyn InputStream) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(stream, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_f32(stream: &mut dyn InputStream) -> Result<f32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

pub(crate) fn read_f64(stream: &mut dyn InputStream) -> Result<f64> {
    let mut buf = [0u8; 8];
    read_exact(stream, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

pub(crate) fn write_all(stream: &mut dyn OutputStream, buf: &[u8]) -> Result<()> {
    if stream.write(buf) {
        Ok(())
    } else {
        Err(ProximaError::StreamFailure(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("failed to write {} bytes to stream", buf.len()),
        )))
    }
}

/// Buffered file input.
pub struct FileInputStream {
    reader: BufReader<File>,
    seekable: bool,
}

impl FileInputStream {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let seekable = file.metadata().map(|m| m.is_file()).unwrap_or(false);
        Ok(Self { reader: BufReader::new(file), seekable })
    }
}

impl InputStream for FileInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }

    fn position(&mut self) -> u64 {
        self.reader.stream_position().unwrap_or(0)
    }

    fn seekable(&self) -> bool {
        self.seekable
    }

    fn seek(&mut self, position: u64) -> bool {
        self.seekable && self.reader.seek(SeekFrom::Start(position)).is_ok()
    }

    fn peek_u32(&mut self) -> Result<u32> {
        let buf = self.reader.fill_buf()?;
        if buf.len() >= 4 {
            return Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));
        }
        let position = self.position();
        let mut bytes = [0u8; 4];
        read_exact(self, &mut bytes)?;
        if !self.seek(position) {
            return Err(ProximaError::StreamFailure(io::Error::other(
                "failed to rewind after peeking",
            )));
        }
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Buffered file output.
pub struct FileOutputStream {
    writer: BufWriter<File>,
}

impl FileOutputStream {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { writer: BufWriter::new(File::create(path)?) })
    }
}

impl OutputStream for FileOutputStream {
    fn write(&mut self, buf: &[u8]) -> bool {
        self.writer.write_all(buf).is_ok()
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Read from an in-memory byte buffer.
pub struct MemoryInputStream {
    data: Vec<u8>,
    position: usize,
}

impl MemoryInputStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }
}

impl InputStream for MemoryInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn position(&mut self) -> u64 {
        self.position as u64
    }

    fn seekable(&self) -> bool {
        true
    }

    fn seek(&mut self, position: u64) -> bool {
        if position as usize <= self.data.len() {
            self.position = position as usize;
            true
        } else {
            false
        }
    }

    fn peek_u32(&mut self) -> Result<u32> {
        let remaining = &self.data[self.position..];
        if remaining.len() < 4 {
            return Err(ProximaError::Corrupt(format!(
                "stream ended after {} of 4 expected bytes",
                remaining.len()
            )));
        }
        Ok(u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]))
    }
}

/// Collect writes into an in-memory byte buffer.
#[derive(Default)]
pub struct MemoryOutputStream {
    data: Vec<u8>,
}

impl MemoryOutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes written so far.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl OutputStream for MemoryOutputStream {
    fn write(&mut self, buf: &[u8]) -> bool {
        self.data.extend_from_slice(buf);
        true
    }

    fn flush(&mut self) {}
}

/// Adapt any `std::io::Read` — a socket, a subprocess pipe, an object-store
/// download — into an [`InputStream`]. Not seekable; `peek_u32` is served
/// from a small pushback buffer.
pub struct ReaderInputStream<R: Read> {
    reader: R,
    pushback: Vec<u8>,
    position: u64,
}

impl<R: Read> ReaderInputStream<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, pushback: Vec::new(), position: 0 }
    }
}

impl<R: Read> InputStream for ReaderInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pushback.is_empty() {
            let n = self.pushback.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pushback[..n]);
            self.pushback.drain(..n);
            self.position += n as u64;
            return Ok(n);
        }
        let n = self.reader.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn position(&mut self) -> u64 {
        self.position
    }

    fn seekable(&self) -> bool {
        false
    }

    fn seek(&mut self, _position: u64) -> bool {
        false
    }

    fn peek_u32(&mut self) -> Result<u32> {
        while self.pushback.len() < 4 {
            let mut byte = [0u8; 1];
            let n = self.reader.read(&mut byte)?;
            if n == 0 {
                return Err(ProximaError::Corrupt(format!(
                    "stream ended after {} of 4 expected bytes",
                    self.pushback.len()
                )));
            }
            self.pushback.push(byte[0]);
        }
        Ok(u32::from_le_bytes([
            self.pushback[0],
            self.pushback[1],
            self.pushback[2],
            self.pushback[3],
        ]))
    }
}
