use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Little-endian reader over a persisted file that reports short reads as
/// format errors and everything else as storage I/O errors.
pub(crate) struct Decoder<R> {
    inner: R,
    path: PathBuf,
    offset: u64,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(inner: R, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn at_eof(&mut self) -> Result<bool> {
        let buf = self.inner.fill_buf().map_err(|e| Error::io(&self.path, e))?;
        Ok(buf.is_empty())
    }

    pub fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => {
                self.offset += N as u64;
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(self.malformed(format!(
                "truncated: needed {} bytes at offset {}",
                N, self.offset
            ))),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes::<1>()?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.bytes()?))
    }

    pub fn malformed(&self, message: impl Into<String>) -> Error {
        Error::format(self.path.display().to_string(), message)
    }
}

pub(crate) fn put_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn put_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn put_f32(w: &mut impl Write, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
