use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::digest::{BlobDescriptor, DescriptorDigest};
use crate::Result;

type WriteFn = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send>;

/// A lazy producer of bytes.  Its identity (digest and size) is only known
/// once it has been fully written.
pub enum Blob {
    Bytes(Vec<u8>),
    File(PathBuf),
    Writer(WriteFn),
}

impl Blob {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Blob::Bytes(bytes.into())
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Blob::File(path.into())
    }

    pub fn from_writer<F>(f: F) -> Self
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        Blob::Writer(Box::new(f))
    }

    /// Stream the blob into `out`, returning the descriptor of the bytes
    /// actually written.
    pub fn write_to<W: Write>(self, out: W) -> Result<BlobDescriptor> {
        let mut writer = CountingDigestWriter::new(out);
        match self {
            Blob::Bytes(bytes) => writer.write_all(&bytes)?,
            Blob::File(path) => {
                let mut reader = BufReader::new(File::open(&path)?);
                io::copy(&mut reader, &mut writer)?;
            }
            Blob::Writer(f) => f(&mut writer)?,
        }
        writer.flush()?;
        let (_, descriptor) = writer.finish();
        Ok(descriptor)
    }

    /// Materialize the blob into memory, e.g. as an HTTP request body.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Blob::Bytes(bytes) => Ok(bytes),
            Blob::File(path) => Ok(std::fs::read(path)?),
            other => {
                let mut buf = Vec::new();
                other.write_to(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blob::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Blob::File(p) => f.debug_tuple("File").field(p).finish(),
            Blob::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// CountingDigestWriter
// ---------------------------------------------------------------------------

/// Passes bytes through to `inner` while hashing and counting them.
pub struct CountingDigestWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> CountingDigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Consume the writer, returning the inner sink and the descriptor of
    /// everything that went through it.
    pub fn finish(self) -> (W, BlobDescriptor) {
        let digest = DescriptorDigest::from_sha256_output(&self.hasher.finalize());
        (self.inner, BlobDescriptor::new(self.count, digest))
    }
}

impl<W: Write> Write for CountingDigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_blob_descriptor_matches_content() {
        let mut out = Vec::new();
        let d = Blob::from_bytes(b"crepe".to_vec()).write_to(&mut out).unwrap();
        assert_eq!(out, b"crepe");
        assert_eq!(d.size, 5);
        assert_eq!(d.digest, DescriptorDigest::of_bytes(b"crepe"));
    }

    #[test]
    fn file_blob_streams_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"file contents").unwrap();

        let d = Blob::from_file(&path).write_to(io::sink()).unwrap();
        assert_eq!(d.size, 13);
        assert_eq!(d.digest, DescriptorDigest::of_bytes(b"file contents"));
    }

    #[test]
    fn writer_blob_is_lazy() {
        let blob = Blob::from_writer(|w| w.write_all(b"late"));
        assert_eq!(blob.into_bytes().unwrap(), b"late");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Blob::from_file("/nonexistent/layerbake/blob")
            .write_to(io::sink())
            .unwrap_err();
        assert!(matches!(err, crate::OciError::Io(_)));
    }
}
