//! Positional file I/O with a pluggable compression filter on writes.
//!
//! Raw reads, writes and seeks go straight to the file and keep the
//! tracked offset in sync with the OS cursor. Switching the write mode to
//! a compression kind hands the file to a streaming encoder; everything
//! written until the mode is switched back is one compressed stream
//! appended at the cursor. While a stream is active the raw offset is
//! stale (the encoder buffers), so the writer measures chunk growth with
//! [`LogFile::compressed_bytes_in`] instead and the offset is re-synced
//! when the stream is finished.
//!
//! Reads and seeks are permitted while a stream is active; the chunked
//! writer always seeks back to end-of-file before writing more, which is
//! what keeps the stream appending in the right place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{Error, Result};
use crate::record::Compression;

enum Stream {
    Raw(File),
    Bz2(BzEncoder<File>),
    Zlib(ZlibEncoder<File>),
    /// Transient state while switching modes.
    Detached,
}

pub(crate) struct LogFile {
    path: PathBuf,
    stream: Stream,
    offset: u64,
}

impl LogFile {
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Ok(Self::new(path.as_ref(), file))
    }

    pub fn open_write(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self::new(path.as_ref(), file))
    }

    pub fn open_read_write(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Ok(Self::new(path.as_ref(), file))
    }

    fn new(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            stream: Stream::Raw(file),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw file offset. Stale while a compressed write stream is active.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file_ref()?.metadata()?.len())
    }

    // The file is lost if a compressed stream fails to finish; every
    // later operation then reports the dead state instead of touching it.
    fn file_ref(&self) -> Result<&File> {
        match &self.stream {
            Stream::Raw(file) => Ok(file),
            Stream::Bz2(enc) => Ok(enc.get_ref()),
            Stream::Zlib(enc) => Ok(enc.get_ref()),
            Stream::Detached => Err(Error::BadState("compression stream lost")),
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        match &mut self.stream {
            Stream::Raw(file) => Ok(file),
            Stream::Bz2(enc) => Ok(enc.get_mut()),
            Stream::Zlib(enc) => Ok(enc.get_mut()),
            Stream::Detached => Err(Error::BadState("compression stream lost")),
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let offset = self.file_mut()?.seek(pos)?;
        self.offset = offset;
        Ok(offset)
    }

    /// Shrinks the file. The cursor is left where it was; callers seek
    /// afterwards.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file_ref()?.set_len(len)?;
        Ok(())
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file_mut()?.read_exact(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Reads up to and including the next newline. Used only for the
    /// version line at the top of the file.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.read_exact(&mut byte)?;
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
            if line.len() > 1024 {
                return Err(Error::Format("version line too long"));
            }
        }
        String::from_utf8(line).map_err(|_| Error::Format("version line is not utf-8"))
    }

    /// Writes through the active stream: raw bytes, or input to the
    /// current compressed chunk.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.stream {
            Stream::Raw(file) => {
                file.write_all(buf)?;
                self.offset += buf.len() as u64;
            }
            Stream::Bz2(enc) => enc.write_all(buf)?,
            Stream::Zlib(enc) => enc.write_all(buf)?,
            Stream::Detached => return Err(Error::BadState("compression stream lost")),
        }
        Ok(())
    }

    /// Switches the write path. Any active compressed stream is finished
    /// first, flushing its remaining output into the file; the raw offset
    /// is then re-synced from the OS cursor.
    pub fn set_write_mode(&mut self, mode: Compression) -> Result<()> {
        let mut file = match std::mem::replace(&mut self.stream, Stream::Detached) {
            Stream::Raw(file) => file,
            Stream::Bz2(enc) => enc.finish()?,
            Stream::Zlib(enc) => enc.finish()?,
            Stream::Detached => return Err(Error::BadState("compression stream lost")),
        };
        self.stream = match mode {
            Compression::None => {
                self.offset = file.stream_position()?;
                Stream::Raw(file)
            }
            Compression::Bz2 => Stream::Bz2(BzEncoder::new(file, bzip2::Compression::best())),
            Compression::Zlib => {
                Stream::Zlib(ZlibEncoder::new(file, flate2::Compression::default()))
            }
        };
        Ok(())
    }

    /// Uncompressed bytes pushed into the active compressed stream; zero
    /// in raw mode. This is the chunk's logical size while it is open.
    pub fn compressed_bytes_in(&self) -> u64 {
        match &self.stream {
            Stream::Raw(_) => 0,
            Stream::Bz2(enc) => enc.total_in(),
            Stream::Zlib(enc) => enc.total_in(),
            Stream::Detached => 0,
        }
    }
}

/// Decompresses one whole chunk payload into `dst`, whose length must be
/// the chunk's recorded uncompressed size.
pub(crate) fn decompress(kind: Compression, dst: &mut [u8], src: &[u8]) -> Result<()> {
    match kind {
        Compression::None => {
            if dst.len() != src.len() {
                return Err(Error::Compression("stored chunk size mismatch"));
            }
            dst.copy_from_slice(src);
            Ok(())
        }
        Compression::Bz2 => read_fully(&mut BzDecoder::new(src), dst),
        Compression::Zlib => read_fully(&mut ZlibDecoder::new(src), dst),
    }
}

fn read_fully(reader: &mut impl Read, dst: &mut [u8]) -> Result<()> {
    reader
        .read_exact(dst)
        .map_err(|_| Error::Compression("chunk shorter than recorded size"))?;
    let mut probe = [0u8; 1];
    match reader.read(&mut probe) {
        Ok(0) => Ok(()),
        Ok(_) => Err(Error::Compression("chunk longer than recorded size")),
        Err(_) => Err(Error::Compression("corrupt compressed chunk")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn raw_write_seek_read() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("raw.bag");

        let mut file = LogFile::open_write(&path).expect("open write");
        file.write_all(b"hello").expect("write");
        assert_eq!(file.offset(), 5);

        file.seek(SeekFrom::Start(1)).expect("seek");
        assert_eq!(file.offset(), 1);
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"ello");
        assert_eq!(file.offset(), 5);

        file.seek(SeekFrom::Start(2)).expect("seek");
        file.write_all(b"LL").expect("overwrite");
        file.seek(SeekFrom::Start(0)).expect("rewind");
        let mut buf = [0u8; 5];
        file.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"heLLo");
    }

    #[test]
    fn truncate_shrinks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trunc.bag");

        let mut file = LogFile::open_write(&path).expect("open write");
        file.write_all(b"0123456789").expect("write");
        file.truncate(4).expect("truncate");
        assert_eq!(file.len().expect("len"), 4);
    }

    #[test]
    fn compressed_stream_round_trip() {
        for kind in [Compression::Bz2, Compression::Zlib] {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("stream.bag");

            let mut file = LogFile::open_write(&path).expect("open write");
            file.write_all(b"head").expect("write head");
            let data_pos = file.offset();

            file.set_write_mode(kind).expect("enable compression");
            let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
            file.write_all(&payload).expect("write payload");
            assert_eq!(file.compressed_bytes_in(), payload.len() as u64);

            file.set_write_mode(Compression::None).expect("finish stream");
            assert_eq!(file.compressed_bytes_in(), 0);
            let compressed_len = file.offset() - data_pos;
            assert!(compressed_len > 0);
            assert!(compressed_len < payload.len() as u64);

            file.seek(SeekFrom::Start(data_pos)).expect("seek back");
            let mut compressed = vec![0u8; compressed_len as usize];
            file.read_exact(&mut compressed).expect("read compressed");

            let mut restored = vec![0u8; payload.len()];
            decompress(kind, &mut restored, &compressed).expect("decompress");
            assert_eq!(restored, payload);
        }
    }

    #[test]
    fn decompress_size_mismatch_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("short.bag");

        let mut file = LogFile::open_write(&path).expect("open write");
        file.set_write_mode(Compression::Bz2).expect("enable compression");
        file.write_all(b"payload bytes").expect("write");
        file.set_write_mode(Compression::None).expect("finish");
        let compressed_len = file.offset();
        file.seek(SeekFrom::Start(0)).expect("rewind");
        let mut compressed = vec![0u8; compressed_len as usize];
        file.read_exact(&mut compressed).expect("read");

        let mut too_small = vec![0u8; 4];
        assert!(matches!(
            decompress(Compression::Bz2, &mut too_small, &compressed),
            Err(Error::Compression(_))
        ));
        let mut too_large = vec![0u8; 64];
        assert!(matches!(
            decompress(Compression::Bz2, &mut too_large, &compressed),
            Err(Error::Compression(_))
        ));
    }
}
