use crate::error::{Error, IoKind};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Sequential append into an OS file. Reads are served by the read
/// backing after close.
pub(crate) struct ChannelWriteFile {
    file: File,
    pos: u64,
}

impl ChannelWriteFile {
    pub(crate) fn create(path: &Path) -> Result<ChannelWriteFile> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| Error::io(&err, path))?;
        Ok(ChannelWriteFile { file, pos: 0 })
    }

    pub(crate) fn append(&mut self, bytes: &[u8], path: &Path) -> Result<()> {
        self.file
            .write_all(bytes)
            .map_err(|err| Error::io(&err, path))?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    #[inline]
    pub(crate) fn file_size(&self) -> u64 {
        self.pos
    }

    pub(crate) fn force(&mut self, path: &Path) -> Result<()> {
        self.file.sync_all().map_err(|err| Error::io(&err, path))
    }
}

/// Random-access reads. The OS handle materializes lazily, on the first
/// read through the owning `DbFile`.
pub(crate) struct ChannelReadFile {
    file: File,
    len: u64,
}

impl ChannelReadFile {
    pub(crate) fn open(path: &Path) -> Result<ChannelReadFile> {
        let file = File::open(path).map_err(|err| Error::io(&err, path))?;
        let len = file
            .metadata()
            .map_err(|err| Error::io(&err, path))?
            .len();
        Ok(ChannelReadFile { file, len })
    }

    pub(crate) fn read(&self, position: u64, size: usize, path: &Path) -> Result<Vec<u8>> {
        if position + size as u64 > self.len {
            return Err(Error::io_kind(
                IoKind::Other(std::io::ErrorKind::UnexpectedEof),
                path,
            ));
        }
        let mut buf = vec![0u8; size];
        self.file
            .read_exact_at(&mut buf, position)
            .map_err(|err| Error::io(&err, path))?;
        Ok(buf)
    }

    pub(crate) fn get(&self, position: u64, path: &Path) -> Result<u8> {
        let byte = self.read(position, 1, path)?;
        Ok(byte[0])
    }

    #[inline]
    pub(crate) fn file_size(&self) -> u64 {
        self.len
    }
}
