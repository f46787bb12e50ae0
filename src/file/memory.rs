use crate::error::{Error, IoKind};
use crate::slice::Slice;
use crate::Result;
use std::path::Path;

/// In-RAM file. The content is fixed at construction; level-0 segments
/// that never touch disk live behind this.
pub(crate) struct MemoryFile {
    bytes: Slice,
}

impl MemoryFile {
    pub(crate) fn new(bytes: Slice) -> MemoryFile {
        MemoryFile { bytes }
    }

    pub(crate) fn read(&self, position: u64, size: usize, path: &Path) -> Result<Slice> {
        let position = position as usize;
        if position + size > self.bytes.len() {
            return Err(Error::io_kind(
                IoKind::Other(std::io::ErrorKind::UnexpectedEof),
                path,
            ));
        }
        Ok(self.bytes.sub_slice(position, size))
    }

    pub(crate) fn get(&self, position: u64, path: &Path) -> Result<u8> {
        self.bytes
            .get(position as usize)
            .ok_or_else(|| {
                Error::io_kind(IoKind::Other(std::io::ErrorKind::UnexpectedEof), path)
            })
    }

    #[inline]
    pub(crate) fn file_size(&self) -> u64 {
        self.bytes.len() as u64
    }
}
