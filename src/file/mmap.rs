use crate::error::{Error, IoKind};
use crate::file::cleaner::{BufferCleaner, ReleasedMap};
use crate::Result;
use memmap::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Read-write map of `buffer_size` bytes. Appends write through the map;
/// overflowing the map forces it, releases it to the cleaner, extends the
/// file and remaps.
pub(crate) struct MmapWriteFile {
    file: File,
    map: Option<MmapMut>,
    pos: usize,
}

impl MmapWriteFile {
    pub(crate) fn create(path: &Path, buffer_size: usize) -> Result<MmapWriteFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| Error::io(&err, path))?;
        file.set_len(buffer_size.max(1) as u64)
            .map_err(|err| Error::io(&err, path))?;
        let map = unsafe {
            MmapOptions::new()
                .len(buffer_size.max(1))
                .map_mut(&file)
                .map_err(|err| Error::io(&err, path))?
        };
        Ok(MmapWriteFile {
            file,
            map: Some(map),
            pos: 0,
        })
    }

    fn try_append(&mut self, bytes: &[u8], path: &Path) -> Result<()> {
        let map = match self.map.as_mut() {
            Some(map) => map,
            None => return Err(Error::io_kind(IoKind::NotOpen, path)),
        };
        if self.pos + bytes.len() > map.len() {
            return Err(Error::io_kind(IoKind::BufferOverflow, path));
        }
        map[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub(crate) fn append(&mut self, bytes: &[u8], path: &Path) -> Result<()> {
        match self.try_append(bytes, path) {
            Err(Error::Io {
                kind: IoKind::BufferOverflow,
                ..
            }) => {
                self.expand(bytes.len(), path)?;
                self.try_append(bytes, path)
            }
            other => other,
        }
    }

    /// Force the current map, hand it to the cleaner, extend the file to
    /// `pos + required` and remap. The append position survives the swap.
    fn expand(&mut self, required: usize, path: &Path) -> Result<()> {
        let old = match self.map.take() {
            Some(map) => map,
            None => return Err(Error::io_kind(IoKind::NotOpen, path)),
        };
        old.flush().map_err(|err| Error::io(&err, path))?;
        BufferCleaner::clean(ReleasedMap::Write(old), path.to_path_buf());

        let new_len = self.pos + required;
        self.file
            .set_len(new_len as u64)
            .map_err(|err| Error::io(&err, path))?;
        let map = unsafe {
            MmapOptions::new()
                .len(new_len)
                .map_mut(&self.file)
                .map_err(|err| Error::io(&err, path))?
        };
        self.map = Some(map);
        Ok(())
    }

    pub(crate) fn read(&self, position: u64, size: usize, path: &Path) -> Result<Vec<u8>> {
        let map = match self.map.as_ref() {
            Some(map) => map,
            None => return Err(Error::io_kind(IoKind::NotOpen, path)),
        };
        let position = position as usize;
        if position + size > self.pos {
            return Err(Error::io_kind(
                IoKind::Other(std::io::ErrorKind::UnexpectedEof),
                path,
            ));
        }
        Ok(map[position..position + size].to_vec())
    }

    #[inline]
    pub(crate) fn file_size(&self) -> u64 {
        self.pos as u64
    }

    pub(crate) fn force(&mut self, path: &Path) -> Result<()> {
        if let Some(map) = self.map.as_ref() {
            map.flush().map_err(|err| Error::io(&err, path))?;
        }
        Ok(())
    }

    /// Flush, truncate the file to the written length and release the map
    /// to the cleaner. The handle is unreadable afterwards until reopened.
    pub(crate) fn release(&mut self, path: &Path) -> Result<()> {
        if let Some(map) = self.map.take() {
            map.flush().map_err(|err| Error::io(&err, path))?;
            BufferCleaner::clean(ReleasedMap::Write(map), path.to_path_buf());
        }
        self.file
            .set_len(self.pos as u64)
            .map_err(|err| Error::io(&err, path))?;
        self.file
            .sync_all()
            .map_err(|err| Error::io(&err, path))
    }
}

/// Read-only map of a finished segment file.
pub(crate) struct MmapReadFile {
    map: Option<Mmap>,
    len: usize,
}

impl MmapReadFile {
    pub(crate) fn open(path: &Path) -> Result<MmapReadFile> {
        let file = File::open(path).map_err(|err| Error::io(&err, path))?;
        let len = file
            .metadata()
            .map_err(|err| Error::io(&err, path))?
            .len() as usize;
        // zero-length maps are rejected by the OS
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map(&file).map_err(|err| Error::io(&err, path))? })
        };
        Ok(MmapReadFile { map, len })
    }

    pub(crate) fn read(&self, position: u64, size: usize, path: &Path) -> Result<Vec<u8>> {
        let position = position as usize;
        if position + size > self.len {
            return Err(Error::io_kind(
                IoKind::Other(std::io::ErrorKind::UnexpectedEof),
                path,
            ));
        }
        match self.map.as_ref() {
            Some(map) => Ok(map[position..position + size].to_vec()),
            None => Err(Error::io_kind(IoKind::NotOpen, path)),
        }
    }

    pub(crate) fn get(&self, position: u64, path: &Path) -> Result<u8> {
        let byte = self.read(position, 1, path)?;
        Ok(byte[0])
    }

    #[inline]
    pub(crate) fn file_size(&self) -> u64 {
        self.len as u64
    }

    pub(crate) fn release(&mut self, path: &Path) {
        if let Some(map) = self.map.take() {
            BufferCleaner::clean(ReleasedMap::Read(map), path.to_path_buf());
        }
    }
}
