//! Uniform read/append handles over channel, memory-mapped and in-RAM
//! files.
//!
//! A `DbFile` starts in one of four modes and follows one lifecycle:
//! write handles (channel or mapped) become read handles after `close`,
//! read handles materialize their OS resources lazily on first use, and
//! every close hands mapped regions to the [`cleaner::BufferCleaner`]
//! instead of unmapping inline.

pub(crate) mod channel;
pub mod cleaner;
pub(crate) mod memory;
pub(crate) mod mmap;

use crate::env::FileOpenListener;
use crate::error::{Error, IoKind};
use crate::slice::{Slice, SliceBuilder};
use crate::Result;
use channel::{ChannelReadFile, ChannelWriteFile};
use memory::MemoryFile;
use mmap::{MmapReadFile, MmapWriteFile};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

enum Backing {
    ChannelWrite(ChannelWriteFile),
    ChannelRead(ChannelReadFile),
    MmapWrite(MmapWriteFile),
    MmapRead(MmapReadFile),
    Memory(MemoryFile),
    /// OS resources not materialized; a read reopens read-only.
    Closed,
    Deleted,
}

pub struct DbFile {
    path: PathBuf,
    /// Reopen reads through a read-only map instead of a channel.
    mmap_reads: bool,
    is_memory: bool,
    /// Set-once-false per close; winners of the swap release resources.
    open: AtomicBool,
    on_open: Option<FileOpenListener>,
    backing: RwLock<Backing>,
}

impl DbFile {
    /// Sequential-append channel file. Fails with `AlreadyExists` when the
    /// path is taken.
    pub fn channel_write(
        path: impl Into<PathBuf>,
        mmap_reads: bool,
        on_open: Option<FileOpenListener>,
    ) -> Result<DbFile> {
        let path = path.into();
        let file = ChannelWriteFile::create(&path)?;
        let db_file = DbFile {
            path,
            mmap_reads,
            is_memory: false,
            open: AtomicBool::new(true),
            on_open,
            backing: RwLock::new(Backing::ChannelWrite(file)),
        };
        db_file.notify_open();
        Ok(db_file)
    }

    /// Read-write mapped file of `buffer_size` bytes.
    pub fn mmap_write(
        path: impl Into<PathBuf>,
        buffer_size: usize,
        mmap_reads: bool,
        on_open: Option<FileOpenListener>,
    ) -> Result<DbFile> {
        let path = path.into();
        let file = MmapWriteFile::create(&path, buffer_size)?;
        let db_file = DbFile {
            path,
            mmap_reads,
            is_memory: false,
            open: AtomicBool::new(true),
            on_open,
            backing: RwLock::new(Backing::MmapWrite(file)),
        };
        db_file.notify_open();
        Ok(db_file)
    }

    /// Read handle over an existing file. The OS handle is not
    /// materialized until the first read.
    pub fn open_read(
        path: impl Into<PathBuf>,
        mmap_reads: bool,
        on_open: Option<FileOpenListener>,
    ) -> DbFile {
        DbFile {
            path: path.into(),
            mmap_reads,
            is_memory: false,
            open: AtomicBool::new(false),
            on_open,
            backing: RwLock::new(Backing::Closed),
        }
    }

    /// In-RAM file; `path` only identifies it in errors.
    pub fn memory(path: impl Into<PathBuf>, bytes: Slice) -> DbFile {
        DbFile {
            path: path.into(),
            mmap_reads: false,
            is_memory: true,
            open: AtomicBool::new(true),
            on_open: None,
            backing: RwLock::new(Backing::Memory(MemoryFile::new(bytes))),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn notify_open(&self) {
        if let Some(listener) = &self.on_open {
            listener(&self.path);
        }
    }

    fn lock_err() -> Error {
        Error::Format("file handle lock poisoned".into())
    }

    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.backing.write().map_err(|_| Self::lock_err())?;
        match &mut *guard {
            Backing::ChannelWrite(file) => file.append(bytes, &self.path),
            Backing::MmapWrite(file) => file.append(bytes, &self.path),
            Backing::MmapRead(_) => Err(Error::io_kind(IoKind::ReadOnlyMap, &self.path)),
            Backing::ChannelRead(_) | Backing::Memory(_) | Backing::Closed => {
                Err(Error::io_kind(IoKind::NotWritable, &self.path))
            }
            Backing::Deleted => Err(Error::io_kind(IoKind::NotOpen, &self.path)),
        }
    }

    /// Append a build slice. The slice must be filled to its capacity.
    pub fn append_slice(&self, builder: &SliceBuilder) -> Result<()> {
        builder.require_filled()?;
        self.append(builder.as_bytes())
    }

    pub fn read(&self, position: u64, size: usize) -> Result<Slice> {
        loop {
            {
                let guard = self.backing.read().map_err(|_| Self::lock_err())?;
                match &*guard {
                    Backing::ChannelRead(file) => {
                        return file
                            .read(position, size, &self.path)
                            .map(Slice::from_vec)
                    }
                    Backing::MmapRead(file) => {
                        return file
                            .read(position, size, &self.path)
                            .map(Slice::from_vec)
                    }
                    Backing::MmapWrite(file) => {
                        return file
                            .read(position, size, &self.path)
                            .map(Slice::from_vec)
                    }
                    Backing::Memory(file) => return file.read(position, size, &self.path),
                    Backing::ChannelWrite(_) => {
                        return Err(Error::io_kind(IoKind::NotReadable, &self.path))
                    }
                    Backing::Deleted => {
                        return Err(Error::io_kind(IoKind::NotOpen, &self.path))
                    }
                    Backing::Closed => {}
                }
            }
            self.open_for_read()?;
        }
    }

    pub fn get(&self, position: u64) -> Result<u8> {
        loop {
            {
                let guard = self.backing.read().map_err(|_| Self::lock_err())?;
                match &*guard {
                    Backing::ChannelRead(file) => return file.get(position, &self.path),
                    Backing::MmapRead(file) => return file.get(position, &self.path),
                    Backing::MmapWrite(file) => {
                        let byte = file.read(position, 1, &self.path)?;
                        return Ok(byte[0]);
                    }
                    Backing::Memory(file) => return file.get(position, &self.path),
                    Backing::ChannelWrite(_) => {
                        return Err(Error::io_kind(IoKind::NotReadable, &self.path))
                    }
                    Backing::Deleted => {
                        return Err(Error::io_kind(IoKind::NotOpen, &self.path))
                    }
                    Backing::Closed => {}
                }
            }
            self.open_for_read()?;
        }
    }

    pub fn read_all(&self) -> Result<Slice> {
        let size = self.file_size()?;
        self.read(0, size as usize)
    }

    pub fn file_size(&self) -> Result<u64> {
        let guard = self.backing.read().map_err(|_| Self::lock_err())?;
        match &*guard {
            Backing::ChannelWrite(file) => Ok(file.file_size()),
            Backing::ChannelRead(file) => Ok(file.file_size()),
            Backing::MmapWrite(file) => Ok(file.file_size()),
            Backing::MmapRead(file) => Ok(file.file_size()),
            Backing::Memory(file) => Ok(file.file_size()),
            Backing::Closed => fs::metadata(&self.path)
                .map(|meta| meta.len())
                .map_err(|err| Error::io(&err, &self.path)),
            Backing::Deleted => Err(Error::io_kind(IoKind::NotOpen, &self.path)),
        }
    }

    pub fn force(&self) -> Result<()> {
        let mut guard = self.backing.write().map_err(|_| Self::lock_err())?;
        match &mut *guard {
            Backing::ChannelWrite(file) => file.force(&self.path),
            Backing::MmapWrite(file) => file.force(&self.path),
            _ => Ok(()),
        }
    }

    /// Materialize the read backing. Invoked by reads that found the
    /// handle closed.
    fn open_for_read(&self) -> Result<()> {
        if self.is_memory {
            return Err(Error::io_kind(IoKind::NotOpen, &self.path));
        }
        let mut guard = self.backing.write().map_err(|_| Self::lock_err())?;
        if !matches!(&*guard, Backing::Closed) {
            // another thread won the reopen
            return Ok(());
        }
        *guard = if self.mmap_reads {
            Backing::MmapRead(MmapReadFile::open(&self.path)?)
        } else {
            Backing::ChannelRead(ChannelReadFile::open(&self.path)?)
        };
        self.open.store(true, Ordering::SeqCst);
        self.notify_open();
        Ok(())
    }

    /// Flush and release OS resources. Idempotent; reads after a close
    /// reopen the file read-only.
    pub fn close(&self) -> Result<()> {
        if self
            .open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let mut guard = self.backing.write().map_err(|_| Self::lock_err())?;
        match &mut *guard {
            Backing::ChannelWrite(file) => file.force(&self.path)?,
            Backing::MmapWrite(file) => file.release(&self.path)?,
            Backing::MmapRead(file) => file.release(&self.path),
            _ => {}
        }
        *guard = Backing::Closed;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        self.close()?;
        let mut guard = self.backing.write().map_err(|_| Self::lock_err())?;
        if matches!(&*guard, Backing::Deleted) {
            return Ok(());
        }
        if !self.is_memory {
            fs::remove_file(&self.path).map_err(|err| Error::io(&err, &self.path))?;
        }
        *guard = Backing::Deleted;
        Ok(())
    }

    /// Copy the underlying file. In-memory files have nothing on disk to
    /// copy.
    pub fn copy_to(&self, target: &Path) -> Result<PathBuf> {
        if self.is_memory {
            return Err(Error::CannotCopyInMemory {
                path: self.path.clone(),
            });
        }
        self.force()?;
        fs::copy(&self.path, target).map_err(|err| Error::io(&err, target))?;
        Ok(target.to_path_buf())
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        // correct code closes explicitly before dropping
        if self.is_open() && !self.is_memory {
            warn!("file handle dropped while open: {:?}", self.path);
            let _ = self.close();
        }
    }
}
