use std::io;
use std::path::PathBuf;

/// Classification of a failed file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    NotFound,
    AlreadyExists,
    /// Read attempted on a write-only (channel-write) handle.
    NotReadable,
    /// Append attempted on a read-only handle.
    NotWritable,
    /// Append attempted on a read-only memory map.
    ReadOnlyMap,
    /// Append ran past the end of the current memory map.
    BufferOverflow,
    /// Operation on a handle that was closed concurrently.
    NotOpen,
    Other(io::ErrorKind),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{kind:?}: {path:?}")]
    Io { kind: IoKind, path: PathBuf },

    #[error("segment format error: {0}")]
    Format(String),

    #[error("wrote {actual} of {expected} bytes, slice capacity {slice_size}")]
    FailedToWriteAllBytes {
        expected: usize,
        actual: usize,
        slice_size: usize,
    },

    #[error("cannot copy in-memory file: {path:?}")]
    CannotCopyInMemory { path: PathBuf },

    #[error("corrupted tail entries in {path:?} at offset {offset}")]
    CorruptedTailEntries { path: PathBuf, offset: u64 },

    #[error("insufficient capacity: required {required}, remaining {remaining}")]
    InsufficientCapacity { required: usize, remaining: usize },
}

impl Error {
    pub(crate) fn io(err: &io::Error, path: &std::path::Path) -> Error {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => IoKind::NotFound,
            io::ErrorKind::AlreadyExists => IoKind::AlreadyExists,
            other => IoKind::Other(other),
        };
        Error::Io {
            kind,
            path: path.to_path_buf(),
        }
    }

    pub(crate) fn io_kind(kind: IoKind, path: &std::path::Path) -> Error {
        Error::Io {
            kind,
            path: path.to_path_buf(),
        }
    }
}
