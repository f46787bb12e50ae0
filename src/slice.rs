use crate::error::Error;
use crate::Result;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Immutable view over shared bytes. Sub-slicing never copies the backing
/// storage; ordering is lexicographic over unsigned bytes.
#[derive(Clone)]
pub struct Slice {
    data: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl Slice {
    pub fn empty() -> Slice {
        Slice {
            data: Arc::from(Vec::new()),
            offset: 0,
            len: 0,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Slice {
        let len = bytes.len();
        Slice {
            data: Arc::from(bytes),
            offset: 0,
            len,
        }
    }

    /// View of `len` bytes starting at `offset`, sharing the backing storage.
    pub fn sub_slice(&self, offset: usize, len: usize) -> Slice {
        debug_assert!(offset + len <= self.len);
        Slice {
            data: self.data.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_bytes().get(index).copied()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// Bytes allocated behind this view, which may exceed `len` when the
    /// view was carved out of a larger backing.
    #[inline]
    pub fn underlying_len(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Slice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Slice {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<&[u8]> for Slice {
    fn from(bytes: &[u8]) -> Slice {
        Slice::from_vec(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Slice {
    fn from(bytes: Vec<u8>) -> Slice {
        Slice::from_vec(bytes)
    }
}

impl PartialEq for Slice {
    fn eq(&self, other: &Slice) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Slice {}

impl PartialOrd for Slice {
    fn partial_cmp(&self, other: &Slice) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slice {
    fn cmp(&self, other: &Slice) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl std::hash::Hash for Slice {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state)
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slice({:?})", self.as_bytes())
    }
}

/// Append-only builder with a fixed capacity. `written()` trails
/// `capacity()` until the builder is full; appends past the capacity
/// fail with `InsufficientCapacity`.
pub struct SliceBuilder {
    buf: Vec<u8>,
    cap: usize,
}

impl SliceBuilder {
    pub fn with_capacity(cap: usize) -> SliceBuilder {
        SliceBuilder {
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    #[inline]
    pub fn written(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.cap - self.buf.len()
    }

    fn reserve(&mut self, required: usize) -> Result<()> {
        if required > self.remaining() {
            return Err(Error::InsufficientCapacity {
                required,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn add_u8(&mut self, byte: u8) -> Result<()> {
        self.reserve(1)?;
        self.buf.push(byte);
        Ok(())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// LEB128 unsigned varint, 7 bits per byte, low bits first.
    pub fn add_unsigned(&mut self, mut value: u64) -> Result<()> {
        self.reserve(varint_len(value))?;
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return Ok(());
            }
            self.buf.push(byte | 0x80);
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The written prefix as an immutable view.
    pub fn freeze(self) -> Slice {
        Slice::from_vec(self.buf)
    }

    /// Callers handing a build slice to a file must fill it completely.
    pub fn require_filled(&self) -> Result<()> {
        if self.written() < self.cap {
            return Err(Error::FailedToWriteAllBytes {
                expected: self.cap,
                actual: self.written(),
                slice_size: self.cap,
            });
        }
        Ok(())
    }
}

/// Encoded size of `value` as an unsigned varint.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decode cursor over a byte window.
pub struct SliceReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(bytes: &'a [u8]) -> SliceReader<'a> {
        SliceReader { bytes, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.bytes.len() {
            return Err(Error::Format(format!(
                "seek to {} past end {}",
                pos,
                self.bytes.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        match self.bytes.get(self.pos) {
            Some(byte) => {
                self.pos += 1;
                Ok(*byte)
            }
            None => Err(Error::Format("read past end of slice".into())),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Format(format!(
                "read of {} bytes past end, {} remaining",
                len,
                self.remaining()
            )));
        }
        let bytes = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_unsigned(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::Format("varint too long".into()));
            }
        }
    }
}
