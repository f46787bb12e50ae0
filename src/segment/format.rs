//! Segment file codec.
//!
//! A segment file carries three regions, written in order:
//!
//! ```text
//! +-------------------------+ (offset 0)
//! | Values Block            |  raw value bytes, key order, no separators
//! +-------------------------+
//! | Index Block             |  one record per entry, key order
//! +-------------------------+
//! | Footer                  |  count, range bit, bloom, index bounds
//! +-------------------------+
//! ```
//!
//! ## Index record
//!
//! ```text
//! +-----+------------+----------+---------+----------+
//! | tag | key prefix | key tail | tail    | deadline |
//! +-----+------------+----------+---------+----------+
//! | [value offset | value length]                     |  tags with values
//! | [to key | from value block | range value block]   |  Range only
//! +---------------------------------------------------+
//! | next record offset | next record size             |
//! +---------------------------------------------------+
//! ```
//!
//! All integers are little-endian unsigned varints except the single tag
//! byte. Keys are compressed against the previous record's key (a range
//! record's key is its `from_key`). The next pair lets a reader fetch the
//! following record without reparsing, and is `0 | 0` on the final
//! record.

use crate::entry::{
    deadline_to_millis, millis_to_deadline, Deadline, FromValue, KeyValue, PersistentEntry,
    RangeValue, Value,
};
use crate::error::Error;
use crate::file::DbFile;
use crate::filter::BloomFilter;
use crate::segment::footer::{push_varint, Footer};
use crate::segment::MaxKey;
use crate::slice::{varint_len, Slice, SliceReader};
use crate::Result;
use std::sync::Arc;

pub(crate) const TAG_PUT_VALUE: u8 = 1;
pub(crate) const TAG_PUT_NO_VALUE: u8 = 2;
pub(crate) const TAG_UPDATE_VALUE: u8 = 3;
pub(crate) const TAG_UPDATE_NO_VALUE: u8 = 4;
pub(crate) const TAG_REMOVE: u8 = 5;
pub(crate) const TAG_RANGE: u8 = 6;

/// Reserved in the size projection for the unresolved next pair of each
/// record.
const NEXT_PAIR_ALLOWANCE: u64 = 6;
/// Projected heap overhead per entry kept in memory.
const MEMORY_ENTRY_OVERHEAD: u64 = 32;

const FIRST_RECORD_WINDOW: usize = 4096;

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn deadline_millis(deadline: Option<Deadline>) -> u64 {
    deadline.map(deadline_to_millis).unwrap_or(0)
}

/// Append `value` to the values block, returning its `(offset, length)`.
fn push_value(values: &mut Vec<u8>, value: &Value) -> Result<(u64, u32)> {
    let offset = values.len() as u64;
    match value.fetch()? {
        Some(bytes) => {
            values.extend_from_slice(&bytes);
            Ok((offset, bytes.len() as u32))
        }
        None => Ok((offset, 0)),
    }
}

fn push_value_pair(out: &mut Vec<u8>, values: &mut Vec<u8>, value: &Value) -> Result<()> {
    let (offset, length) = push_value(values, value)?;
    push_varint(out, offset);
    push_varint(out, length as u64);
    Ok(())
}

/// Fixed-shaped sub-block used for a range's from and range values:
/// shape tag, deadline, value pair for shapes that carry one.
fn push_from_value(out: &mut Vec<u8>, values: &mut Vec<u8>, fv: &FromValue) -> Result<()> {
    match fv {
        FromValue::Put { value, deadline } => {
            out.push(if value.is_none() {
                TAG_PUT_NO_VALUE
            } else {
                TAG_PUT_VALUE
            });
            push_varint(out, deadline_millis(*deadline));
            if !value.is_none() {
                push_value_pair(out, values, value)?;
            }
        }
        FromValue::Update { value, deadline } => {
            out.push(if value.is_none() {
                TAG_UPDATE_NO_VALUE
            } else {
                TAG_UPDATE_VALUE
            });
            push_varint(out, deadline_millis(*deadline));
            if !value.is_none() {
                push_value_pair(out, values, value)?;
            }
        }
        FromValue::Remove { deadline } => {
            out.push(TAG_REMOVE);
            push_varint(out, deadline_millis(*deadline));
        }
    }
    Ok(())
}

fn push_range_value(out: &mut Vec<u8>, values: &mut Vec<u8>, rv: &RangeValue) -> Result<()> {
    match rv {
        RangeValue::Update { value, deadline } => {
            out.push(if value.is_none() {
                TAG_UPDATE_NO_VALUE
            } else {
                TAG_UPDATE_VALUE
            });
            push_varint(out, deadline_millis(*deadline));
            if !value.is_none() {
                push_value_pair(out, values, value)?;
            }
        }
        RangeValue::Remove { deadline } => {
            out.push(TAG_REMOVE);
            push_varint(out, deadline_millis(*deadline));
        }
    }
    Ok(())
}

/// Encode one record body (everything except the trailing next pair),
/// appending any value bytes to the values block.
fn build_record_body(
    kv: &KeyValue,
    prev_key: Option<&Slice>,
    values: &mut Vec<u8>,
) -> Result<Vec<u8>> {
    let key = kv.key();
    let prefix_len = prev_key
        .map(|prev| common_prefix_len(prev, key))
        .unwrap_or(0);
    let tail = &key[prefix_len..];

    let mut body = Vec::with_capacity(16 + tail.len());
    match kv {
        KeyValue::Put {
            value, deadline, ..
        } => {
            body.push(if value.is_none() {
                TAG_PUT_NO_VALUE
            } else {
                TAG_PUT_VALUE
            });
            push_varint(&mut body, prefix_len as u64);
            push_varint(&mut body, tail.len() as u64);
            body.extend_from_slice(tail);
            push_varint(&mut body, deadline_millis(*deadline));
            if !value.is_none() {
                push_value_pair(&mut body, values, value)?;
            }
        }
        KeyValue::Update {
            value, deadline, ..
        } => {
            body.push(if value.is_none() {
                TAG_UPDATE_NO_VALUE
            } else {
                TAG_UPDATE_VALUE
            });
            push_varint(&mut body, prefix_len as u64);
            push_varint(&mut body, tail.len() as u64);
            body.extend_from_slice(tail);
            push_varint(&mut body, deadline_millis(*deadline));
            if !value.is_none() {
                push_value_pair(&mut body, values, value)?;
            }
        }
        KeyValue::Remove { deadline, .. } => {
            body.push(TAG_REMOVE);
            push_varint(&mut body, prefix_len as u64);
            push_varint(&mut body, tail.len() as u64);
            body.extend_from_slice(tail);
            push_varint(&mut body, deadline_millis(*deadline));
        }
        KeyValue::Range {
            to_key,
            from_value,
            range_value,
            ..
        } => {
            body.push(TAG_RANGE);
            push_varint(&mut body, prefix_len as u64);
            push_varint(&mut body, tail.len() as u64);
            body.extend_from_slice(tail);
            // the deadline slot is unused on ranges; theirs live in the
            // value blocks
            push_varint(&mut body, 0);
            push_varint(&mut body, to_key.len() as u64);
            body.extend_from_slice(to_key);
            match from_value {
                Some(fv) => push_from_value(&mut body, values, fv)?,
                None => body.push(0),
            }
            push_range_value(&mut body, values, range_value)?;
        }
    }
    Ok(body)
}

/// Mirror of [`build_record_body`] that only measures. `values_offset` is
/// the running length of the values block, which the value-pair varints
/// depend on.
fn record_body_len(kv: &KeyValue, prev_key: Option<&Slice>, values_offset: u64) -> u64 {
    let key = kv.key();
    let prefix_len = prev_key
        .map(|prev| common_prefix_len(prev, key))
        .unwrap_or(0);
    let tail_len = key.len() - prefix_len;

    let key_fields = 1u64
        + varint_len(prefix_len as u64) as u64
        + varint_len(tail_len as u64) as u64
        + tail_len as u64;

    fn value_pair_len(value: &Value, values_offset: u64) -> u64 {
        if value.is_none() {
            0
        } else {
            (varint_len(values_offset) + varint_len(value.value_len() as u64)) as u64
        }
    }

    match kv {
        KeyValue::Put {
            value, deadline, ..
        }
        | KeyValue::Update {
            value, deadline, ..
        } => {
            key_fields
                + varint_len(deadline_millis(*deadline)) as u64
                + value_pair_len(value, values_offset)
        }
        KeyValue::Remove { deadline, .. } => {
            key_fields + varint_len(deadline_millis(*deadline)) as u64
        }
        KeyValue::Range {
            to_key,
            from_value,
            range_value,
            ..
        } => {
            let mut len = key_fields
                + varint_len(0) as u64
                + varint_len(to_key.len() as u64) as u64
                + to_key.len() as u64;
            let mut values_offset = values_offset;
            match from_value {
                Some(FromValue::Put { value, deadline })
                | Some(FromValue::Update { value, deadline }) => {
                    len += 1 + varint_len(deadline_millis(*deadline)) as u64
                        + value_pair_len(value, values_offset);
                    values_offset += value.value_len() as u64;
                }
                Some(FromValue::Remove { deadline }) => {
                    len += 1 + varint_len(deadline_millis(*deadline)) as u64;
                }
                None => len += 1,
            }
            match range_value {
                RangeValue::Update { value, deadline } => {
                    len += 1 + varint_len(deadline_millis(*deadline)) as u64
                        + value_pair_len(value, values_offset);
                }
                RangeValue::Remove { deadline } => {
                    len += 1 + varint_len(deadline_millis(*deadline)) as u64;
                }
            }
            len
        }
    }
}

/// Total raw value bytes an entry contributes to the values block.
fn value_bytes_len(kv: &KeyValue) -> u64 {
    match kv {
        KeyValue::Put { value, .. } | KeyValue::Update { value, .. } => value.value_len() as u64,
        KeyValue::Remove { .. } => 0,
        KeyValue::Range {
            from_value,
            range_value,
            ..
        } => {
            let from = match from_value {
                Some(FromValue::Put { value, .. }) | Some(FromValue::Update { value, .. }) => {
                    value.value_len() as u64
                }
                _ => 0,
            };
            let range = match range_value {
                RangeValue::Update { value, .. } => value.value_len() as u64,
                RangeValue::Remove { .. } => 0,
            };
            from + range
        }
    }
}

/// Running totals over the entries added to one output segment. After
/// each `add` the projections tell the merger whether to close the
/// segment.
pub struct Stats {
    pub segment_size: u64,
    pub memory_segment_size: u64,
    pub key_value_count: u64,
    pub min_key: Option<Slice>,
    pub max_key: Option<MaxKey>,
    pub nearest_deadline: Option<Deadline>,
    pub has_range: bool,
    values_len: u64,
    prev_key: Option<Slice>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            segment_size: 0,
            memory_segment_size: 0,
            key_value_count: 0,
            min_key: None,
            max_key: None,
            nearest_deadline: None,
            has_range: false,
            values_len: 0,
            prev_key: None,
        }
    }

    pub fn add(&mut self, kv: &KeyValue) {
        let body = record_body_len(kv, self.prev_key.as_ref(), self.values_len);
        let values = value_bytes_len(kv);
        self.segment_size += values + body + NEXT_PAIR_ALLOWANCE;
        self.memory_segment_size += kv.key().len() as u64 + values + MEMORY_ENTRY_OVERHEAD;
        self.key_value_count += 1;
        self.values_len += values;

        if self.min_key.is_none() {
            self.min_key = Some(kv.key().clone());
        }
        self.max_key = Some(match kv {
            KeyValue::Range {
                from_key, to_key, ..
            } => MaxKey::Range {
                from: from_key.clone(),
                to: to_key.clone(),
            },
            fixed => MaxKey::Fixed(fixed.key().clone()),
        });
        self.nearest_deadline =
            crate::entry::min_deadline(self.nearest_deadline, kv.nearest_deadline());
        self.has_range |= kv.is_range();
        self.prev_key = Some(kv.key().clone());
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key_value_count == 0
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

/// Encode a full segment file: values block, index block, footer.
/// The caller appends the returned bytes to a fresh file unmodified.
pub(crate) fn encode_segment(entries: &[KeyValue], bloom_fpr: f64) -> Result<Vec<u8>> {
    let mut values = Vec::new();
    let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(entries.len());
    let mut prev_key: Option<&Slice> = None;
    let mut has_range = false;

    for kv in entries {
        bodies.push(build_record_body(kv, prev_key, &mut values)?);
        has_range |= kv.is_range();
        prev_key = Some(kv.key());
    }

    // Resolve the next pairs. A record's pair depends on its successor's
    // finished size, and offsets depend on every earlier size, so iterate
    // to the fixed point; sizes only grow and are bounded, so this
    // settles in a few rounds.
    let n = bodies.len();
    let mut sizes: Vec<u64> = bodies.iter().map(|body| body.len() as u64 + 2).collect();
    let mut offsets = vec![0u64; n];
    loop {
        for i in 1..n {
            offsets[i] = offsets[i - 1] + sizes[i - 1];
        }
        let mut changed = false;
        for i in 0..n {
            let (next_offset, next_size) = if i + 1 < n {
                (offsets[i] + sizes[i], sizes[i + 1])
            } else {
                (0, 0)
            };
            let new_size = bodies[i].len() as u64
                + varint_len(next_offset) as u64
                + varint_len(next_size) as u64;
            if new_size != sizes[i] {
                sizes[i] = new_size;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut index = Vec::with_capacity(sizes.iter().sum::<u64>() as usize);
    for i in 0..n {
        let (next_offset, next_size) = if i + 1 < n {
            (offsets[i + 1], sizes[i + 1])
        } else {
            (0, 0)
        };
        index.extend_from_slice(&bodies[i]);
        push_varint(&mut index, next_offset);
        push_varint(&mut index, next_size);
    }

    let bloom = if has_range {
        // a filter cannot answer for every key inside a span without
        // false negatives
        None
    } else {
        BloomFilter::with_rate(entries.len(), bloom_fpr).map(|mut filter| {
            for kv in entries {
                filter.add(kv.key());
            }
            filter
        })
    };

    let footer = Footer {
        key_value_count: entries.len() as u64,
        has_range,
        bloom,
        index_offset: values.len() as u64,
        index_length: index.len() as u64,
    };

    let mut bytes = values;
    bytes.extend_from_slice(&index);
    bytes.extend_from_slice(&footer.encode());
    Ok(bytes)
}

fn read_persistent_value(
    reader: &mut SliceReader<'_>,
    file: &Arc<DbFile>,
) -> Result<Value> {
    let offset = reader.read_unsigned()?;
    let length = reader.read_unsigned()? as u32;
    Ok(Value::Persistent {
        offset,
        length,
        file: file.clone(),
    })
}

fn read_deadline(reader: &mut SliceReader<'_>) -> Result<Option<Deadline>> {
    let millis = reader.read_unsigned()?;
    Ok(if millis == 0 {
        None
    } else {
        Some(millis_to_deadline(millis))
    })
}

fn read_from_value(reader: &mut SliceReader<'_>, file: &Arc<DbFile>) -> Result<Option<FromValue>> {
    let shape = reader.read_u8()?;
    let fv = match shape {
        0 => return Ok(None),
        TAG_PUT_VALUE => FromValue::Put {
            deadline: read_deadline(reader)?,
            value: read_persistent_value(reader, file)?,
        },
        TAG_PUT_NO_VALUE => FromValue::Put {
            deadline: read_deadline(reader)?,
            value: Value::None,
        },
        TAG_UPDATE_VALUE => FromValue::Update {
            deadline: read_deadline(reader)?,
            value: read_persistent_value(reader, file)?,
        },
        TAG_UPDATE_NO_VALUE => FromValue::Update {
            deadline: read_deadline(reader)?,
            value: Value::None,
        },
        TAG_REMOVE => FromValue::Remove {
            deadline: read_deadline(reader)?,
        },
        other => {
            return Err(Error::Format(format!("unknown from-value shape {}", other)))
        }
    };
    Ok(Some(fv))
}

fn read_range_value(reader: &mut SliceReader<'_>, file: &Arc<DbFile>) -> Result<RangeValue> {
    let shape = reader.read_u8()?;
    match shape {
        TAG_UPDATE_VALUE => Ok(RangeValue::Update {
            deadline: read_deadline(reader)?,
            value: read_persistent_value(reader, file)?,
        }),
        TAG_UPDATE_NO_VALUE => Ok(RangeValue::Update {
            deadline: read_deadline(reader)?,
            value: Value::None,
        }),
        TAG_REMOVE => Ok(RangeValue::Remove {
            deadline: read_deadline(reader)?,
        }),
        other => Err(Error::Format(format!("unknown range-value shape {}", other))),
    }
}

/// Decode the record at the start of `bytes`.
fn decode_record(
    bytes: &[u8],
    record_offset: u32,
    prev_key: Option<&Slice>,
    file: &Arc<DbFile>,
) -> Result<PersistentEntry> {
    let mut reader = SliceReader::new(bytes);
    let tag = reader.read_u8()?;
    let prefix_len = reader.read_unsigned()? as usize;
    let tail_len = reader.read_unsigned()? as usize;
    let tail = reader.read_bytes(tail_len)?;

    let key = match prev_key {
        Some(prev) if prefix_len <= prev.len() => {
            let mut key = Vec::with_capacity(prefix_len + tail_len);
            key.extend_from_slice(&prev[..prefix_len]);
            key.extend_from_slice(tail);
            Slice::from_vec(key)
        }
        None if prefix_len == 0 => Slice::from_vec(tail.to_vec()),
        _ => {
            return Err(Error::Format(format!(
                "key prefix of {} bytes has no previous key to borrow from",
                prefix_len
            )))
        }
    };

    let deadline = read_deadline(&mut reader)?;
    let kv = match tag {
        TAG_PUT_VALUE => KeyValue::Put {
            key,
            value: read_persistent_value(&mut reader, file)?,
            deadline,
        },
        TAG_PUT_NO_VALUE => KeyValue::Put {
            key,
            value: Value::None,
            deadline,
        },
        TAG_UPDATE_VALUE => KeyValue::Update {
            key,
            value: read_persistent_value(&mut reader, file)?,
            deadline,
        },
        TAG_UPDATE_NO_VALUE => KeyValue::Update {
            key,
            value: Value::None,
            deadline,
        },
        TAG_REMOVE => KeyValue::Remove { key, deadline },
        TAG_RANGE => {
            let to_key_len = reader.read_unsigned()? as usize;
            let to_key = Slice::from_vec(reader.read_bytes(to_key_len)?.to_vec());
            let from_value = read_from_value(&mut reader, file)?;
            let range_value = read_range_value(&mut reader, file)?;
            KeyValue::Range {
                from_key: key,
                to_key,
                from_value,
                range_value,
            }
        }
        other => return Err(Error::Format(format!("unknown entry tag {}", other))),
    };

    let next_index_offset = reader.read_unsigned()? as u32;
    let next_index_size = reader.read_unsigned()? as u32;
    Ok(PersistentEntry {
        kv,
        index_offset: record_offset,
        next_index_offset,
        next_index_size,
    })
}

/// Forward-only cursor over a segment's index block. Holds one decoded
/// record at a time; after the first record every read fetches exactly
/// the next record's bytes.
pub(crate) struct IndexWalker {
    file: Arc<DbFile>,
    index_offset: u64,
    index_length: u64,
    pos: u64,
    next_size: u32,
    prev_key: Option<Slice>,
}

impl IndexWalker {
    pub(crate) fn from_start(file: Arc<DbFile>, footer: &Footer) -> IndexWalker {
        IndexWalker {
            file,
            index_offset: footer.index_offset,
            index_length: footer.index_length,
            pos: 0,
            next_size: 0,
            prev_key: None,
        }
    }

    /// Resume right after `entry`, which was decoded from the same index.
    pub(crate) fn from_entry(
        file: Arc<DbFile>,
        footer: &Footer,
        entry: &PersistentEntry,
    ) -> IndexWalker {
        let (pos, next_size) = if entry.has_next() {
            (entry.next_index_offset as u64, entry.next_index_size)
        } else {
            (footer.index_length, 0)
        };
        IndexWalker {
            file,
            index_offset: footer.index_offset,
            index_length: footer.index_length,
            pos,
            next_size,
            prev_key: Some(entry.key().clone()),
        }
    }

    /// Byte offset of the next record within the index block, for error
    /// reporting.
    #[inline]
    pub(crate) fn position(&self) -> u64 {
        self.pos
    }

    pub(crate) fn next(&mut self) -> Result<Option<PersistentEntry>> {
        if self.pos >= self.index_length {
            return Ok(None);
        }
        let remaining = (self.index_length - self.pos) as usize;
        let mut window = if self.next_size != 0 {
            (self.next_size as usize).min(remaining)
        } else {
            FIRST_RECORD_WINDOW.min(remaining)
        };

        loop {
            let bytes = self.file.read(self.index_offset + self.pos, window)?;
            match decode_record(&bytes, self.pos as u32, self.prev_key.as_ref(), &self.file) {
                Ok(entry) => {
                    if entry.has_next() && entry.next_index_offset as u64 <= self.pos {
                        return Err(Error::Format(format!(
                            "next record offset {} does not advance past {}",
                            entry.next_index_offset, self.pos
                        )));
                    }
                    self.prev_key = Some(entry.key().clone());
                    if entry.has_next() {
                        self.pos = entry.next_index_offset as u64;
                        self.next_size = entry.next_index_size;
                    } else {
                        self.pos = self.index_length;
                        self.next_size = 0;
                    }
                    return Ok(Some(entry));
                }
                // the record may just cross the read window; widen until
                // the whole tail is in view
                Err(err) => {
                    if window < remaining {
                        window = (window * 2).min(remaining);
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }
}
