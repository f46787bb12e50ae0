//! Entry variants stored in segments.
//!
//! Fixed entries (`Put`, `Update`, `Remove`) cover a single key; `Range`
//! covers `[from_key, to_key)`. Values are either materialized in memory
//! or fetched lazily from a segment file through `(offset, length)`.

use crate::file::DbFile;
use crate::slice::Slice;
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Absolute moment at which an entry becomes invisible. `None` everywhere
/// in this crate means immortal.
pub type Deadline = SystemTime;

pub fn deadline_to_millis(deadline: Deadline) -> u64 {
    match deadline.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as u64,
        Err(_) => 0,
    }
}

pub fn millis_to_deadline(millis: u64) -> Deadline {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// `true` when at least `min_left` remains before `deadline`.
pub fn has_time_left_at_least(deadline: Deadline, min_left: Duration) -> bool {
    match deadline.duration_since(SystemTime::now()) {
        Ok(left) => left >= min_left,
        Err(_) => false,
    }
}

/// The sooner of two optional deadlines; `None` only when both are absent.
pub fn min_deadline(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// A value in one of its two representations.
#[derive(Clone)]
pub enum Value {
    None,
    /// Materialized in RAM.
    Memory(Slice),
    /// Held in a segment file, fetched on demand.
    Persistent {
        offset: u64,
        length: u32,
        file: Arc<DbFile>,
    },
}

impl Value {
    pub fn some(bytes: impl Into<Slice>) -> Value {
        Value::Memory(bytes.into())
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Length of the raw value bytes.
    pub fn value_len(&self) -> u32 {
        match self {
            Value::None => 0,
            Value::Memory(bytes) => bytes.len() as u32,
            Value::Persistent { length, .. } => *length,
        }
    }

    /// Fetch-or-get: memory values are returned as-is, persistent values
    /// read from their segment file.
    pub fn fetch(&self) -> Result<Option<Slice>> {
        match self {
            Value::None => Ok(None),
            Value::Memory(bytes) => Ok(Some(bytes.clone())),
            Value::Persistent {
                offset,
                length,
                file,
            } => Ok(Some(file.read(*offset, *length as usize)?)),
        }
    }

    /// Materialize a persistent value into its memory representation.
    pub fn to_memory(&self) -> Result<Value> {
        match self.fetch()? {
            Some(bytes) => Ok(Value::Memory(bytes)),
            None => Ok(Value::None),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Memory(a), Value::Memory(b)) => a == b,
            (
                Value::Persistent {
                    offset: ao,
                    length: al,
                    file: af,
                },
                Value::Persistent {
                    offset: bo,
                    length: bl,
                    file: bf,
                },
            ) => ao == bo && al == bl && Arc::ptr_eq(af, bf),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Memory(bytes) => write!(f, "Memory({:?})", bytes.as_bytes()),
            Value::Persistent { offset, length, .. } => {
                write!(f, "Persistent({}+{})", offset, length)
            }
        }
    }
}

/// Fixed-shaped value applying exactly at a range's `from_key`.
#[derive(Clone, Debug, PartialEq)]
pub enum FromValue {
    Put {
        value: Value,
        deadline: Option<Deadline>,
    },
    Update {
        value: Value,
        deadline: Option<Deadline>,
    },
    Remove {
        deadline: Option<Deadline>,
    },
}

impl FromValue {
    pub fn deadline(&self) -> Option<Deadline> {
        match self {
            FromValue::Put { deadline, .. }
            | FromValue::Update { deadline, .. }
            | FromValue::Remove { deadline } => *deadline,
        }
    }

    /// Re-key into a fixed entry, for per-key merging at `from_key`.
    pub fn into_key_value(self, key: Slice) -> KeyValue {
        match self {
            FromValue::Put { value, deadline } => KeyValue::Put {
                key,
                value,
                deadline,
            },
            FromValue::Update { value, deadline } => KeyValue::Update {
                key,
                value,
                deadline,
            },
            FromValue::Remove { deadline } => KeyValue::Remove { key, deadline },
        }
    }

    /// The fixed entry back into from-value shape. `None` for ranges.
    pub fn from_key_value(kv: KeyValue) -> Option<FromValue> {
        match kv {
            KeyValue::Put {
                value, deadline, ..
            } => Some(FromValue::Put { value, deadline }),
            KeyValue::Update {
                value, deadline, ..
            } => Some(FromValue::Update { value, deadline }),
            KeyValue::Remove { deadline, .. } => Some(FromValue::Remove { deadline }),
            KeyValue::Range { .. } => None,
        }
    }
}

/// Fixed-shaped value applying across a range's span. A span-wide Put
/// would materialize keys that never existed, so the span is limited to
/// Update and Remove.
#[derive(Clone, Debug, PartialEq)]
pub enum RangeValue {
    Update {
        value: Value,
        deadline: Option<Deadline>,
    },
    Remove {
        deadline: Option<Deadline>,
    },
}

impl RangeValue {
    pub fn deadline(&self) -> Option<Deadline> {
        match self {
            RangeValue::Update { deadline, .. } | RangeValue::Remove { deadline } => *deadline,
        }
    }

    /// Re-key into a fixed entry, for per-key resolution inside the span.
    pub fn into_key_value(self, key: Slice) -> KeyValue {
        match self {
            RangeValue::Update { value, deadline } => KeyValue::Update {
                key,
                value,
                deadline,
            },
            RangeValue::Remove { deadline } => KeyValue::Remove { key, deadline },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeyValue {
    /// Authoritative value for a key.
    Put {
        key: Slice,
        value: Value,
        deadline: Option<Deadline>,
    },
    /// Conditional value: visible only over an earlier Put.
    Update {
        key: Slice,
        value: Value,
        deadline: Option<Deadline>,
    },
    /// Tombstone; a deadline makes it a pending expiry instead of an
    /// immediate delete.
    Remove {
        key: Slice,
        deadline: Option<Deadline>,
    },
    /// Covers `[from_key, to_key)`.
    Range {
        from_key: Slice,
        to_key: Slice,
        from_value: Option<FromValue>,
        range_value: RangeValue,
    },
}

impl KeyValue {
    /// The ordering key: a fixed entry's key, or a range's `from_key`.
    #[inline]
    pub fn key(&self) -> &Slice {
        match self {
            KeyValue::Put { key, .. }
            | KeyValue::Update { key, .. }
            | KeyValue::Remove { key, .. } => key,
            KeyValue::Range { from_key, .. } => from_key,
        }
    }

    #[inline]
    pub fn is_range(&self) -> bool {
        matches!(self, KeyValue::Range { .. })
    }

    /// Earliest deadline carried anywhere in this entry.
    pub fn nearest_deadline(&self) -> Option<Deadline> {
        match self {
            KeyValue::Put { deadline, .. }
            | KeyValue::Update { deadline, .. }
            | KeyValue::Remove { deadline, .. } => *deadline,
            KeyValue::Range {
                from_value,
                range_value,
                ..
            } => min_deadline(
                from_value.as_ref().and_then(|fv| fv.deadline()),
                range_value.deadline(),
            ),
        }
    }

    /// Materialize every lazy value.
    pub fn to_memory(&self) -> Result<KeyValue> {
        let kv = match self {
            KeyValue::Put {
                key,
                value,
                deadline,
            } => KeyValue::Put {
                key: key.clone(),
                value: value.to_memory()?,
                deadline: *deadline,
            },
            KeyValue::Update {
                key,
                value,
                deadline,
            } => KeyValue::Update {
                key: key.clone(),
                value: value.to_memory()?,
                deadline: *deadline,
            },
            KeyValue::Remove { key, deadline } => KeyValue::Remove {
                key: key.clone(),
                deadline: *deadline,
            },
            KeyValue::Range {
                from_key,
                to_key,
                from_value,
                range_value,
            } => KeyValue::Range {
                from_key: from_key.clone(),
                to_key: to_key.clone(),
                from_value: match from_value {
                    Some(FromValue::Put { value, deadline }) => Some(FromValue::Put {
                        value: value.to_memory()?,
                        deadline: *deadline,
                    }),
                    Some(FromValue::Update { value, deadline }) => Some(FromValue::Update {
                        value: value.to_memory()?,
                        deadline: *deadline,
                    }),
                    Some(FromValue::Remove { deadline }) => {
                        Some(FromValue::Remove { deadline: *deadline })
                    }
                    None => None,
                },
                range_value: match range_value {
                    RangeValue::Update { value, deadline } => RangeValue::Update {
                        value: value.to_memory()?,
                        deadline: *deadline,
                    },
                    RangeValue::Remove { deadline } => {
                        RangeValue::Remove { deadline: *deadline }
                    }
                },
            },
        };
        Ok(kv)
    }
}

/// An entry decoded from a segment's index block, carrying the offsets the
/// matcher and the cache adjacency test need.
#[derive(Clone, Debug)]
pub struct PersistentEntry {
    pub kv: KeyValue,
    /// Offset of this record within the index block.
    pub index_offset: u32,
    /// Offset of the next record, 0 for the final record.
    pub next_index_offset: u32,
    /// Size of the next record, 0 for the final record.
    pub next_index_size: u32,
}

impl PersistentEntry {
    #[inline]
    pub fn key(&self) -> &Slice {
        self.kv.key()
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.next_index_size != 0
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::{
        deadline_to_millis, has_time_left_at_least, millis_to_deadline, min_deadline, FromValue,
        KeyValue, RangeValue, Value,
    };
    use crate::slice::Slice;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_deadline_millis_round_trip() {
        let deadline = millis_to_deadline(1_650_000_000_123);
        assert_eq!(deadline_to_millis(deadline), 1_650_000_000_123);
    }

    #[test]
    fn test_min_deadline() {
        let sooner = SystemTime::now();
        let later = sooner + Duration::from_secs(60);
        assert_eq!(min_deadline(Some(later), Some(sooner)), Some(sooner));
        assert_eq!(min_deadline(None, Some(later)), Some(later));
        assert_eq!(min_deadline(None, None), None);
    }

    #[test]
    fn test_has_time_left() {
        let deadline = SystemTime::now() + Duration::from_secs(60);
        assert!(has_time_left_at_least(deadline, Duration::from_secs(10)));
        assert!(!has_time_left_at_least(deadline, Duration::from_secs(120)));
        let expired = SystemTime::now() - Duration::from_secs(1);
        assert!(!has_time_left_at_least(expired, Duration::ZERO));
    }

    #[test]
    fn test_range_nearest_deadline() {
        let sooner = SystemTime::now();
        let later = sooner + Duration::from_secs(5);
        let range = KeyValue::Range {
            from_key: Slice::from_vec(vec![1]),
            to_key: Slice::from_vec(vec![9]),
            from_value: Some(FromValue::Put {
                value: Value::some(vec![7]),
                deadline: Some(later),
            }),
            range_value: RangeValue::Remove {
                deadline: Some(sooner),
            },
        };
        assert_eq!(range.nearest_deadline(), Some(sooner));
        assert_eq!(range.key().as_bytes(), &[1]);
        assert!(range.is_range());
    }
}
