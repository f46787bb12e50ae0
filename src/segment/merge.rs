//! Collision resolution between a new and an old entry for one key.
//!
//! "New" always comes from the upper level. The resolution is total over
//! the fixed variants; ranges are decomposed by the segment merger and
//! resolved here one key at a time.

use crate::entry::{min_deadline, Deadline, FromValue, KeyValue, RangeValue};
use std::sync::Arc;
use std::time::Duration;

/// Injected time source: `true` when `deadline` still has enough time
/// left to be worth carrying forward. Merges are deterministic given the
/// same predicate.
pub type HasTimeLeft = Arc<dyn Fn(Deadline) -> bool + Send + Sync>;

/// Wall-clock predicate requiring at least `min_left` before expiry.
pub fn wall_clock_time_left(min_left: Duration) -> HasTimeLeft {
    Arc::new(move |deadline| crate::entry::has_time_left_at_least(deadline, min_left))
}

fn is_expired(deadline: Option<Deadline>, has_time_left: &HasTimeLeft) -> bool {
    match deadline {
        Some(deadline) => !has_time_left(deadline),
        None => false,
    }
}

/// Resolve two fixed entries carrying the same key.
pub(crate) fn merge_fixed(
    new: KeyValue,
    old: KeyValue,
    has_time_left: &HasTimeLeft,
) -> KeyValue {
    debug_assert!(!new.is_range() && !old.is_range());
    debug_assert!(new.key() == old.key());

    match (new, old) {
        // a new Put is authoritative over anything older
        (put @ KeyValue::Put { .. }, _) => put,

        // the Update resolves over the Put; it may clear the value but
        // only tightens or inherits the TTL
        (
            KeyValue::Update {
                key,
                value,
                deadline: new_deadline,
            },
            KeyValue::Put {
                deadline: old_deadline,
                ..
            },
        ) => KeyValue::Put {
            key,
            value,
            deadline: new_deadline.or(old_deadline),
        },

        (
            KeyValue::Update {
                key,
                value,
                deadline: new_deadline,
            },
            KeyValue::Update {
                deadline: old_deadline,
                ..
            },
        ) => KeyValue::Update {
            key,
            value,
            deadline: min_deadline(new_deadline, old_deadline),
        },

        // nothing below the tombstone for the Update to resolve against
        (
            KeyValue::Update { key, .. },
            KeyValue::Remove {
                deadline: old_deadline,
                ..
            },
        ) => KeyValue::Remove {
            key,
            deadline: old_deadline,
        },

        (
            KeyValue::Remove {
                key,
                deadline: remove_deadline,
            },
            KeyValue::Put {
                value,
                deadline: put_deadline,
                ..
            },
        ) => match remove_deadline {
            // immediate delete
            None => KeyValue::Remove {
                key,
                deadline: None,
            },
            Some(deadline) if !has_time_left(deadline) => KeyValue::Remove {
                key,
                deadline: Some(deadline),
            },
            // a pending expiry only accelerates the Put's own deadline
            Some(deadline) => KeyValue::Put {
                key,
                value,
                deadline: min_deadline(Some(deadline), put_deadline),
            },
        },

        (
            KeyValue::Remove {
                key,
                deadline: remove_deadline,
            },
            KeyValue::Update {
                value,
                deadline: update_deadline,
                ..
            },
        ) => match remove_deadline {
            None => KeyValue::Remove {
                key,
                deadline: None,
            },
            Some(deadline) if !has_time_left(deadline) => KeyValue::Remove {
                key,
                deadline: Some(deadline),
            },
            Some(deadline) => KeyValue::Update {
                key,
                value,
                deadline: min_deadline(Some(deadline), update_deadline),
            },
        },

        (
            KeyValue::Remove {
                key,
                deadline: new_deadline,
            },
            KeyValue::Remove {
                deadline: old_deadline,
                ..
            },
        ) => KeyValue::Remove {
            key,
            deadline: min_deadline(new_deadline, old_deadline),
        },

        (new, old) => {
            // ranges never reach this table
            debug_assert!(false, "merge_fixed on {:?} over {:?}", new, old);
            new
        }
    }
}

/// Compose the span-wide values of two overlapping ranges, new over old.
pub(crate) fn merge_range_values(
    new: RangeValue,
    old: RangeValue,
    has_time_left: &HasTimeLeft,
) -> RangeValue {
    let key = crate::slice::Slice::empty();
    let merged = merge_fixed(
        new.into_key_value(key.clone()),
        old.into_key_value(key),
        has_time_left,
    );
    match merged {
        KeyValue::Update {
            value, deadline, ..
        } => RangeValue::Update { value, deadline },
        KeyValue::Remove { deadline, .. } => RangeValue::Remove { deadline },
        // Update/Remove shapes can only resolve to Update or Remove
        other => {
            debug_assert!(false, "range values resolved to {:?}", other);
            RangeValue::Remove { deadline: None }
        }
    }
}

/// Last-level output policy: deadline-less or expired tombstones and
/// conditionals with nothing below them vanish, expired Puts vanish,
/// ranges collapse to their visible from-entry. A tombstone whose
/// deadline is still ahead is a pending expiry and survives.
pub(crate) fn last_level_resolve(
    kv: KeyValue,
    has_time_left: &HasTimeLeft,
) -> Option<KeyValue> {
    match kv {
        KeyValue::Put { ref deadline, .. } => {
            if is_expired(*deadline, has_time_left) {
                None
            } else {
                Some(kv)
            }
        }
        KeyValue::Update { .. } => None,
        KeyValue::Remove { ref deadline, .. } => {
            if deadline.is_none() || is_expired(*deadline, has_time_left) {
                None
            } else {
                Some(kv)
            }
        }
        KeyValue::Range {
            from_key,
            from_value,
            ..
        } => match from_value {
            Some(FromValue::Put { value, deadline }) => {
                if is_expired(deadline, has_time_left) {
                    None
                } else {
                    Some(KeyValue::Put {
                        key: from_key,
                        value,
                        deadline,
                    })
                }
            }
            _ => None,
        },
    }
}
