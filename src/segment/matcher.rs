//! Index walks answering Get / Lower / Higher.
//!
//! Every walk is monotonic: the cursor only moves forward, at most the
//! current and previous decoded entries are held, and the walk ends the
//! moment a decision is possible or the index runs out.

use crate::entry::{KeyValue, PersistentEntry};
use crate::env::KeyComparator;
use crate::segment::format::IndexWalker;
use crate::Result;
use std::cmp::Ordering;

/// How `target` relates to one decoded entry.
struct Probe {
    /// entry key (a range's from key) versus target
    key_cmp: Ordering,
    /// for ranges: target versus the exclusive to key
    target_to_cmp: Option<Ordering>,
}

fn probe(entry: &PersistentEntry, target: &[u8], ord: &dyn KeyComparator) -> Probe {
    Probe {
        key_cmp: ord.compare(entry.key(), target),
        target_to_cmp: match &entry.kv {
            KeyValue::Range { to_key, .. } => Some(ord.compare(target, to_key)),
            _ => None,
        },
    }
}

/// First entry matching `target`: a fixed entry with the same key or a
/// range containing it.
pub(crate) fn find_get(
    target: &[u8],
    walker: &mut IndexWalker,
    ord: &dyn KeyComparator,
) -> Result<Option<PersistentEntry>> {
    while let Some(entry) = walker.next()? {
        let probe = probe(&entry, target, ord);
        match probe.target_to_cmp {
            Some(to_cmp) => {
                if probe.key_cmp != Ordering::Greater && to_cmp == Ordering::Less {
                    return Ok(Some(entry));
                }
                if probe.key_cmp == Ordering::Greater {
                    return Ok(None);
                }
            }
            None => match probe.key_cmp {
                Ordering::Equal => return Ok(Some(entry)),
                Ordering::Greater => return Ok(None),
                Ordering::Less => {}
            },
        }
    }
    Ok(None)
}

/// Last entry below `target`. A range containing `target`, or ending
/// exactly at it, is that range. `candidate` seeds the walk when the
/// caller already holds an entry known to be below `target`.
pub(crate) fn find_lower(
    target: &[u8],
    walker: &mut IndexWalker,
    ord: &dyn KeyComparator,
    candidate: Option<PersistentEntry>,
) -> Result<Option<PersistentEntry>> {
    let mut candidate = candidate;
    while let Some(entry) = walker.next()? {
        let probe = probe(&entry, target, ord);
        match probe.target_to_cmp {
            Some(to_cmp) => match probe.key_cmp {
                Ordering::Less => {
                    if to_cmp == Ordering::Less {
                        // target inside the span
                        return Ok(Some(entry));
                    }
                    candidate = Some(entry);
                }
                Ordering::Equal => {
                    if to_cmp == Ordering::Less {
                        return Ok(Some(entry));
                    }
                    return Ok(candidate);
                }
                Ordering::Greater => return Ok(candidate),
            },
            None => match probe.key_cmp {
                Ordering::Less => candidate = Some(entry),
                _ => return Ok(candidate),
            },
        }
    }
    Ok(candidate)
}

/// First entry above `target`. A range containing `target` extends past
/// it and is therefore the higher.
pub(crate) fn find_higher(
    target: &[u8],
    walker: &mut IndexWalker,
    ord: &dyn KeyComparator,
) -> Result<Option<PersistentEntry>> {
    while let Some(entry) = walker.next()? {
        let probe = probe(&entry, target, ord);
        if probe.key_cmp == Ordering::Greater {
            return Ok(Some(entry));
        }
        if probe.target_to_cmp == Some(Ordering::Less) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}
