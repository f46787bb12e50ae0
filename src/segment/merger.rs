//! Stream-merge of two sorted runs into bounded-size output runs.
//!
//! Cursors advance in lock-step. Equal fixed keys resolve through
//! [`merge::merge_fixed`]; overlapping ranges are split at boundary keys
//! and the still-pending remainder re-enters the cursor it came from, so
//! every emitted entry is final and in key order.

use crate::entry::{FromValue, KeyValue};
use crate::env::KeyComparator;
use crate::segment::format::Stats;
use crate::segment::merge::{
    last_level_resolve, merge_fixed, merge_range_values, HasTimeLeft,
};
use std::cmp::Ordering;
use std::sync::Arc;

pub struct MergeOptions {
    pub min_segment_size: u64,
    /// Cut runs by projected in-memory footprint instead of file size.
    pub for_in_memory: bool,
    /// Deepest level: tombstones and unresolvable entries are dropped.
    pub is_last_level: bool,
    pub bloom_false_positive_rate: f64,
    pub comparator: Arc<dyn KeyComparator>,
    pub has_time_left: HasTimeLeft,
}

/// One output run, sized and bounded by [`Stats`], not yet persisted.
pub struct MergedRun {
    pub entries: Vec<KeyValue>,
    pub stats: Stats,
}

struct Cursor {
    stack: Vec<KeyValue>,
    rest: std::vec::IntoIter<KeyValue>,
}

impl Cursor {
    fn new(entries: Vec<KeyValue>) -> Cursor {
        Cursor {
            stack: Vec::new(),
            rest: entries.into_iter(),
        }
    }

    fn next(&mut self) -> Option<KeyValue> {
        self.stack.pop().or_else(|| self.rest.next())
    }

    fn push(&mut self, kv: KeyValue) {
        self.stack.push(kv);
    }
}

struct RunBuilder<'a> {
    opts: &'a MergeOptions,
    runs: Vec<MergedRun>,
    entries: Vec<KeyValue>,
    stats: Stats,
}

impl<'a> RunBuilder<'a> {
    fn new(opts: &'a MergeOptions) -> RunBuilder<'a> {
        RunBuilder {
            opts,
            runs: Vec::new(),
            entries: Vec::new(),
            stats: Stats::new(),
        }
    }

    fn size_of(&self, stats: &Stats) -> u64 {
        if self.opts.for_in_memory {
            stats.memory_segment_size
        } else {
            stats.segment_size
        }
    }

    /// Emit one resolved entry into the open run, applying the last-level
    /// policy first.
    fn add(&mut self, kv: KeyValue) {
        let kv = if self.opts.is_last_level {
            match last_level_resolve(kv, &self.opts.has_time_left) {
                Some(kv) => kv,
                None => return,
            }
        } else {
            kv
        };
        self.stats.add(&kv);
        self.entries.push(kv);
        if self.size_of(&self.stats) >= self.opts.min_segment_size {
            self.close_current();
        }
    }

    fn close_current(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.runs.push(MergedRun {
            entries: std::mem::take(&mut self.entries),
            stats: std::mem::replace(&mut self.stats, Stats::new()),
        });
    }

    /// A trailing run below the size bound folds into its predecessor, so
    /// an undersized run can only be observed when it is the only one.
    fn finish(mut self) -> Vec<MergedRun> {
        self.close_current();
        if self.runs.len() > 1 {
            let undersized = self
                .runs
                .last()
                .map(|run| self.size_of(&run.stats) < self.opts.min_segment_size)
                .unwrap_or(false);
            if undersized {
                if let Some(last) = self.runs.pop() {
                    debug!(
                        "folding trailing run of {} entries into its predecessor",
                        last.entries.len()
                    );
                    if let Some(previous) = self.runs.last_mut() {
                        for kv in last.entries {
                            previous.stats.add(&kv);
                            previous.entries.push(kv);
                        }
                    }
                }
            }
        }
        self.runs
    }
}

/// Merge `new` over `old`, both in key order, into size-bounded runs.
pub fn merge(new: Vec<KeyValue>, old: Vec<KeyValue>, opts: &MergeOptions) -> Vec<MergedRun> {
    debug!(
        "merging {} new over {} old entries, last_level={}",
        new.len(),
        old.len(),
        opts.is_last_level
    );
    let mut builder = RunBuilder::new(opts);
    let mut new_cur = Cursor::new(new);
    let mut old_cur = Cursor::new(old);

    loop {
        match (new_cur.next(), old_cur.next()) {
            (None, None) => break,
            (Some(n), None) => builder.add(n),
            (None, Some(o)) => builder.add(o),
            (Some(n), Some(o)) => {
                step(n, o, &mut new_cur, &mut old_cur, &mut builder, opts)
            }
        }
    }
    builder.finish()
}

/// Re-split one sorted run, without an old side. Used when flushing a
/// memory level and when refreshing a segment in place.
pub fn split(entries: Vec<KeyValue>, opts: &MergeOptions) -> Vec<MergedRun> {
    let mut builder = RunBuilder::new(opts);
    for kv in entries {
        builder.add(kv);
    }
    builder.finish()
}

fn step(
    n: KeyValue,
    o: KeyValue,
    new_cur: &mut Cursor,
    old_cur: &mut Cursor,
    builder: &mut RunBuilder<'_>,
    opts: &MergeOptions,
) {
    let ord = opts.comparator.as_ref();
    match (n.is_range(), o.is_range()) {
        (false, false) => match ord.compare(n.key(), o.key()) {
            Ordering::Less => {
                old_cur.push(o);
                builder.add(n);
            }
            Ordering::Greater => {
                new_cur.push(n);
                builder.add(o);
            }
            Ordering::Equal => builder.add(merge_fixed(n, o, &opts.has_time_left)),
        },
        (false, true) => new_fixed_over_old_range(n, o, new_cur, old_cur, builder, opts),
        (true, false) => new_range_over_old_fixed(n, o, new_cur, old_cur, builder, opts),
        (true, true) => range_over_range(n, o, new_cur, old_cur, builder, opts),
    }
}

fn new_fixed_over_old_range(
    n: KeyValue,
    o: KeyValue,
    new_cur: &mut Cursor,
    old_cur: &mut Cursor,
    builder: &mut RunBuilder<'_>,
    opts: &MergeOptions,
) {
    let ord = opts.comparator.as_ref();
    let KeyValue::Range {
        from_key,
        to_key,
        from_value,
        range_value,
    } = o
    else {
        unreachable!("old side is a range");
    };

    if ord.compare(n.key(), &from_key) == Ordering::Less {
        old_cur.push(KeyValue::Range {
            from_key,
            to_key,
            from_value,
            range_value,
        });
        builder.add(n);
    } else if ord.compare(n.key(), &to_key) != Ordering::Less {
        // no later old entry can precede the span either
        new_cur.push(n);
        builder.add(KeyValue::Range {
            from_key,
            to_key,
            from_value,
            range_value,
        });
    } else if ord.compare(n.key(), &from_key) == Ordering::Equal {
        // resolve at the span's own from entry and keep the span pending
        let old_at_key = from_value
            .map(|fv| fv.into_key_value(from_key.clone()))
            .unwrap_or_else(|| range_value.clone().into_key_value(from_key.clone()));
        let merged = merge_fixed(n, old_at_key, &opts.has_time_left);
        old_cur.push(KeyValue::Range {
            from_key,
            to_key,
            from_value: FromValue::from_key_value(merged),
            range_value,
        });
    } else {
        // split the span at the new key; the left part is final
        let key = n.key().clone();
        let left = KeyValue::Range {
            from_key,
            to_key: key.clone(),
            from_value,
            range_value: range_value.clone(),
        };
        let old_at_key = range_value.clone().into_key_value(key.clone());
        let merged = merge_fixed(n, old_at_key, &opts.has_time_left);
        old_cur.push(KeyValue::Range {
            from_key: key,
            to_key,
            from_value: FromValue::from_key_value(merged),
            range_value,
        });
        builder.add(left);
    }
}

fn new_range_over_old_fixed(
    n: KeyValue,
    o: KeyValue,
    new_cur: &mut Cursor,
    old_cur: &mut Cursor,
    builder: &mut RunBuilder<'_>,
    opts: &MergeOptions,
) {
    let ord = opts.comparator.as_ref();
    let KeyValue::Range {
        from_key,
        to_key,
        from_value,
        range_value,
    } = n
    else {
        unreachable!("new side is a range");
    };

    if ord.compare(o.key(), &from_key) == Ordering::Less {
        new_cur.push(KeyValue::Range {
            from_key,
            to_key,
            from_value,
            range_value,
        });
        builder.add(o);
    } else if ord.compare(o.key(), &to_key) != Ordering::Less {
        old_cur.push(o);
        builder.add(KeyValue::Range {
            from_key,
            to_key,
            from_value,
            range_value,
        });
    } else if ord.compare(o.key(), &from_key) == Ordering::Equal {
        let new_at_key = from_value
            .clone()
            .map(|fv| fv.into_key_value(from_key.clone()))
            .unwrap_or_else(|| range_value.clone().into_key_value(from_key.clone()));
        let merged = merge_fixed(new_at_key, o, &opts.has_time_left);
        new_cur.push(KeyValue::Range {
            from_key,
            to_key,
            from_value: FromValue::from_key_value(merged),
            range_value,
        });
    } else {
        let key = o.key().clone();
        let left = KeyValue::Range {
            from_key,
            to_key: key.clone(),
            from_value,
            range_value: range_value.clone(),
        };
        let new_at_key = range_value.clone().into_key_value(key.clone());
        let merged = merge_fixed(new_at_key, o, &opts.has_time_left);
        new_cur.push(KeyValue::Range {
            from_key: key,
            to_key,
            from_value: FromValue::from_key_value(merged),
            range_value,
        });
        builder.add(left);
    }
}

fn range_over_range(
    n: KeyValue,
    o: KeyValue,
    new_cur: &mut Cursor,
    old_cur: &mut Cursor,
    builder: &mut RunBuilder<'_>,
    opts: &MergeOptions,
) {
    let ord = opts.comparator.as_ref();
    let KeyValue::Range {
        from_key: n_from,
        to_key: n_to,
        from_value: n_from_value,
        range_value: n_range_value,
    } = n
    else {
        unreachable!("new side is a range");
    };
    let KeyValue::Range {
        from_key: o_from,
        to_key: o_to,
        from_value: o_from_value,
        range_value: o_range_value,
    } = o
    else {
        unreachable!("old side is a range");
    };

    if ord.compare(&n_to, &o_from) != Ordering::Greater {
        // disjoint, new first
        old_cur.push(KeyValue::Range {
            from_key: o_from,
            to_key: o_to,
            from_value: o_from_value,
            range_value: o_range_value,
        });
        builder.add(KeyValue::Range {
            from_key: n_from,
            to_key: n_to,
            from_value: n_from_value,
            range_value: n_range_value,
        });
        return;
    }
    if ord.compare(&o_to, &n_from) != Ordering::Greater {
        // disjoint, old first
        new_cur.push(KeyValue::Range {
            from_key: n_from,
            to_key: n_to,
            from_value: n_from_value,
            range_value: n_range_value,
        });
        builder.add(KeyValue::Range {
            from_key: o_from,
            to_key: o_to,
            from_value: o_from_value,
            range_value: o_range_value,
        });
        return;
    }

    match ord.compare(&n_from, &o_from) {
        Ordering::Less => {
            // the part of new before old starts is final
            let left = KeyValue::Range {
                from_key: n_from,
                to_key: o_from.clone(),
                from_value: n_from_value,
                range_value: n_range_value.clone(),
            };
            new_cur.push(KeyValue::Range {
                from_key: o_from.clone(),
                to_key: n_to,
                from_value: None,
                range_value: n_range_value,
            });
            old_cur.push(KeyValue::Range {
                from_key: o_from,
                to_key: o_to,
                from_value: o_from_value,
                range_value: o_range_value,
            });
            builder.add(left);
        }
        Ordering::Greater => {
            let left = KeyValue::Range {
                from_key: o_from,
                to_key: n_from.clone(),
                from_value: o_from_value,
                range_value: o_range_value.clone(),
            };
            old_cur.push(KeyValue::Range {
                from_key: n_from.clone(),
                to_key: o_to,
                from_value: None,
                range_value: o_range_value,
            });
            new_cur.push(KeyValue::Range {
                from_key: n_from,
                to_key: n_to,
                from_value: n_from_value,
                range_value: n_range_value,
            });
            builder.add(left);
        }
        Ordering::Equal => {
            // aligned heads: resolve [from, min(to)) and push remainders
            let end = if ord.compare(&n_to, &o_to) == Ordering::Less {
                n_to.clone()
            } else {
                o_to.clone()
            };
            let merged_from = match (n_from_value.clone(), o_from_value) {
                (new_fv, Some(old_fv)) => {
                    let new_at_key = new_fv
                        .map(|fv| fv.into_key_value(n_from.clone()))
                        .unwrap_or_else(|| {
                            n_range_value.clone().into_key_value(n_from.clone())
                        });
                    let merged = merge_fixed(
                        new_at_key,
                        old_fv.into_key_value(n_from.clone()),
                        &opts.has_time_left,
                    );
                    FromValue::from_key_value(merged)
                }
                (Some(new_fv), None) => Some(new_fv),
                (None, None) => None,
            };
            let merged_range =
                merge_range_values(n_range_value.clone(), o_range_value.clone(), &opts.has_time_left);
            builder.add(KeyValue::Range {
                from_key: n_from,
                to_key: end.clone(),
                from_value: merged_from,
                range_value: merged_range,
            });
            if ord.compare(&end, &n_to) == Ordering::Less {
                new_cur.push(KeyValue::Range {
                    from_key: end.clone(),
                    to_key: n_to,
                    from_value: None,
                    range_value: n_range_value,
                });
            }
            if ord.compare(&end, &o_to) == Ordering::Less {
                old_cur.push(KeyValue::Range {
                    from_key: end,
                    to_key: o_to,
                    from_value: None,
                    range_value: o_range_value,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::{Deadline, FromValue, KeyValue, RangeValue, Value};
    use crate::env::LexicographicComparator;
    use crate::segment::merge::HasTimeLeft;
    use crate::segment::merger::{merge, split, MergeOptions};
    use crate::slice::Slice;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn put(key: u8, value: u8, deadline: Option<Deadline>) -> KeyValue {
        KeyValue::Put {
            key: Slice::from_vec(vec![key]),
            value: Value::some(vec![value]),
            deadline,
        }
    }

    fn frozen(now: SystemTime) -> HasTimeLeft {
        Arc::new(move |deadline| deadline > now)
    }

    fn opts(min_segment_size: u64, is_last_level: bool) -> MergeOptions {
        MergeOptions {
            min_segment_size,
            for_in_memory: false,
            is_last_level,
            bloom_false_positive_rate: 0.01,
            comparator: Arc::new(LexicographicComparator),
            has_time_left: frozen(SystemTime::now()),
        }
    }

    fn flatten(runs: Vec<crate::segment::merger::MergedRun>) -> Vec<KeyValue> {
        runs.into_iter().flat_map(|run| run.entries).collect()
    }

    #[test]
    fn test_merge_disjoint_keys_is_union() {
        let new = vec![put(1, 1, None), put(5, 5, None)];
        let old = vec![put(2, 2, None), put(4, 4, None), put(9, 9, None)];
        let merged = flatten(merge(new, old, &opts(u64::MAX, false)));
        let keys: Vec<u8> = merged.iter().map(|kv| kv.key()[0]).collect();
        assert_eq!(keys, vec![1, 2, 4, 5, 9]);
    }

    #[test]
    fn test_merge_equal_keys_resolves() {
        // an Update over a Put becomes a Put carrying the old deadline
        let deadline = Some(SystemTime::now() + Duration::from_secs(60));
        let new = vec![KeyValue::Update {
            key: Slice::from_vec(vec![1]),
            value: Value::some(vec![9]),
            deadline: None,
        }];
        let old = vec![put(1, 1, deadline)];
        let merged = flatten(merge(new, old, &opts(u64::MAX, false)));
        assert_eq!(merged, vec![put(1, 9, deadline)]);
    }

    #[test]
    fn test_remove_with_ttl_over_put_accelerates_expiry() {
        let now = SystemTime::now();
        let remove_deadline = Some(now + Duration::from_secs(5));
        let put_deadline = Some(now + Duration::from_secs(20));
        let new = vec![KeyValue::Remove {
            key: Slice::from_vec(vec![1]),
            deadline: remove_deadline,
        }];
        let old = vec![put(1, 1, put_deadline)];
        let mut options = opts(u64::MAX, false);
        options.has_time_left = frozen(now);
        let merged = flatten(merge(new, old, &options));
        assert_eq!(merged, vec![put(1, 1, remove_deadline)]);
    }

    #[test]
    fn test_range_dominates_covered_fixed_entries() {
        // Range [5, 10) updating to 7 over Puts at 5, 7 and 10
        let new = vec![KeyValue::Range {
            from_key: Slice::from_vec(vec![5]),
            to_key: Slice::from_vec(vec![10]),
            from_value: None,
            range_value: RangeValue::Update {
                value: Value::some(vec![7]),
                deadline: None,
            },
        }];
        let old = vec![put(5, 1, None), put(7, 2, None), put(10, 3, None)];
        let merged = flatten(merge(new, old, &opts(u64::MAX, false)));

        assert_eq!(merged.len(), 3);
        // [5, 7): the Put at 5 resolved into the from entry
        match &merged[0] {
            KeyValue::Range {
                from_key,
                to_key,
                from_value: Some(FromValue::Put { value, .. }),
                ..
            } => {
                assert_eq!(from_key.as_bytes(), &[5]);
                assert_eq!(to_key.as_bytes(), &[7]);
                assert_eq!(value.fetch().unwrap().unwrap().as_bytes(), &[7]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        // [7, 10): the Put at 7 resolved into the from entry
        match &merged[1] {
            KeyValue::Range {
                from_key,
                to_key,
                from_value: Some(FromValue::Put { value, .. }),
                ..
            } => {
                assert_eq!(from_key.as_bytes(), &[7]);
                assert_eq!(to_key.as_bytes(), &[10]);
                assert_eq!(value.fetch().unwrap().unwrap().as_bytes(), &[7]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        // the Put at the exclusive bound is untouched
        assert_eq!(merged[2], put(10, 3, None));
    }

    #[test]
    fn test_range_dominates_at_last_level_collapses_to_puts() {
        let new = vec![KeyValue::Range {
            from_key: Slice::from_vec(vec![5]),
            to_key: Slice::from_vec(vec![10]),
            from_value: None,
            range_value: RangeValue::Update {
                value: Value::some(vec![7]),
                deadline: None,
            },
        }];
        let old = vec![put(5, 1, None), put(7, 2, None), put(10, 3, None)];
        let merged = flatten(merge(new, old, &opts(u64::MAX, true)));
        assert_eq!(
            merged,
            vec![put(5, 7, None), put(7, 7, None), put(10, 3, None)]
        );
    }

    #[test]
    fn test_overlapping_ranges_split_at_boundaries() {
        let new = vec![KeyValue::Range {
            from_key: Slice::from_vec(vec![2]),
            to_key: Slice::from_vec(vec![8]),
            from_value: None,
            range_value: RangeValue::Remove { deadline: None },
        }];
        let old = vec![KeyValue::Range {
            from_key: Slice::from_vec(vec![5]),
            to_key: Slice::from_vec(vec![12]),
            from_value: None,
            range_value: RangeValue::Update {
                value: Value::some(vec![1]),
                deadline: None,
            },
        }];
        let merged = flatten(merge(new, old, &opts(u64::MAX, false)));

        let bounds: Vec<(u8, u8)> = merged
            .iter()
            .map(|kv| match kv {
                KeyValue::Range {
                    from_key, to_key, ..
                } => (from_key[0], to_key[0]),
                other => panic!("unexpected: {:?}", other),
            })
            .collect();
        assert_eq!(bounds, vec![(2, 5), (5, 8), (8, 12)]);

        // the overlap composes new over old: Remove over Update
        match &merged[1] {
            KeyValue::Range {
                range_value: RangeValue::Remove { deadline: None },
                ..
            } => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_expired_put_dropped_at_last_level() {
        let now = SystemTime::now();
        let expired = Some(now - Duration::from_secs(1));
        let mut options = opts(u64::MAX, true);
        options.has_time_left = frozen(now);
        let runs = merge(vec![put(1, 1, expired)], Vec::new(), &options);
        assert!(runs.is_empty());
    }

    #[test]
    fn test_split_by_size() {
        let entries: Vec<KeyValue> = (0..100).map(|i| put(i, i, None)).collect();

        // one byte per segment: every entry closes a run
        let runs = split(entries.clone(), &opts(1, false));
        assert_eq!(runs.len(), 100);
        for run in &runs {
            assert_eq!(run.entries.len(), 1);
        }

        // large bound: a single run
        let runs = split(entries.clone(), &opts(u64::MAX, false));
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].entries.len(), 100);

        // intermediate bound: every run except possibly the last reaches
        // the bound, and a small trailing run folds into its predecessor
        let runs = split(entries, &opts(256, false));
        assert!(runs.len() > 1);
        for run in &runs[..runs.len() - 1] {
            assert!(run.stats.segment_size >= 256);
        }
        let total: usize = runs.iter().map(|run| run.entries.len()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_trailing_run_folds_into_previous() {
        // sized so the last entry alone would form an undersized run
        let entries: Vec<KeyValue> = (0..7).map(|i| put(i, i, None)).collect();
        let per_entry = {
            let probe = split(vec![put(0, 0, None)], &opts(u64::MAX, false));
            probe[0].stats.segment_size
        };
        let runs = split(entries, &opts(per_entry * 2, false));
        for run in &runs {
            assert!(run.entries.len() >= 2);
        }
        let total: usize = runs.iter().map(|run| run.entries.len()).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let now = SystemTime::now();
        let deadline = Some(now + Duration::from_secs(30));
        let new = vec![
            put(1, 1, None),
            KeyValue::Remove {
                key: Slice::from_vec(vec![3]),
                deadline,
            },
            KeyValue::Range {
                from_key: Slice::from_vec(vec![5]),
                to_key: Slice::from_vec(vec![9]),
                from_value: None,
                range_value: RangeValue::Remove { deadline: None },
            },
        ];
        let old = vec![put(3, 3, None), put(6, 6, None)];

        let mut options = opts(u64::MAX, false);
        options.has_time_left = frozen(now);
        let first = flatten(merge(new.clone(), old.clone(), &options));
        let second = flatten(merge(new, old, &options));
        assert_eq!(first, second);
    }
}
