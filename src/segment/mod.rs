//! Read-only sorted runs persisted one per file.
//!
//! A segment answers point and neighbor queries through its bloom
//! filter, an in-memory entry cache and forward walks over the on-disk
//! index. New segments are only ever produced by merging or splitting
//! existing runs; a written file is never mutated.

pub(crate) mod footer;
pub(crate) mod format;
mod matcher;
pub mod merge;
pub mod merger;

pub use format::Stats;
pub use merge::{wall_clock_time_left, HasTimeLeft};
pub use merger::{MergeOptions, MergedRun};

use crate::config::SegmentConfig;
use crate::entry::{Deadline, KeyValue, PersistentEntry};
use crate::env::{
    CacheListener, FileOpenListener, KeyComparator, PathsDistributor, SegmentIdGenerator,
};
use crate::error::Error;
use crate::file::DbFile;
use crate::slice::Slice;
use crate::Result;
use crossbeam_skiplist::SkipMap;
use footer::Footer;
use format::IndexWalker;
use std::cmp::Ordering;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Upper bound of a segment: the last fixed entry's key, or the last
/// range's exclusive `to` key.
#[derive(Clone, Debug, PartialEq)]
pub enum MaxKey {
    Fixed(Slice),
    Range { from: Slice, to: Slice },
}

impl MaxKey {
    /// `true` when `key` lies beyond every key this segment covers.
    fn rejects(&self, key: &[u8], ord: &dyn KeyComparator) -> bool {
        match self {
            MaxKey::Fixed(max) => ord.compare(key, max) == Ordering::Greater,
            MaxKey::Range { to, .. } => ord.compare(key, to) != Ordering::Less,
        }
    }

    /// `true` when no entry above `key` can exist in this segment.
    fn rejects_higher(&self, key: &[u8], ord: &dyn KeyComparator) -> bool {
        match self {
            MaxKey::Fixed(max) => ord.compare(key, max) != Ordering::Less,
            MaxKey::Range { to, .. } => ord.compare(key, to) != Ordering::Less,
        }
    }
}

/// Everything the level orchestrator injects into segments it owns.
pub struct SegmentContext {
    pub config: SegmentConfig,
    pub comparator: Arc<dyn KeyComparator>,
    pub id_generator: Arc<dyn SegmentIdGenerator>,
    pub paths: Arc<dyn PathsDistributor>,
    pub on_open: Option<FileOpenListener>,
    pub on_cache: Option<CacheListener>,
}

/// Cache key ordered by the injected comparator.
struct CacheKey {
    key: Slice,
    ord: Arc<dyn KeyComparator>,
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &CacheKey) -> bool {
        self.ord.compare(&self.key, &other.key) == Ordering::Equal
    }
}

impl Eq for CacheKey {}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &CacheKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &CacheKey) -> Ordering {
        self.ord.compare(&self.key, &other.key)
    }
}

pub struct Segment {
    path: PathBuf,
    file: Arc<DbFile>,
    ctx: Arc<SegmentContext>,
    min_key: Slice,
    max_key: MaxKey,
    segment_size: u64,
    key_value_count: u64,
    has_range: bool,
    nearest_expiry_deadline: Option<Deadline>,
    /// Set on last-level segments; merges through this segment drop
    /// tombstones.
    remove_deletes: bool,
    footer: RwLock<Option<Arc<Footer>>>,
    cache: SkipMap<CacheKey, PersistentEntry>,
}

impl Segment {
    /// Reopen a segment file, deriving its bounds and nearest expiry with
    /// one index scan.
    pub fn open(
        path: impl Into<PathBuf>,
        ctx: Arc<SegmentContext>,
        remove_deletes: bool,
    ) -> Result<Segment> {
        let path = path.into();
        let file = Arc::new(DbFile::open_read(
            &path,
            ctx.config.mmap_reads,
            ctx.on_open.clone(),
        ));
        let footer = Arc::new(Footer::read(&file)?);

        let mut stats = Stats::new();
        let mut walker = IndexWalker::from_start(file.clone(), &footer);
        loop {
            match walker.next() {
                Ok(Some(entry)) => stats.add(&entry.kv),
                Ok(None) => break,
                Err(err) => {
                    if ctx.config.drop_corrupted_tail_entries {
                        warn!(
                            "{}, keeping {} entries",
                            Error::CorruptedTailEntries {
                                path: path.clone(),
                                offset: footer.index_offset + walker.position(),
                            },
                            stats.key_value_count
                        );
                        break;
                    }
                    return Err(err);
                }
            }
        }

        let min_key = stats
            .min_key
            .clone()
            .ok_or_else(|| Error::Format(format!("segment {:?} holds no entries", path)))?;
        let max_key = stats
            .max_key
            .clone()
            .ok_or_else(|| Error::Format(format!("segment {:?} holds no entries", path)))?;
        let segment_size = file.file_size()?;

        Ok(Segment {
            path,
            file,
            ctx,
            min_key,
            max_key,
            segment_size,
            key_value_count: stats.key_value_count,
            has_range: stats.has_range,
            nearest_expiry_deadline: stats.nearest_deadline,
            remove_deletes,
            footer: RwLock::new(Some(footer)),
            cache: SkipMap::new(),
        })
    }

    /// A segment freshly written from a merged run; bounds come from its
    /// stats, no rescan needed.
    fn from_run(
        path: PathBuf,
        file: Arc<DbFile>,
        stats: Stats,
        ctx: Arc<SegmentContext>,
        remove_deletes: bool,
    ) -> Result<Segment> {
        let min_key = stats
            .min_key
            .clone()
            .ok_or_else(|| Error::Format("cannot persist an empty run".into()))?;
        let max_key = stats
            .max_key
            .clone()
            .ok_or_else(|| Error::Format("cannot persist an empty run".into()))?;
        let segment_size = file.file_size()?;
        Ok(Segment {
            path,
            file,
            ctx,
            min_key,
            max_key,
            segment_size,
            key_value_count: stats.key_value_count,
            has_range: stats.has_range,
            nearest_expiry_deadline: stats.nearest_deadline,
            remove_deletes,
            footer: RwLock::new(None),
            cache: SkipMap::new(),
        })
    }

    fn lock_err() -> Error {
        Error::Format("segment footer lock poisoned".into())
    }

    fn footer(&self) -> Result<Arc<Footer>> {
        if let Some(footer) = self
            .footer
            .read()
            .map_err(|_| Self::lock_err())?
            .clone()
        {
            return Ok(footer);
        }
        // a losing concurrent loader re-parses; the footer is
        // content-identical
        let parsed = Arc::new(Footer::read(&self.file)?);
        *self.footer.write().map_err(|_| Self::lock_err())? = Some(parsed.clone());
        Ok(parsed)
    }

    fn cache_query(&self, key: &[u8]) -> CacheKey {
        CacheKey {
            key: Slice::from(key),
            ord: self.ctx.comparator.clone(),
        }
    }

    /// Greatest cached entry at or below `key`.
    fn cache_floor(&self, key: &[u8]) -> Option<PersistentEntry> {
        let q = self.cache_query(key);
        self.cache
            .upper_bound(Bound::Included(&q))
            .map(|entry| entry.value().clone())
    }

    fn install(&self, entry: PersistentEntry) {
        if !self.ctx.config.cache_keys_on_read {
            return;
        }
        let key = entry.key().clone();
        self.cache.insert(
            CacheKey {
                key: key.clone(),
                ord: self.ctx.comparator.clone(),
            },
            entry,
        );
        if let Some(listener) = &self.ctx.on_cache {
            listener(&key, &self.path);
        }
    }

    fn install_found(&self, found: Option<PersistentEntry>) -> Result<Option<KeyValue>> {
        Ok(found.map(|entry| {
            let kv = entry.kv.clone();
            self.install(entry);
            kv
        }))
    }

    /// Point lookup: the fixed entry with this key, or the range
    /// containing it.
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        let ord = self.ctx.comparator.as_ref();
        if ord.compare(key, &self.min_key) == Ordering::Less || self.max_key.rejects(key, ord) {
            return Ok(None);
        }
        if !self.might_contain(key)? {
            return Ok(None);
        }

        let floor = self.cache_floor(key);
        if let Some(entry) = &floor {
            match &entry.kv {
                KeyValue::Range { to_key, .. } => {
                    if ord.compare(key, to_key) == Ordering::Less {
                        return Ok(Some(entry.kv.clone()));
                    }
                }
                _ => {
                    if ord.compare(entry.key(), key) == Ordering::Equal {
                        return Ok(Some(entry.kv.clone()));
                    }
                }
            }
        }

        let footer = self.footer()?;
        let mut walker = match &floor {
            Some(entry) => IndexWalker::from_entry(self.file.clone(), &footer, entry),
            None => IndexWalker::from_start(self.file.clone(), &footer),
        };
        self.install_found(matcher::find_get(key, &mut walker, ord)?)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Last entry strictly below `key` (a range containing `key` or
    /// ending at it counts).
    pub fn lower(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        let ord = self.ctx.comparator.as_ref();
        if ord.compare(key, &self.min_key) != Ordering::Greater {
            return Ok(None);
        }

        let q = self.cache_query(key);
        let ceiling = self
            .cache
            .lower_bound(Bound::Included(&q))
            .map(|entry| entry.value().clone());
        if let Some(entry) = &ceiling {
            // a range starting exactly at the key still contains it
            if ord.compare(entry.key(), key) == Ordering::Equal {
                if let KeyValue::Range { to_key, .. } = &entry.kv {
                    if ord.compare(key, to_key) == Ordering::Less {
                        return Ok(Some(entry.kv.clone()));
                    }
                }
            }
        }

        let candidate = self
            .cache
            .upper_bound(Bound::Excluded(&q))
            .map(|entry| entry.value().clone());
        if let Some(low) = &candidate {
            if let KeyValue::Range { to_key, .. } = &low.kv {
                // nothing can sit between a range and its to key
                if ord.compare(key, to_key) != Ordering::Greater {
                    return Ok(Some(low.kv.clone()));
                }
            }
            if let Some(ceil) = &ceiling {
                // adjacency proof: no uncached entry hides between the two
                if low.has_next() && low.next_index_offset == ceil.index_offset {
                    return Ok(Some(low.kv.clone()));
                }
            }
            let footer = self.footer()?;
            let mut walker = IndexWalker::from_entry(self.file.clone(), &footer, low);
            let found = matcher::find_lower(key, &mut walker, ord, Some(low.clone()))?;
            return self.install_found(found);
        }

        let footer = self.footer()?;
        let mut walker = IndexWalker::from_start(self.file.clone(), &footer);
        self.install_found(matcher::find_lower(key, &mut walker, ord, None)?)
    }

    /// First entry strictly above `key` (a range containing `key`
    /// counts).
    pub fn higher(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        let ord = self.ctx.comparator.as_ref();
        if self.max_key.rejects_higher(key, ord) {
            return Ok(None);
        }

        let floor = self.cache_floor(key);
        if let Some(entry) = &floor {
            if let KeyValue::Range { to_key, .. } = &entry.kv {
                if ord.compare(key, to_key) == Ordering::Less {
                    return Ok(Some(entry.kv.clone()));
                }
            }
            let q = self.cache_query(key);
            if let Some(high) = self
                .cache
                .lower_bound(Bound::Excluded(&q))
                .map(|e| e.value().clone())
            {
                if entry.has_next() && entry.next_index_offset == high.index_offset {
                    return Ok(Some(high.kv));
                }
            }
            let footer = self.footer()?;
            let mut walker = IndexWalker::from_entry(self.file.clone(), &footer, entry);
            return self.install_found(matcher::find_higher(key, &mut walker, ord)?);
        }

        let footer = self.footer()?;
        let mut walker = IndexWalker::from_start(self.file.clone(), &footer);
        self.install_found(matcher::find_higher(key, &mut walker, ord)?)
    }

    /// Stream-decode the whole index.
    pub fn get_all(&self) -> Result<Vec<KeyValue>> {
        let footer = self.footer()?;
        let mut entries = Vec::with_capacity(footer.key_value_count as usize);
        let mut walker = IndexWalker::from_start(self.file.clone(), &footer);
        loop {
            match walker.next() {
                Ok(Some(entry)) => entries.push(entry.kv),
                Ok(None) => break,
                Err(err) => {
                    if self.ctx.config.drop_corrupted_tail_entries {
                        warn!(
                            "{}, keeping {} entries",
                            Error::CorruptedTailEntries {
                                path: self.path.clone(),
                                offset: footer.index_offset + walker.position(),
                            },
                            entries.len()
                        );
                        break;
                    }
                    return Err(err);
                }
            }
        }
        Ok(entries)
    }

    /// `true` unless the bloom filter rules the key out.
    pub fn might_contain(&self, key: &[u8]) -> Result<bool> {
        let footer = self.footer()?;
        Ok(footer
            .bloom
            .as_ref()
            .map(|bloom| bloom.may_contain(key))
            .unwrap_or(true))
    }

    pub fn has_bloom_filter(&self) -> Result<bool> {
        Ok(self.footer()?.bloom.is_some())
    }

    /// Merge this segment with `new_key_values` into fresh segments. The
    /// inputs survive untouched; partially written outputs are deleted on
    /// failure.
    pub fn put(
        &self,
        new_key_values: Vec<KeyValue>,
        has_time_left: HasTimeLeft,
    ) -> Result<Vec<Segment>> {
        let old = self.get_all()?;
        let opts = self.merge_options(has_time_left);
        let runs = merger::merge(new_key_values, old, &opts);
        write_runs(runs, &self.ctx, self.remove_deletes)
    }

    /// Re-compact this segment against itself, re-applying TTLs and the
    /// current format.
    pub fn refresh(&self, has_time_left: HasTimeLeft) -> Result<Vec<Segment>> {
        let entries = self.get_all()?;
        let opts = self.merge_options(has_time_left);
        let runs = merger::split(entries, &opts);
        write_runs(runs, &self.ctx, self.remove_deletes)
    }

    fn merge_options(&self, has_time_left: HasTimeLeft) -> MergeOptions {
        MergeOptions {
            min_segment_size: self.ctx.config.min_segment_size,
            for_in_memory: false,
            is_last_level: self.remove_deletes,
            bloom_false_positive_rate: self.ctx.config.bloom_false_positive_rate,
            comparator: self.ctx.comparator.clone(),
            has_time_left,
        }
    }

    pub fn close(&self) -> Result<()> {
        self.file.close()?;
        *self.footer.write().map_err(|_| Self::lock_err())? = None;
        while self.cache.pop_front().is_some() {}
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        info!("deleting segment {:?}", self.path);
        self.close()?;
        self.file.delete()
    }

    pub fn copy_to(&self, target: &Path) -> Result<PathBuf> {
        self.file.copy_to(target)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn min_key(&self) -> &Slice {
        &self.min_key
    }

    #[inline]
    pub fn max_key(&self) -> &MaxKey {
        &self.max_key
    }

    #[inline]
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    #[inline]
    pub fn key_value_count(&self) -> u64 {
        self.key_value_count
    }

    #[inline]
    pub fn has_range(&self) -> bool {
        self.has_range
    }

    /// Earliest pending expiry in this segment, for cleanup scheduling.
    #[inline]
    pub fn nearest_expiry_deadline(&self) -> Option<Deadline> {
        self.nearest_expiry_deadline
    }

    #[inline]
    pub fn remove_deletes(&self) -> bool {
        self.remove_deletes
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    pub fn is_footer_defined(&self) -> bool {
        self.footer
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    #[inline]
    pub fn cached_key_count(&self) -> usize {
        self.cache.len()
    }

    /// Evict one cached entry. Invoked by the cache limiter; queries are
    /// unaffected beyond losing the fast path.
    pub fn remove_cached(&self, key: &[u8]) {
        self.cache.remove(&self.cache_query(key));
    }
}

/// Persist merged runs, one file each, into directories and names from
/// the injected distributor and id generator. On any failure every
/// already-written output is deleted best-effort and the original error
/// surfaces.
pub fn write_runs(
    runs: Vec<MergedRun>,
    ctx: &Arc<SegmentContext>,
    remove_deletes: bool,
) -> Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::with_capacity(runs.len());
    for run in runs {
        match write_run(run, ctx, remove_deletes) {
            Ok(segment) => segments.push(segment),
            Err(err) => {
                error!(
                    "segment write failed, deleting {} finished outputs: {}",
                    segments.len(),
                    err
                );
                for segment in &segments {
                    if let Err(cleanup) = segment.delete() {
                        warn!(
                            "could not delete partial output {:?}: {}",
                            segment.path(),
                            cleanup
                        );
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(segments)
}

fn write_run(
    run: MergedRun,
    ctx: &Arc<SegmentContext>,
    remove_deletes: bool,
) -> Result<Segment> {
    let path = ctx
        .paths
        .next_dir()
        .join(format!("{}.seg", ctx.id_generator.next_segment_id()));
    let bytes = format::encode_segment(&run.entries, ctx.config.bloom_false_positive_rate)?;
    debug!("writing segment {:?}, {} bytes", path, bytes.len());

    let file = if ctx.config.mmap_writes {
        DbFile::mmap_write(&path, bytes.len(), ctx.config.mmap_reads, ctx.on_open.clone())?
    } else {
        DbFile::channel_write(&path, ctx.config.mmap_reads, ctx.on_open.clone())?
    };
    if let Err(err) = file.append(&bytes).and_then(|_| file.close()) {
        if let Err(cleanup) = file.delete() {
            warn!("could not delete partial file {:?}: {}", path, cleanup);
        }
        return Err(err);
    }
    Segment::from_run(path, Arc::new(file), run.stats, ctx.clone(), remove_deletes)
}

/// In-RAM rendition of [`write_runs`] for levels that never touch disk.
pub fn write_runs_in_memory(
    runs: Vec<MergedRun>,
    ctx: &Arc<SegmentContext>,
    remove_deletes: bool,
) -> Result<Vec<Segment>> {
    let mut segments = Vec::with_capacity(runs.len());
    for run in runs {
        let path = ctx
            .paths
            .next_dir()
            .join(format!("{}.mem", ctx.id_generator.next_segment_id()));
        let bytes = format::encode_segment(&run.entries, ctx.config.bloom_false_positive_rate)?;
        let file = Arc::new(DbFile::memory(&path, Slice::from_vec(bytes)));
        segments.push(Segment::from_run(
            path,
            file,
            run.stats,
            ctx.clone(),
            remove_deletes,
        )?);
    }
    Ok(segments)
}
