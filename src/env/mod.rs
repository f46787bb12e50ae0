//! Seams injected by the level orchestrator: key ordering, resource
//! limiter callbacks, segment id generation and directory distribution.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Total order over opaque keys.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Default order: lexicographic over unsigned bytes.
pub struct LexicographicComparator;

impl KeyComparator for LexicographicComparator {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Invoked every time an OS file handle materializes. The file-open
/// limiter lives behind this.
pub type FileOpenListener = Arc<dyn Fn(&Path) + Send + Sync>;

/// Invoked every time a decoded entry is installed into a segment cache,
/// with the key installed and the owning segment's path. The cache-size
/// limiter holds no long-lived segment reference.
pub type CacheListener = Arc<dyn Fn(&crate::slice::Slice, &Path) + Send + Sync>;

pub trait SegmentIdGenerator: Send + Sync {
    fn next_segment_id(&self) -> String;
}

/// Monotonic ids, zero-padded so lexicographic directory listings sort by
/// creation order.
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> SequentialIdGenerator {
        SequentialIdGenerator {
            next: AtomicU64::new(0),
        }
    }

    pub fn starting_at(next: u64) -> SequentialIdGenerator {
        SequentialIdGenerator {
            next: AtomicU64::new(next),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        SequentialIdGenerator::new()
    }
}

impl SegmentIdGenerator for SequentialIdGenerator {
    fn next_segment_id(&self) -> String {
        format!("{:010}", self.next.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

pub trait PathsDistributor: Send + Sync {
    /// Directory the next new segment file should land in.
    fn next_dir(&self) -> PathBuf;
}

pub struct SingleDirDistributor {
    dir: PathBuf,
}

impl SingleDirDistributor {
    pub fn new(dir: impl Into<PathBuf>) -> SingleDirDistributor {
        SingleDirDistributor { dir: dir.into() }
    }
}

impl PathsDistributor for SingleDirDistributor {
    fn next_dir(&self) -> PathBuf {
        self.dir.clone()
    }
}

/// Rotates new segment files across several directories.
pub struct RoundRobinDistributor {
    dirs: Vec<PathBuf>,
    next: AtomicUsize,
}

impl RoundRobinDistributor {
    pub fn new(dirs: Vec<PathBuf>) -> RoundRobinDistributor {
        debug_assert!(!dirs.is_empty());
        RoundRobinDistributor {
            dirs,
            next: AtomicUsize::new(0),
        }
    }
}

impl PathsDistributor for RoundRobinDistributor {
    fn next_dir(&self) -> PathBuf {
        let i = self.next.fetch_add(1, AtomicOrdering::Relaxed);
        self.dirs[i % self.dirs.len()].clone()
    }
}
