/// Tuning knobs for segment creation and reads. The level orchestrator
/// owns one per level.
#[derive(Clone, Debug)]
pub struct SegmentConfig {
    /// A merge closes its open output once the projected size reaches this.
    pub min_segment_size: u64,
    /// Target bloom false-positive rate; at or above 1.0 no filter is
    /// written.
    pub bloom_false_positive_rate: f64,
    /// Write new segment files through a read-write memory map instead of
    /// a sequential channel.
    pub mmap_writes: bool,
    /// Reopen segment files as read-only memory maps.
    pub mmap_reads: bool,
    /// Install entries decoded by point reads into the segment cache.
    pub cache_keys_on_read: bool,
    /// Tolerate a truncated index: keep the decodable prefix instead of
    /// failing the reopen.
    pub drop_corrupted_tail_entries: bool,
}

impl Default for SegmentConfig {
    fn default() -> SegmentConfig {
        SegmentConfig {
            min_segment_size: 2 * 1024 * 1024,
            bloom_false_positive_rate: 0.01,
            mmap_writes: false,
            mmap_reads: true,
            cache_keys_on_read: true,
            drop_corrupted_tail_entries: false,
        }
    }
}
