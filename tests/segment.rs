use segstore::entry::{KeyValue, Value};
use segstore::env::{LexicographicComparator, SequentialIdGenerator, SingleDirDistributor};
use segstore::error::Error;
use segstore::segment::merger::{merge, split};
use segstore::segment::{
    wall_clock_time_left, write_runs, HasTimeLeft, MergeOptions, Segment, SegmentContext,
};
use segstore::slice::Slice;
use segstore::SegmentConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn context(dir: &Path, config: SegmentConfig) -> Arc<SegmentContext> {
    Arc::new(SegmentContext {
        config,
        comparator: Arc::new(LexicographicComparator),
        id_generator: Arc::new(SequentialIdGenerator::new()),
        paths: Arc::new(SingleDirDistributor::new(dir)),
        on_open: None,
        on_cache: None,
    })
}

fn put(key: &[u8], value: &[u8], deadline: Option<SystemTime>) -> KeyValue {
    KeyValue::Put {
        key: Slice::from_vec(key.to_vec()),
        value: Value::some(value.to_vec()),
        deadline,
    }
}

fn options(ctx: &SegmentContext, min_segment_size: u64, is_last_level: bool) -> MergeOptions {
    MergeOptions {
        min_segment_size,
        for_in_memory: false,
        is_last_level,
        bloom_false_positive_rate: ctx.config.bloom_false_positive_rate,
        comparator: ctx.comparator.clone(),
        has_time_left: wall_clock_time_left(Duration::ZERO),
    }
}

fn write_segments(
    entries: Vec<KeyValue>,
    ctx: &Arc<SegmentContext>,
    min_segment_size: u64,
    is_last_level: bool,
) -> Vec<Segment> {
    let runs = split(entries, &options(ctx, min_segment_size, is_last_level));
    write_runs(runs, ctx, is_last_level).unwrap()
}

#[test]
fn test_put_then_get_across_reopen() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut config = SegmentConfig::default();
    config.bloom_false_positive_rate = 0.01;
    let ctx = context(dir.path(), config);

    let segments = write_segments(
        vec![put(&[1, 2, 3], &[9], None)],
        &ctx,
        u64::MAX,
        false,
    );
    assert_eq!(segments.len(), 1);
    let path = segments[0].path().to_path_buf();
    segments[0].close().unwrap();

    let segment = Segment::open(&path, ctx, false).unwrap();
    let hit = segment.get(&[1, 2, 3]).unwrap().unwrap();
    assert_eq!(hit.key().as_bytes(), &[1, 2, 3]);
    match hit {
        KeyValue::Put { value, .. } => {
            assert_eq!(value.fetch().unwrap().unwrap().as_bytes(), &[9])
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert!(segment.get(&[1, 2, 4]).unwrap().is_none());
    assert!(segment.contains(&[1, 2, 3]).unwrap());
    // the filter may answer either way for an absent key, but never
    // rejects a present one
    assert!(segment.might_contain(&[1, 2, 3]).unwrap());
}

#[test]
fn test_expired_put_vanishes_at_last_level() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let expired = Some(SystemTime::now() - Duration::from_secs(1));
    let runs = merge(
        vec![put(&[1], &[1], expired)],
        Vec::new(),
        &options(&ctx, u64::MAX, true),
    );
    assert!(runs.is_empty());
    let segments = write_runs(runs, &ctx, true).unwrap();
    assert!(segments.is_empty());
}

#[test]
fn test_update_over_put_through_segment_merge() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let deadline = Some(SystemTime::now() + Duration::from_secs(600));
    let base = write_segments(vec![put(&[1], &[1], deadline)], &ctx, u64::MAX, false);

    let update = KeyValue::Update {
        key: Slice::from_vec(vec![1]),
        value: Value::some(vec![9]),
        deadline: None,
    };
    let merged = base[0]
        .put(vec![update], wall_clock_time_left(Duration::ZERO))
        .unwrap();
    assert_eq!(merged.len(), 1);

    match merged[0].get(&[1]).unwrap().unwrap() {
        KeyValue::Put {
            value,
            deadline: merged_deadline,
            ..
        } => {
            assert_eq!(value.fetch().unwrap().unwrap().as_bytes(), &[9]);
            assert_eq!(merged_deadline, deadline);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_remove_with_deadline_accelerates_put_expiry() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let now = SystemTime::now();
    let put_deadline = Some(now + Duration::from_secs(20));
    let remove_deadline = Some(now + Duration::from_secs(5));

    let base = write_segments(vec![put(&[1], &[1], put_deadline)], &ctx, u64::MAX, false);
    let remove = KeyValue::Remove {
        key: Slice::from_vec(vec![1]),
        deadline: remove_deadline,
    };
    let merged = base[0]
        .put(vec![remove], wall_clock_time_left(Duration::ZERO))
        .unwrap();

    match merged[0].get(&[1]).unwrap().unwrap() {
        KeyValue::Put {
            value, deadline, ..
        } => {
            assert_eq!(value.fetch().unwrap().unwrap().as_bytes(), &[1]);
            assert_eq!(deadline, remove_deadline);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_split_emits_one_segment_per_entry_at_minimal_size() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let entries: Vec<KeyValue> = (0..100u8).map(|i| put(&[i], &[i], None)).collect();
    let segments = write_segments(entries, &ctx, 1, false);
    assert_eq!(segments.len(), 100);
    for segment in &segments {
        assert_eq!(segment.key_value_count(), 1);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 100);
}

#[test]
fn test_split_respects_size_bound() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let entries: Vec<KeyValue> = (0..100u8).map(|i| put(&[i], &[i], None)).collect();
    let segments = write_segments(entries, &ctx, 256, false);
    assert!(segments.len() > 1);
    assert!(segments.len() < 50);

    let total: u64 = segments.iter().map(|s| s.key_value_count()).sum();
    assert_eq!(total, 100);
    // a trailing run below the bound folds into its predecessor, so no
    // segment holds a lone leftover entry
    for segment in &segments {
        assert!(segment.key_value_count() >= 2);
    }
}

#[test]
fn test_truncated_file_fails_reopen() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let entries: Vec<KeyValue> = (0..5u8).map(|i| put(&[i], &[i], None)).collect();
    let segments = write_segments(entries, &ctx, u64::MAX, false);
    let path = segments[0].path().to_path_buf();
    segments[0].close().unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..(len - 5) as usize]).unwrap();

    match Segment::open(&path, ctx, false) {
        Err(Error::Format(_)) => {}
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_corrupted_index_tail_drops_to_prefix_when_opted_in() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let entries: Vec<KeyValue> = (0..5u8).map(|i| put(&[i], &[i], None)).collect();
    let segments = write_segments(entries, &ctx, u64::MAX, false);
    let path = segments[0].path().to_path_buf();
    segments[0].close().unwrap();

    // clobber the end of the index block while keeping the footer intact
    let mut bytes = std::fs::read(&path).unwrap();
    let len = bytes.len();
    let footer_len =
        u32::from_le_bytes([bytes[len - 8], bytes[len - 7], bytes[len - 6], bytes[len - 5]])
            as usize;
    let footer_start = len - 8 - footer_len;
    bytes[footer_start - 2] = 0xff;
    bytes[footer_start - 1] = 0xff;
    std::fs::write(&path, &bytes).unwrap();

    // strict reopen surfaces the corruption
    match Segment::open(&path, ctx.clone(), false) {
        Err(Error::Format(_)) => {}
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }

    // opted-in reopen keeps the decodable prefix
    let mut config = SegmentConfig::default();
    config.drop_corrupted_tail_entries = true;
    let tolerant = context(dir.path(), config);
    let segment = Segment::open(&path, tolerant, false).unwrap();
    assert_eq!(segment.key_value_count(), 4);
    assert!(segment.get(&[0]).unwrap().is_some());
    assert!(segment.get(&[3]).unwrap().is_some());
}

#[test]
fn test_mmap_write_and_read_round_trip() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut config = SegmentConfig::default();
    config.mmap_writes = true;
    config.mmap_reads = true;
    let ctx = context(dir.path(), config);

    let entries: Vec<KeyValue> = (0..30u8).map(|i| put(&[i], &[i], None)).collect();
    let segments = write_segments(entries, &ctx, u64::MAX, false);
    assert_eq!(segments.len(), 1);
    for i in 0..30u8 {
        assert!(segments[0].get(&[i]).unwrap().is_some());
    }

    let path = segments[0].path().to_path_buf();
    segments[0].close().unwrap();
    let reopened = Segment::open(&path, ctx, false).unwrap();
    assert_eq!(reopened.key_value_count(), 30);
}

#[test]
fn test_concurrent_readers() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let entries: Vec<KeyValue> = (0..100u8).map(|i| put(&[i], &[i], None)).collect();
    let mut segments = write_segments(entries, &ctx, u64::MAX, false);
    let segment = Arc::new(segments.remove(0));

    let readers: Vec<_> = (0..4)
        .map(|t| {
            let segment = segment.clone();
            std::thread::spawn(move || {
                for round in 0..3 {
                    for i in 0..100u8 {
                        let hit = segment.get(&[i]).unwrap().unwrap();
                        assert_eq!(hit.key().as_bytes(), &[i], "thread {} round {}", t, round);
                    }
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_merge_totality_over_mixed_inputs() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let new: Vec<KeyValue> = (0..50u8).map(|i| put(&[i * 2], &[1], None)).collect();
    let old: Vec<KeyValue> = (0..50u8).map(|i| put(&[i * 2 + 1], &[2], None)).collect();

    let runs = merge(new, old, &options(&ctx, u64::MAX, false));
    let keys: Vec<u8> = runs
        .iter()
        .flat_map(|run| run.entries.iter())
        .map(|kv| kv.key()[0])
        .collect();
    let expected: Vec<u8> = (0..100u8).collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_refresh_drops_expired_entries_on_last_level() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let now = SystemTime::now();
    let live = Some(now + Duration::from_secs(600));
    let doomed = Some(now + Duration::from_millis(50));
    let segments = write_segments(
        vec![put(&[1], &[1], live), put(&[2], &[2], doomed)],
        &ctx,
        u64::MAX,
        true,
    );
    let segment = &segments[0];
    assert_eq!(segment.key_value_count(), 2);
    assert_eq!(segment.nearest_expiry_deadline(), doomed);

    std::thread::sleep(Duration::from_millis(80));
    let refreshed = segment
        .refresh(wall_clock_time_left(Duration::ZERO))
        .unwrap();
    assert_eq!(refreshed.len(), 1);
    assert_eq!(refreshed[0].key_value_count(), 1);
    assert!(refreshed[0].get(&[1]).unwrap().is_some());
    assert!(refreshed[0].get(&[2]).unwrap().is_none());
}

#[test]
fn test_partial_outputs_deleted_on_write_failure() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let entries: Vec<KeyValue> = (0..20u8).map(|i| put(&[i], &[i], None)).collect();

    // occupy the path the second output will want, so the first output
    // completes and must then be rolled back
    std::fs::write(dir.path().join("0000000101.seg"), b"occupied").unwrap();
    let colliding = Arc::new(SegmentContext {
        config: ctx.config.clone(),
        comparator: ctx.comparator.clone(),
        id_generator: Arc::new(SequentialIdGenerator::starting_at(100)),
        paths: ctx.paths.clone(),
        on_open: None,
        on_cache: None,
    });
    let runs = split(entries, &options(&colliding, 1, false));
    assert!(runs.len() > 1);
    let before: usize = std::fs::read_dir(dir.path()).unwrap().count();
    let result = write_runs(runs, &colliding, false);
    assert!(result.is_err());
    // the finished first output was deleted with the rest
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), before);
}

#[test]
fn test_random_keys_round_trip() {
    use rand::Rng;

    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let mut rng = rand::thread_rng();
    let mut keys: Vec<Vec<u8>> = (0..200)
        .map(|_| {
            let len = rng.gen_range(1..24);
            (0..len).map(|_| rng.gen::<u8>()).collect()
        })
        .collect();
    keys.sort();
    keys.dedup();

    let entries: Vec<KeyValue> = keys
        .iter()
        .map(|key| put(key, &[rng.gen::<u8>()], None))
        .collect();
    let segments = write_segments(entries, &ctx, u64::MAX, false);
    assert_eq!(segments.len(), 1);
    let segment = &segments[0];

    for key in &keys {
        let hit = segment.get(key).unwrap().unwrap();
        assert_eq!(hit.key().as_bytes(), key.as_slice());
    }
    for pair in keys.windows(2) {
        let higher = segment.higher(&pair[0]).unwrap().unwrap();
        assert_eq!(higher.key().as_bytes(), pair[1].as_slice());
        let lower = segment.lower(&pair[1]).unwrap().unwrap();
        assert_eq!(lower.key().as_bytes(), pair[0].as_slice());
    }
}

#[test]
fn test_deterministic_merge_output_bytes() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path(), SegmentConfig::default());

    let now = SystemTime::now();
    let clock: HasTimeLeft = Arc::new(move |deadline| deadline > now);
    let deadline = Some(now + Duration::from_secs(300));

    let build = |ctx: &Arc<SegmentContext>| {
        let mut opts = options(ctx, u64::MAX, false);
        opts.has_time_left = clock.clone();
        let new = vec![put(&[1], &[9], None), put(&[4], &[4], deadline)];
        let old = vec![put(&[2], &[2], None), put(&[4], &[0], None)];
        let runs = merge(new, old, &opts);
        write_runs(runs, ctx, false).unwrap()
    };

    let first = build(&ctx);
    let second = build(&ctx);
    let bytes_a = std::fs::read(first[0].path()).unwrap();
    let bytes_b = std::fs::read(second[0].path()).unwrap();
    assert_eq!(bytes_a, bytes_b);
}
