/// Maps an identity digest to a worker index.
///
/// Pure and stable across restarts for a fixed worker count, so the set of
/// timeseries owned by a worker only changes when the pool is resized at
/// startup.
pub fn worker_index(digest: u64, num_workers: usize) -> usize {
    debug_assert!(num_workers >= 1);
    (digest % num_workers.max(1) as u64) as usize
}
