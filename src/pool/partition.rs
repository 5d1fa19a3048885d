use std::ops::Range;

/// Split `0..total` into contiguous ranges for ordered tasks.
///
/// Each range holds `ceil(total / workers)` items, capped at `max_part` when
/// given. The last range may be shorter.
pub fn part_ranges(total: usize, workers: usize, max_part: Option<usize>) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let mut size = total.div_ceil(workers.max(1));
    if let Some(max) = max_part {
        size = size.min(max.max(1));
    }

    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}
