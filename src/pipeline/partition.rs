//! Page partitioning: split a document into fixed-size, overlapping batches.
//!
//! Pages are 1-indexed and ranges are inclusive on both ends. With batch
//! size `B` and overlap `O` the start of each range advances by `B - O`
//! pages, so consecutive ranges share exactly `O` pages. The last range is
//! clipped to the final page, and a range that would fall entirely inside
//! the previous range's overlap is not emitted.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive, 1-indexed span of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start >= 1 && start <= end, "invalid range {start}-{end}");
        Self { start, end }
    }

    /// Number of pages in the range; at least 1.
    pub fn page_count(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn contains(&self, page: usize) -> bool {
        (self.start..=self.end).contains(&page)
    }

    /// Pages covered, in order.
    pub fn pages(&self) -> impl Iterator<Item = usize> {
        self.start..=self.end
    }

    /// Map a batch-relative page (1 = first page of this range) to an
    /// absolute document page. `None` when `relative` is outside the range.
    pub fn to_absolute(&self, relative: usize) -> Option<usize> {
        if relative >= 1 && relative <= self.page_count() {
            Some(self.start + relative - 1)
        } else {
            None
        }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Partition pages `1..=total_pages` into batches.
///
/// # Errors
/// [`IngestError::InvalidConfig`] when `batch_size` is zero or
/// `overlap >= batch_size` (the window would never advance).
pub fn partition(
    total_pages: usize,
    batch_size: usize,
    overlap: usize,
) -> Result<Vec<PageRange>, IngestError> {
    partition_window(PageRange::new(1, total_pages.max(1)), total_pages, batch_size, overlap)
}

/// Partition a sub-window of the document.
///
/// `window` is clipped to `total_pages`; an empty document yields no ranges.
pub fn partition_window(
    window: PageRange,
    total_pages: usize,
    batch_size: usize,
    overlap: usize,
) -> Result<Vec<PageRange>, IngestError> {
    if batch_size == 0 {
        return Err(IngestError::InvalidConfig("batch size must be ≥ 1".into()));
    }
    if overlap >= batch_size {
        return Err(IngestError::InvalidConfig(format!(
            "overlap ({overlap}) must be smaller than batch size ({batch_size})"
        )));
    }
    if total_pages == 0 || window.start > total_pages {
        return Ok(Vec::new());
    }

    let last = window.end.min(total_pages);
    let step = batch_size - overlap;
    let mut ranges: Vec<PageRange> = Vec::new();
    let mut start = window.start;

    loop {
        let end = (start + batch_size - 1).min(last);
        if let Some(prev) = ranges.last() {
            // Already covered by the previous range's overlap.
            if end <= prev.end {
                break;
            }
        }
        ranges.push(PageRange::new(start, end));
        if end == last {
            break;
        }
        start += step;
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covered(ranges: &[PageRange]) -> Vec<usize> {
        let mut pages: Vec<usize> = ranges.iter().flat_map(|r| r.pages()).collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    #[test]
    fn small_document_is_one_range() {
        assert_eq!(partition(3, 10, 0).unwrap(), vec![PageRange::new(1, 3)]);
        assert_eq!(partition(10, 10, 2).unwrap(), vec![PageRange::new(1, 10)]);
    }

    #[test]
    fn no_overlap_splits_evenly_and_clips() {
        let ranges = partition(25, 10, 0).unwrap();
        assert_eq!(
            ranges,
            vec![
                PageRange::new(1, 10),
                PageRange::new(11, 20),
                PageRange::new(21, 25)
            ]
        );
    }

    #[test]
    fn overlap_shares_pages() {
        let ranges = partition(20, 10, 2).unwrap();
        assert_eq!(
            ranges,
            vec![
                PageRange::new(1, 10),
                PageRange::new(9, 18),
                PageRange::new(17, 20)
            ]
        );
    }

    #[test]
    fn range_inside_previous_overlap_is_not_emitted() {
        // Start 9 would give 9-10, entirely inside 1-10.
        let ranges = partition(10, 8, 0).unwrap();
        assert_eq!(ranges, vec![PageRange::new(1, 8), PageRange::new(9, 10)]);
        let ranges = partition(11, 10, 1).unwrap();
        assert_eq!(ranges, vec![PageRange::new(1, 10), PageRange::new(10, 11)]);
        let ranges = partition(12, 5, 3).unwrap();
        assert_eq!(ranges.last().unwrap().end, 12);
        for pair in ranges.windows(2) {
            assert!(pair[1].end > pair[0].end);
        }
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        assert!(matches!(
            partition(10, 4, 4),
            Err(IngestError::InvalidConfig(_))
        ));
        assert!(matches!(
            partition(10, 4, 9),
            Err(IngestError::InvalidConfig(_))
        ));
        assert!(matches!(
            partition(10, 0, 0),
            Err(IngestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_document_has_no_ranges() {
        assert!(partition(0, 10, 0).unwrap().is_empty());
    }

    #[test]
    fn coverage_and_overlap_hold_for_all_small_inputs() {
        for b in 1..=8 {
            for o in 0..b {
                for n in b..=40 {
                    let ranges = partition(n, b, o).unwrap();
                    assert_eq!(covered(&ranges), (1..=n).collect::<Vec<_>>(), "n={n} b={b} o={o}");
                    assert_eq!(ranges[0].start, 1);
                    assert_eq!(ranges.last().unwrap().end, n);
                    for pair in ranges.windows(2) {
                        let shared = (pair[0].end + 1).saturating_sub(pair[1].start);
                        assert_eq!(shared, o, "n={n} b={b} o={o} {:?}", pair);
                        assert_eq!(pair[0].page_count(), b, "only the last range may be short");
                    }
                }
            }
        }
    }

    #[test]
    fn partition_is_deterministic() {
        assert_eq!(partition(37, 6, 2).unwrap(), partition(37, 6, 2).unwrap());
    }

    #[test]
    fn window_restricts_ranges() {
        let ranges = partition_window(PageRange::new(5, 14), 30, 4, 0).unwrap();
        assert_eq!(
            ranges,
            vec![
                PageRange::new(5, 8),
                PageRange::new(9, 12),
                PageRange::new(13, 14)
            ]
        );
        let clipped = partition_window(PageRange::new(28, 40), 30, 10, 0).unwrap();
        assert_eq!(clipped, vec![PageRange::new(28, 30)]);
        assert!(partition_window(PageRange::new(31, 40), 30, 10, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn page_count_is_inclusive() {
        assert_eq!(PageRange::new(4, 4).page_count(), 1);
        assert_eq!(PageRange::new(11, 20).page_count(), 10);
    }

    #[test]
    fn relative_pages_map_to_absolute() {
        let r = PageRange::new(11, 20);
        assert_eq!(r.to_absolute(1), Some(11));
        assert_eq!(r.to_absolute(10), Some(20));
        assert_eq!(r.to_absolute(0), None);
        assert_eq!(r.to_absolute(11), None);
        assert_eq!(r.to_string(), "11-20");
    }
}
