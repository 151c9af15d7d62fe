//! Parallel block sort building blocks.
//!
//! A buffer of `n` records is split into `P` contiguous fragments. Each fragment is base-sorted
//! on its own, producing a run of [`RecordRef`]s; runs are then merged pairwise in
//! `ceil(log2(P))` rounds:
//!
//! ```text
//! round 0:  [0]+[1]  [2]+[3]  [4]
//! round 1:  [0]+[2]           [4]
//! round 2:  [0]+[4]
//! ```

use std::cmp::Ordering;
use std::ops::Range;

use crate::buffer::{Fragment, FragmentBuffer};
use crate::format::RecordComparator;

/// Position of a record inside a [`FragmentBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef {
    pub fragment: u32,
    pub index: u32,
}

impl RecordRef {
    #[must_use]
    pub fn resolve(self, buffer: &FragmentBuffer) -> &[u8] {
        buffer.fragments[self.fragment as usize].record(self.index as usize)
    }

    #[must_use]
    pub fn rank(self, buffer: &FragmentBuffer) -> u64 {
        buffer.fragments[self.fragment as usize].rank(self.index as usize)
    }
}

/// Split `len` items into at most `parts` contiguous, non-empty ranges of near-equal size.
#[must_use]
pub fn split_points(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.clamp(1, len.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let end = start + base + usize::from(i < extra);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Stable sort of one fragment.
#[must_use]
pub fn base_sort(
    fragment_index: usize,
    fragment: &Fragment,
    comparator: &dyn RecordComparator,
) -> Vec<RecordRef> {
    let fragment_id = fragment_index as u32;
    let mut run: Vec<RecordRef> =
        (0..fragment.len()).map(|i| RecordRef { fragment: fragment_id, index: i as u32 }).collect();
    run.sort_by(|a, b| {
        comparator.compare(fragment.record(a.index as usize), fragment.record(b.index as usize))
    });
    run
}

/// Merge two sorted runs into `out`; on ties the left run goes first.
pub fn merge_runs(
    buffer: &FragmentBuffer,
    left: &[RecordRef],
    right: &[RecordRef],
    comparator: &dyn RecordComparator,
    out: &mut Vec<RecordRef>,
) {
    out.clear();
    out.reserve(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        let order = comparator.compare(right[j].resolve(buffer), left[i].resolve(buffer));
        if order == Ordering::Less {
            out.push(right[j]);
            j += 1;
        } else {
            out.push(left[i]);
            i += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
}

/// Pairs `(left, right)` of run slots merged in each round; the result lands in `left`.
#[must_use]
pub fn merge_rounds(runs: usize) -> Vec<Vec<(usize, usize)>> {
    let mut rounds = Vec::new();
    let mut step = 1;
    while step < runs {
        let pairs = (0..runs)
            .step_by(2 * step)
            .filter(|&l| l + step < runs)
            .map(|l| (l, l + step))
            .collect();
        rounds.push(pairs);
        step *= 2;
    }
    rounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::compare::is_sorted;
    use proptest::prelude::*;
    use rstest::rstest;

    /// Orders records by their first byte only, so ties are common.
    struct FirstByte;

    impl RecordComparator for FirstByte {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a[0].cmp(&b[0])
        }
    }

    fn buffer_from(records: &[[u8; 2]], parts: usize) -> FragmentBuffer {
        let mut buffer = FragmentBuffer::new(parts, 64, 16);
        for (part, range) in split_points(records.len(), parts).into_iter().enumerate() {
            for i in range {
                buffer.fragments[part].push(&records[i], i as u64);
            }
        }
        buffer
    }

    fn sort_buffer(buffer: &FragmentBuffer) -> Vec<RecordRef> {
        let mut runs: Vec<Vec<RecordRef>> =
            buffer.fragments.iter().enumerate().map(|(i, f)| base_sort(i, f, &FirstByte)).collect();
        let mut scratch = Vec::new();
        for round in merge_rounds(runs.len()) {
            for (l, r) in round {
                merge_runs(buffer, &runs[l], &runs[r], &FirstByte, &mut scratch);
                std::mem::swap(&mut runs[l], &mut scratch);
            }
        }
        runs.swap_remove(0)
    }

    #[rstest]
    #[case(10, 3, vec![4, 3, 3])]
    #[case(2, 4, vec![1, 1])]
    #[case(0, 4, vec![0])]
    #[case(8, 1, vec![8])]
    fn test_split_points(#[case] len: usize, #[case] parts: usize, #[case] sizes: Vec<usize>) {
        let ranges = split_points(len, parts);
        assert_eq!(ranges.iter().map(ExactSizeIterator::len).collect::<Vec<_>>(), sizes);
        assert_eq!(ranges.last().unwrap().end, len);
    }

    #[rstest]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(5, 3)]
    #[case(8, 3)]
    fn test_merge_rounds_count(#[case] runs: usize, #[case] rounds: usize) {
        let schedule = merge_rounds(runs);
        assert_eq!(schedule.len(), rounds);
        assert_eq!(schedule.iter().map(Vec::len).sum::<usize>(), runs.saturating_sub(1));
    }

    proptest! {
        #[test]
        fn prop_block_sort_is_sorted_and_stable(
            keys in proptest::collection::vec(0u8..6, 0..200),
            parts in 1usize..9,
        ) {
            let records: Vec<[u8; 2]> =
                keys.iter().enumerate().map(|(i, &k)| [k, i as u8]).collect();
            let buffer = buffer_from(&records, parts);
            let order = sort_buffer(&buffer);
            prop_assert_eq!(order.len(), records.len());
            let sorted: Vec<&[u8]> = order.iter().map(|r| r.resolve(&buffer)).collect();
            prop_assert!(is_sorted(&FirstByte, sorted.iter().copied()));
            for pair in order.windows(2) {
                if pair[0].resolve(&buffer)[0] == pair[1].resolve(&buffer)[0] {
                    prop_assert!(pair[0].rank(&buffer) < pair[1].rank(&buffer));
                }
            }
        }
    }
}
