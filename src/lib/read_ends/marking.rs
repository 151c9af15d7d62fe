//! Duplicate rules for one group of read ends sharing a [`GroupKey`](super::GroupKey).
//!
//! Pairs: the template (read ends sharing a name hash) with the highest summed score is kept;
//! ties go to the lowest name hash. Every read of every other template is a duplicate.
//!
//! Fragments: when any member belongs to a pair with both ends mapped, every unpaired member
//! is a duplicate. Otherwise every member but the best one (highest score, then lowest name
//! hash, then lowest rank) is a duplicate.

use std::cmp::Reverse;

use ahash::AHashMap;

use super::{DuplicateSet, ReadEnds};
use crate::errors::Result;
use crate::format::AlignmentHeader;
use crate::metrics::DuplicationMetrics;

/// Raw per-library counts of one merge interval. Pair counts are in read ends, two per pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibraryTally {
    pub unpaired: u64,
    pub unpaired_duplicates: u64,
    pub pair_ends: u64,
    pub pair_end_duplicates: u64,
    pub unmapped: u64,
}

/// Tallies keyed by library ordinal.
#[derive(Debug, Default)]
pub struct Tallies(pub AHashMap<u16, LibraryTally>);

impl Tallies {
    pub fn library(&mut self, library: u16) -> &mut LibraryTally {
        self.0.entry(library).or_default()
    }

    /// Convert to metrics keyed by library name.
    #[must_use]
    pub fn into_metrics(self, header: &AlignmentHeader) -> AHashMap<String, DuplicationMetrics> {
        let mut metrics: AHashMap<String, DuplicationMetrics> = AHashMap::new();
        for (library, tally) in self.0 {
            let name = header.library_name(library);
            let entry =
                metrics.entry(name.to_string()).or_insert_with(|| DuplicationMetrics::new(name));
            entry.unpaired_reads_examined += tally.unpaired;
            entry.unpaired_read_duplicates += tally.unpaired_duplicates;
            entry.read_pairs_examined += tally.pair_ends / 2;
            entry.read_pair_duplicates += tally.pair_end_duplicates / 2;
            entry.unmapped_reads += tally.unmapped;
        }
        metrics
    }
}

/// Apply the fragment rule to `group`, which must be sorted.
pub fn mark_fragments(
    group: &[ReadEnds],
    duplicates: &DuplicateSet,
    tallies: &mut Tallies,
) -> Result<()> {
    let Some(first) = group.first() else { return Ok(()) };
    let tally = tallies.library(first.library);
    let unpaired = group.iter().filter(|e| !e.paired);
    tally.unpaired += unpaired.clone().count() as u64;

    if group.iter().any(|e| e.paired) {
        for end in unpaired {
            duplicates.insert(end.rank)?;
            tally.unpaired_duplicates += 1;
        }
        return Ok(());
    }

    let best = group.iter().min_by_key(|e| (Reverse(e.score), e.name_hash, e.rank)).map(|e| e.rank);
    for end in group.iter().filter(|e| Some(e.rank) != best) {
        duplicates.insert(end.rank)?;
        tally.unpaired_duplicates += 1;
    }
    Ok(())
}

/// Apply the pair rule to `group`, which must be sorted so templates are contiguous.
pub fn mark_pairs(
    group: &[ReadEnds],
    duplicates: &DuplicateSet,
    tallies: &mut Tallies,
) -> Result<()> {
    let Some(first) = group.first() else { return Ok(()) };
    let tally = tallies.library(first.library);
    tally.pair_ends += group.len() as u64;

    let templates: Vec<&[ReadEnds]> = group.chunk_by(|a, b| a.name_hash == b.name_hash).collect();
    if templates.len() < 2 {
        return Ok(());
    }
    let template_score = |t: &[ReadEnds]| t.iter().map(|e| u64::from(e.score)).sum::<u64>();
    let best = templates
        .iter()
        .enumerate()
        .min_by_key(|(_, t)| (Reverse(template_score(t)), t[0].name_hash, t[0].rank))
        .map(|(i, _)| i);

    for (i, template) in templates.iter().enumerate() {
        if Some(i) == best {
            continue;
        }
        for end in *template {
            duplicates.insert(end.rank)?;
            tally.pair_end_duplicates += 1;
        }
    }
    Ok(())
}
