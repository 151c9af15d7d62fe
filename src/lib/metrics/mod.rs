//! Duplication metrics accumulated by the read-ends merge.
//!
//! Interval merges report per-library counts through a [`MetricsSink`]; [`MetricsCollector`] sums
//! them and derives percent duplication and the estimated library size before the table is
//! written as TSV.

use std::path::Path;

use ahash::AHashMap;
use anyhow::Context;
use fgoxide::io::DelimFile;
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of decimal places used for float metrics.
pub const FLOAT_PRECISION: usize = 6;

/// Per-library duplicate marking counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicationMetrics {
    /// Library name from the read group `LB` field, or `Unknown Library`
    pub library: String,
    /// Mapped primary reads without a mapped mate
    pub unpaired_reads_examined: u64,
    /// Mapped primary pairs with both ends mapped
    pub read_pairs_examined: u64,
    /// Unmapped primary reads
    pub unmapped_reads: u64,
    /// Unpaired reads marked as duplicates
    pub unpaired_read_duplicates: u64,
    /// Pairs marked as duplicates
    pub read_pair_duplicates: u64,
    /// Fraction of examined reads marked as duplicates
    pub percent_duplication: f64,
    /// Estimated number of unique molecules in the library
    pub estimated_library_size: Option<u64>,
}

impl DuplicationMetrics {
    #[must_use]
    pub fn new(library: impl Into<String>) -> Self {
        Self { library: library.into(), ..Self::default() }
    }

    /// Add the raw counts of `other`; derived fields are left for [`Self::finalize`].
    pub fn merge(&mut self, other: &Self) {
        self.unpaired_reads_examined += other.unpaired_reads_examined;
        self.read_pairs_examined += other.read_pairs_examined;
        self.unmapped_reads += other.unmapped_reads;
        self.unpaired_read_duplicates += other.unpaired_read_duplicates;
        self.read_pair_duplicates += other.read_pair_duplicates;
    }

    /// Compute percent duplication and the library size estimate from the counts.
    pub fn finalize(&mut self) {
        let examined = self.unpaired_reads_examined + 2 * self.read_pairs_examined;
        let duplicates = self.unpaired_read_duplicates + 2 * self.read_pair_duplicates;
        #[expect(clippy::cast_precision_loss, reason = "read counts never exceed 2^53")]
        let fraction = if examined == 0 { 0.0 } else { duplicates as f64 / examined as f64 };
        self.percent_duplication = round(fraction);
        self.estimated_library_size = estimate_library_size(
            self.read_pairs_examined,
            self.read_pairs_examined.saturating_sub(self.read_pair_duplicates),
        );
    }
}

fn round(value: f64) -> f64 {
    let scale = 10f64.powi(FLOAT_PRECISION as i32);
    (value * scale).round() / scale
}

/// Library size from the Lander-Waterman equation `C/X = 1 - exp(-N/X)`, solved by bisection.
///
/// Returns `None` when there are no pairs, no duplicates, or the counts admit no solution.
#[must_use]
#[expect(clippy::cast_precision_loss, reason = "read counts never exceed 2^53")]
pub fn estimate_library_size(read_pairs: u64, unique_read_pairs: u64) -> Option<u64> {
    if read_pairs == 0 || unique_read_pairs == 0 || unique_read_pairs >= read_pairs {
        return None;
    }
    let n = read_pairs as f64;
    let c = unique_read_pairs as f64;
    let f = |x: f64| c / x - 1.0 + (-n / x).exp();

    let mut lower = 1.0;
    let mut upper = 100.0;
    if f(lower * c) < 0.0 {
        return None;
    }
    while f(upper * c) > 0.0 {
        upper *= 10.0;
    }
    for _ in 0..40 {
        let mid = (lower + upper) / 2.0;
        let value = f(mid * c);
        if value == 0.0 {
            break;
        } else if value > 0.0 {
            lower = mid;
        } else {
            upper = mid;
        }
    }
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "positive estimate"
    )]
    let size = (c * (lower + upper) / 2.0) as u64;
    Some(size)
}

/// Receives per-library counts from the duplicate marking merge.
pub trait MetricsSink: Send + Sync {
    fn add_duplication_metrics(&self, metrics: AHashMap<String, DuplicationMetrics>);
}

/// Sums everything reported to it.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    libraries: Mutex<AHashMap<String, DuplicationMetrics>>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalized metrics, one row per library in name order.
    #[must_use]
    pub fn metrics(&self) -> Vec<DuplicationMetrics> {
        let mut rows: Vec<DuplicationMetrics> = self.libraries.lock().values().cloned().collect();
        rows.iter_mut().for_each(DuplicationMetrics::finalize);
        rows.sort_by(|a, b| a.library.cmp(&b.library));
        rows
    }
}

impl MetricsSink for MetricsCollector {
    fn add_duplication_metrics(&self, metrics: AHashMap<String, DuplicationMetrics>) {
        let mut libraries = self.libraries.lock();
        for (library, counts) in metrics {
            libraries
                .entry(library)
                .or_insert_with_key(|name| DuplicationMetrics::new(name.clone()))
                .merge(&counts);
        }
    }
}

/// Write `metrics` as a TSV file with a header row.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_metrics(path: &Path, metrics: Vec<DuplicationMetrics>) -> anyhow::Result<()> {
    DelimFile::default()
        .write_tsv(&path, metrics)
        .with_context(|| format!("Failed to write duplication metrics: {}", path.display()))?;
    info!("Wrote duplication metrics to {}", path.display());
    Ok(())
}
