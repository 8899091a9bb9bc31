//! Global bin-boundary cuts for histogram-index pages.
//!
//! Cuts are per-feature value thresholds computed once over the whole
//! dataset; a stored value is replaced by the index of the bin it falls in.
//! Thresholds for all features are packed CSR-style so a feature's global
//! bin-id range is `cut_ptrs[f]..cut_ptrs[f+1]`, which lets histogram
//! builders allocate one flat bin array for the entire dataset.
//!
//! Cut computation replays the row-page sequence. When exact (sorted-order)
//! statistics are requested every stored value is retained; otherwise values
//! are decimated with a doubling stride so memory stays bounded while the
//! quantile targets remain close to exact. Optional per-row weights shift
//! the quantile mass; rows are addressed by global row id (`base_rowid` +
//! page-local row).

use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use crate::page::RowPage;

/// Per-feature quantile thresholds, packed across features.
///
/// `cut_ptrs[f]` is both the offset of feature `f`'s thresholds in
/// `cut_values` and the global id of its first bin.
#[derive(Debug, Clone, PartialEq)]
pub struct BinCuts {
    cut_values: Vec<f32>,
    cut_ptrs: Vec<u32>,
}

impl BinCuts {
    /// Assemble from per-feature threshold lists (each sorted ascending).
    pub fn from_feature_cuts(features: &[Vec<f32>]) -> Self {
        let mut cut_values = Vec::new();
        let mut cut_ptrs = Vec::with_capacity(features.len() + 1);
        cut_ptrs.push(0u32);
        for cuts in features {
            debug_assert!(cuts.windows(2).all(|w| w[0] <= w[1]));
            cut_values.extend_from_slice(cuts);
            cut_ptrs.push(cut_values.len() as u32);
        }
        Self {
            cut_values,
            cut_ptrs,
        }
    }

    pub fn num_features(&self) -> u64 {
        self.cut_ptrs.len() as u64 - 1
    }

    /// Thresholds for one feature (bin upper bounds).
    pub fn feature_cuts(&self, feature: u32) -> &[f32] {
        let start = self.cut_ptrs[feature as usize] as usize;
        let end = self.cut_ptrs[feature as usize + 1] as usize;
        &self.cut_values[start..end]
    }

    /// Global id of feature `f`'s first bin.
    pub fn feature_offset(&self, feature: u32) -> u32 {
        self.cut_ptrs[feature as usize]
    }

    /// Total bins across all features.
    pub fn total_bins(&self) -> u32 {
        self.cut_values.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.cut_values.is_empty()
    }

    /// Map a value of `feature` to its global bin id.
    ///
    /// The local bin is the number of thresholds `<= value`, clamped into
    /// the feature's range so out-of-distribution values land in the last
    /// bin. Missing values never reach here; they are dropped at row-page
    /// materialization.
    ///
    /// # Panics
    /// Panics if `feature` is out of range.
    #[inline]
    pub fn search_bin(&self, feature: u32, value: f32) -> u32 {
        let cuts = self.feature_cuts(feature);
        assert!(
            !cuts.is_empty(),
            "feature {feature} has no bin thresholds",
        );
        let local = cuts.partition_point(|&c| c <= value);
        self.feature_offset(feature) + (local as u32).min(cuts.len() as u32 - 1)
    }
}

/// Per-feature value accumulator with stride decimation for the
/// approximate-order regime.
struct FeatureSamples {
    /// (value, weight) pairs retained so far.
    entries: Vec<(f32, f32)>,
    /// Only every `stride`-th observation is retained.
    stride: usize,
    seen: usize,
}

impl FeatureSamples {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            stride: 1,
            seen: 0,
        }
    }

    fn push(&mut self, value: f32, weight: f32, cap: Option<usize>) {
        if self.seen % self.stride == 0 {
            // A retained entry stands in for `stride` observations.
            self.entries.push((value, weight * self.stride as f32));
            if let Some(cap) = cap {
                if self.entries.len() >= cap * 2 {
                    // Halve the retained set and double the stride; weights
                    // of dropped entries are folded into the survivors by
                    // doubling, preserving total quantile mass.
                    let mut kept = Vec::with_capacity(cap);
                    for (i, &(v, w)) in self.entries.iter().enumerate() {
                        if i % 2 == 0 {
                            kept.push((v, w * 2.0));
                        }
                    }
                    self.entries = kept;
                    self.stride *= 2;
                }
            }
        }
        self.seen += 1;
    }
}

/// Compute global bin-boundary cuts from a replay of the row-page sequence.
///
/// `max_bin` bounds the number of bins per feature. `weights`, when present,
/// holds one weight per dataset row (global row id order). `sorted` selects
/// exact sorted-order statistics (every value retained) over the decimated
/// approximation. Features with no stored values get a single zero
/// threshold so every feature owns at least one bin.
///
/// # Panics
/// Panics if `weights` is too short for an observed row id.
pub fn compute_cuts<I>(
    pages: I,
    num_cols: u64,
    max_bin: u32,
    weights: Option<&[f32]>,
    sorted: bool,
    pool: &ThreadPool,
) -> BinCuts
where
    I: Iterator<Item = Arc<RowPage>>,
{
    let cap = if sorted {
        None
    } else {
        Some((max_bin as usize * 16).max(256))
    };

    let mut samples: Vec<FeatureSamples> = (0..num_cols).map(|_| FeatureSamples::new()).collect();
    let mut rows_seen = 0u64;
    for page in pages {
        for r in 0..page.num_rows() {
            let row_id = page.base_rowid() + r;
            let w = match weights {
                Some(ws) => {
                    assert!(
                        (row_id as usize) < ws.len(),
                        "row weight vector has {} entries but row {row_id} was observed",
                        ws.len(),
                    );
                    ws[row_id as usize]
                }
                None => 1.0,
            };
            for (&c, &v) in page.row_indices(r).iter().zip(page.row_values(r)) {
                samples[c as usize].push(v, w, cap);
            }
        }
        rows_seen += page.num_rows();
    }
    debug!(
        rows = rows_seen,
        features = num_cols,
        max_bin,
        sorted,
        "computed quantile samples for bin cuts",
    );

    let feature_cuts: Vec<Vec<f32>> = pool.install(|| {
        samples
            .into_par_iter()
            .map(|mut fs| {
                if fs.entries.is_empty() {
                    // No stored values for this feature: a single threshold
                    // keeps the global bin-id space contiguous.
                    return vec![0.0f32];
                }
                fs.entries.sort_by(|a, b| a.0.total_cmp(&b.0));
                let total: f64 = fs.entries.iter().map(|e| e.1 as f64).sum();

                let mut cuts = Vec::new();
                let mut cum = 0.0f64;
                let mut q = 1u32;
                for &(v, w) in &fs.entries {
                    cum += w as f64;
                    while q < max_bin && cum >= total * q as f64 / max_bin as f64 {
                        cuts.push(v);
                        q += 1;
                    }
                }
                // The final threshold is the feature maximum, so every
                // stored value maps into the last bin or below.
                cuts.push(fs.entries.last().unwrap().0);
                cuts.dedup();
                cuts
            })
            .collect()
    });

    BinCuts::from_feature_cuts(&feature_cuts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{BatchProxy, RawBatch};

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn single_column_page(values: &[f32]) -> Arc<RowPage> {
        let mut proxy = BatchProxy::default();
        proxy.stage(RawBatch::Dense {
            values: values.to_vec(),
            num_rows: values.len() as u64,
            num_cols: 1,
        });
        Arc::new(RowPage::from_proxy(&proxy, f32::NAN, 0, &pool()))
    }

    #[test]
    fn bin_search_edges() {
        let cuts = BinCuts::from_feature_cuts(&[vec![1.0, 2.0, 3.0], vec![10.0]]);
        assert_eq!(cuts.num_features(), 2);
        assert_eq!(cuts.total_bins(), 4);

        // Below the first threshold, between thresholds, on a threshold,
        // and above the maximum (clamped into the last bin).
        assert_eq!(cuts.search_bin(0, 0.5), 0);
        assert_eq!(cuts.search_bin(0, 1.5), 1);
        assert_eq!(cuts.search_bin(0, 2.0), 2);
        assert_eq!(cuts.search_bin(0, 99.0), 2);

        // Second feature's bins start at its global offset.
        assert_eq!(cuts.feature_offset(1), 3);
        assert_eq!(cuts.search_bin(1, 5.0), 3);
        assert_eq!(cuts.search_bin(1, 50.0), 3);
    }

    #[test]
    fn exact_quantiles_split_uniform_values() {
        let page = single_column_page(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let cuts = compute_cuts([page].into_iter(), 1, 2, None, true, &pool());
        // Half the mass falls at or below 4, and the maximum closes the range.
        assert_eq!(cuts.feature_cuts(0), &[4.0, 8.0]);
    }

    #[test]
    fn weights_shift_quantile_mass() {
        let page = single_column_page(&[1.0, 2.0, 3.0, 4.0]);
        // Unweighted median threshold is 2; loading row 0 drags it to 1.
        let weights = vec![10.0, 1.0, 1.0, 1.0];
        let cuts = compute_cuts([page].into_iter(), 1, 2, Some(&weights), true, &pool());
        assert_eq!(cuts.feature_cuts(0)[0], 1.0);
    }

    #[test]
    fn empty_feature_gets_sentinel_cut() {
        // Column 1 never stores a value (all zero with a 0.0 missing sentinel).
        let mut proxy = BatchProxy::default();
        proxy.stage(RawBatch::Dense {
            values: vec![1.0, 0.0, 2.0, 0.0],
            num_rows: 2,
            num_cols: 2,
        });
        let page = Arc::new(RowPage::from_proxy(&proxy, 0.0, 0, &pool()));
        let cuts = compute_cuts([page].into_iter(), 2, 4, None, true, &pool());
        assert_eq!(cuts.feature_cuts(1), &[0.0]);
        assert!(!cuts.is_empty());
    }

    #[test]
    fn decimation_keeps_cuts_close_to_exact() {
        let values: Vec<f32> = (1..=10_000).map(|i| i as f32).collect();
        let page = single_column_page(&values);
        let approx = compute_cuts([page.clone()].into_iter(), 1, 4, None, false, &pool());
        let exact = compute_cuts([page].into_iter(), 1, 4, None, true, &pool());
        assert_eq!(approx.feature_cuts(0).len(), exact.feature_cuts(0).len());
        for (a, e) in approx.feature_cuts(0).iter().zip(exact.feature_cuts(0)) {
            let rel = (a - e).abs() / e;
            assert!(rel < 0.05, "approximate cut {a} too far from exact {e}");
        }
    }

    #[test]
    #[should_panic(expected = "row weight vector")]
    fn short_weight_vector_is_fatal() {
        let page = single_column_page(&[1.0, 2.0, 3.0]);
        let weights = vec![1.0];
        let _ = compute_cuts([page].into_iter(), 1, 2, Some(&weights), true, &pool());
    }
}
