//! Dataset-wide metadata: shape accounting and feature type tags.
//!
//! `DatasetMeta` is populated during the orchestrator's single
//! metadata-gathering pass and is immutable afterwards. Row and nonzero
//! counts are strictly additive across raw batches; the column count is a
//! running maximum that is reconciled across workers with one max-reduction
//! at the end of the pass. The finished metadata is persisted as JSON next
//! to the page cache so tooling can inspect a cache without replaying it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Semantic tag for a feature column.
///
/// The histogram-index pipeline carries these tags alongside the bin cuts;
/// the split finder downstream treats quantitative and categorical bins
/// differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FeatureType {
    Numerical = 0,
    Categorical = 1,
}

/// Shape and schema of the full logical dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetMeta {
    /// Total rows across all raw batches (sum).
    pub num_rows: u64,
    /// Column count: per-batch maximum, then max-reduced across workers.
    pub num_cols: u64,
    /// Total stored (non-missing) entries across all raw batches (sum).
    pub num_nonzero: u64,
    /// Per-feature type tags. Empty when the data source provides none,
    /// in which case every feature is treated as numerical.
    pub feature_types: Vec<FeatureType>,
}

impl DatasetMeta {
    /// Merge one raw batch's schema-level metadata into the dataset-wide
    /// record, without touching the global accumulators (rows, columns,
    /// nonzeros), which are owned by the orchestrator's pass.
    ///
    /// Feature type tags are adopted from the first batch that carries them.
    ///
    /// # Panics
    /// Panics if a later batch carries tags that contradict the adopted ones;
    /// a dataset whose batches disagree on schema is unusable.
    pub fn merge_batch(&mut self, feature_types: &[FeatureType]) {
        if feature_types.is_empty() {
            return;
        }
        if self.feature_types.is_empty() {
            self.feature_types = feature_types.to_vec();
            return;
        }
        assert_eq!(
            self.feature_types, feature_types,
            "feature type tags differ between raw batches",
        );
    }

    /// True when every cell of the `num_rows` × `num_cols` grid is stored.
    pub fn is_dense(&self) -> bool {
        self.num_nonzero == self.num_rows * self.num_cols
    }

    /// Serialize to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), DataError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Deserialize from a JSON file.
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adopts_first_nonempty_tags() {
        let mut meta = DatasetMeta::default();
        meta.merge_batch(&[]);
        assert!(meta.feature_types.is_empty());

        meta.merge_batch(&[FeatureType::Numerical, FeatureType::Categorical]);
        assert_eq!(meta.feature_types.len(), 2);

        // Identical tags from a later batch are fine.
        meta.merge_batch(&[FeatureType::Numerical, FeatureType::Categorical]);
        assert_eq!(meta.feature_types.len(), 2);
    }

    #[test]
    #[should_panic(expected = "feature type tags differ")]
    fn merge_rejects_conflicting_tags() {
        let mut meta = DatasetMeta::default();
        meta.merge_batch(&[FeatureType::Numerical]);
        meta.merge_batch(&[FeatureType::Categorical]);
    }

    #[test]
    fn density_check() {
        let meta = DatasetMeta {
            num_rows: 4,
            num_cols: 3,
            num_nonzero: 12,
            feature_types: Vec::new(),
        };
        assert!(meta.is_dense());

        let sparse = DatasetMeta {
            num_nonzero: 7,
            ..meta
        };
        assert!(!sparse.is_dense());
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let meta = DatasetMeta {
            num_rows: 300,
            num_cols: 20,
            num_nonzero: 4123,
            feature_types: vec![FeatureType::Numerical; 20],
        };
        meta.save(&path).unwrap();
        let loaded = DatasetMeta::load(&path).unwrap();
        assert_eq!(loaded.num_rows, 300);
        assert_eq!(loaded.num_cols, 20);
        assert_eq!(loaded.num_nonzero, 4123);
        assert_eq!(loaded.feature_types, meta.feature_types);
    }
}
