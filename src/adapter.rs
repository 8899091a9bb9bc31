//! External iterator adapter: the seam between a caller-owned data source
//! and the page-management core.
//!
//! The caller supplies an object implementing [`RawBatchIterator`], a
//! `reset`/`next` pair where `next` stages one raw batch of rows into a
//! [`BatchProxy`] and reports whether data was produced. Both calls may
//! block (the source may be reading from a network or decompressing) and
//! may abort the process on malformed data, but must never silently skip
//! batches.
//!
//! Shape queries on a staged batch go through a host-side probe first; a
//! device-resident batch answers `None` there and is routed to the
//! device-side query path, which is only available when the crate is built
//! with the `cuda` feature. Without it, the fallback aborts with a
//! capability-missing message rather than reporting zero rows as valid.

use crate::meta::FeatureType;

// ============================================================================
// Raw batch representations
// ============================================================================

/// One chunk of rows as delivered by the external iterator.
///
/// Host variants can answer shape queries directly; the device variant is an
/// opaque handle whose shape is only queryable through the `cuda` path.
pub enum RawBatch {
    /// Row-major dense values, `num_rows * num_cols` long. Missing cells are
    /// represented by the dataset's missing sentinel (or NaN).
    Dense {
        values: Vec<f32>,
        num_rows: u64,
        num_cols: u64,
    },
    /// Pre-sparsified rows: `offsets` has `num_rows + 1` entries indexing
    /// into `indices`/`values`.
    Csr {
        offsets: Vec<u64>,
        indices: Vec<u32>,
        values: Vec<f32>,
        num_cols: u64,
    },
    /// GPU-resident batch. Shape lives on the device.
    Device(DeviceBatch),
}

impl RawBatch {
    /// Host-side row count probe. `None` means the representation cannot be
    /// inspected on the host and the caller must fall back to the device path.
    pub fn host_num_rows(&self) -> Option<u64> {
        match self {
            RawBatch::Dense { num_rows, .. } => Some(*num_rows),
            RawBatch::Csr { offsets, .. } => Some(offsets.len() as u64 - 1),
            RawBatch::Device(_) => None,
        }
    }

    /// Host-side column count probe; same contract as [`host_num_rows`](Self::host_num_rows).
    pub fn host_num_cols(&self) -> Option<u64> {
        match self {
            RawBatch::Dense { num_cols, .. } => Some(*num_cols),
            RawBatch::Csr { num_cols, .. } => Some(*num_cols),
            RawBatch::Device(_) => None,
        }
    }
}

/// Opaque handle to a device-resident raw batch.
///
/// The core never dereferences the device pointer; it only forwards shape
/// queries to the device path when built with `cuda`.
pub struct DeviceBatch {
    device_ordinal: u32,
    device_ptr: usize,
    num_rows: u64,
    num_cols: u64,
}

impl DeviceBatch {
    pub fn new(device_ordinal: u32, device_ptr: usize, num_rows: u64, num_cols: u64) -> Self {
        Self {
            device_ordinal,
            device_ptr,
            num_rows,
            num_cols,
        }
    }

    pub fn device_ordinal(&self) -> u32 {
        self.device_ordinal
    }

    pub fn device_ptr(&self) -> usize {
        self.device_ptr
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn device_num_rows(&self) -> u64 {
        self.num_rows
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn device_num_cols(&self) -> u64 {
        self.num_cols
    }

    #[cfg(not(feature = "cuda"))]
    pub(crate) fn device_num_rows(&self) -> u64 {
        let _ = (self.num_rows, self.num_cols);
        panic!(
            "raw batch on device {} cannot be inspected: sluice was built without the `cuda` feature",
            self.device_ordinal,
        );
    }

    #[cfg(not(feature = "cuda"))]
    pub(crate) fn device_num_cols(&self) -> u64 {
        panic!(
            "raw batch on device {} cannot be inspected: sluice was built without the `cuda` feature",
            self.device_ordinal,
        );
    }
}

// ============================================================================
// Batch proxy (staging buffer)
// ============================================================================

/// Staging buffer holding the most recently delivered raw batch, plus the
/// per-batch schema metadata the iterator chose to attach.
///
/// One proxy is shared between the external iterator and the primary row-page
/// source: `next` fills it, the source converts it, and the orchestrator's
/// metadata pass reads its shape, all against the same staged batch.
#[derive(Default)]
pub struct BatchProxy {
    batch: Option<RawBatch>,
    feature_types: Vec<FeatureType>,
}

impl BatchProxy {
    /// Stage a batch, replacing whatever was staged before.
    pub fn stage(&mut self, batch: RawBatch) {
        self.batch = Some(batch);
    }

    /// Stage a batch together with per-batch feature type tags.
    pub fn stage_with_types(&mut self, batch: RawBatch, feature_types: Vec<FeatureType>) {
        self.batch = Some(batch);
        self.feature_types = feature_types;
    }

    /// The staged batch.
    ///
    /// # Panics
    /// Panics if nothing is staged; querying an empty proxy means the
    /// iterator contract was violated.
    pub fn batch(&self) -> &RawBatch {
        self.batch
            .as_ref()
            .expect("batch proxy queried before the external iterator staged a batch")
    }

    /// Feature type tags attached to the staged batch (possibly empty).
    pub fn feature_types(&self) -> &[FeatureType] {
        &self.feature_types
    }

    /// Row count of the staged batch: host probe, then device fallback.
    pub fn num_rows(&self) -> u64 {
        let batch = self.batch();
        match batch.host_num_rows() {
            Some(n) => n,
            None => match batch {
                RawBatch::Device(d) => d.device_num_rows(),
                _ => unreachable!("host probe failed on a host batch"),
            },
        }
    }

    /// Column count of the staged batch: host probe, then device fallback.
    pub fn num_cols(&self) -> u64 {
        let batch = self.batch();
        match batch.host_num_cols() {
            Some(n) => n,
            None => match batch {
                RawBatch::Device(d) => d.device_num_cols(),
                _ => unreachable!("host probe failed on a host batch"),
            },
        }
    }
}

// ============================================================================
// Iterator contract
// ============================================================================

/// Caller-supplied restartable batch source.
///
/// `reset` restarts iteration from the first raw batch; `next` either stages
/// the next batch into `staging` and returns `true`, or returns `false` at
/// end-of-data. Implementations may block in either call and may panic on
/// malformed data, but must not silently skip batches.
pub trait RawBatchIterator: Send {
    fn reset(&mut self);
    fn next(&mut self, staging: &mut BatchProxy) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_probe_answers_for_host_batches() {
        let dense = RawBatch::Dense {
            values: vec![0.0; 6],
            num_rows: 2,
            num_cols: 3,
        };
        assert_eq!(dense.host_num_rows(), Some(2));
        assert_eq!(dense.host_num_cols(), Some(3));

        let csr = RawBatch::Csr {
            offsets: vec![0, 1, 3],
            indices: vec![0, 1, 2],
            values: vec![1.0, 2.0, 3.0],
            num_cols: 5,
        };
        assert_eq!(csr.host_num_rows(), Some(2));
        assert_eq!(csr.host_num_cols(), Some(5));
    }

    #[test]
    fn host_probe_declines_device_batches() {
        let dev = RawBatch::Device(DeviceBatch::new(0, 0xdead_beef, 10, 4));
        assert_eq!(dev.host_num_rows(), None);
        assert_eq!(dev.host_num_cols(), None);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    #[should_panic(expected = "without the `cuda` feature")]
    fn device_fallback_fails_without_gpu_support() {
        let mut proxy = BatchProxy::default();
        proxy.stage(RawBatch::Device(DeviceBatch::new(1, 0x1000, 10, 4)));
        let _ = proxy.num_rows();
    }

    #[cfg(feature = "cuda")]
    #[test]
    fn device_fallback_answers_with_gpu_support() {
        let mut proxy = BatchProxy::default();
        proxy.stage(RawBatch::Device(DeviceBatch::new(1, 0x1000, 10, 4)));
        assert_eq!(proxy.num_rows(), 10);
        assert_eq!(proxy.num_cols(), 4);
    }

    #[test]
    #[should_panic(expected = "before the external iterator staged")]
    fn empty_proxy_query_is_fatal() {
        let proxy = BatchProxy::default();
        let _ = proxy.num_rows();
    }
}
