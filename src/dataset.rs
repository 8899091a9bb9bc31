//! The dataset orchestrator: owns the iterator adapter, the cache registry,
//! and at most one live instance of each page-source variant.
//!
//! Construction performs exactly one pass over the external iterator. The
//! staging proxy is read alongside the row-page source, so shape accounting
//! (rows, columns, nonzeros) and row-page caching happen in the same pass;
//! afterwards the iterator is reset (left ready for the caller) and the
//! column count is max-reduced across workers. A dataset that ends up with
//! zero columns aborts; there is no partial-success mode.
//!
//! Every "get batches" call lazily initializes (or rewinds) the requested
//! page-source chain and returns a restartable [`Batches`] sequence. Once
//! the row cache is fully written the external iterator and its staging
//! buffer are released; all later passes, for every format, replay from
//! disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rayon::ThreadPool;
use tracing::{debug, info};

use crate::adapter::{BatchProxy, RawBatchIterator};
use crate::batch::Batches;
use crate::cache::{
    cache_file_path, CacheRegistry, MatrixId, COLUMN_PAGE_SUFFIX, HISTOGRAM_PAGE_SUFFIX,
    META_SUFFIX, ROW_PAGE_SUFFIX, SORTED_COLUMN_PAGE_SUFFIX,
};
use crate::cuts::{compute_cuts, BinCuts};
use crate::dist::Communicator;
use crate::error::DataError;
use crate::meta::DatasetMeta;
use crate::page::{ColumnPage, HistogramPage, RowPage, SortedColumnPage};
use crate::source::{
    ColumnPageSource, ColumnTransform, DerivedSource, HistogramPageSource, HistogramTransform,
    IterState, PageSource, RowPageSource, SharedIter, SortedColumnPageSource,
    SortedColumnTransform,
};

/// Cache prefix used when the caller does not supply one.
const DEFAULT_CACHE_PREFIX: &str = "dataset";

// ============================================================================
// Configuration
// ============================================================================

/// Construction-time configuration for a [`PagedDataset`].
pub struct DatasetConfig {
    /// Sentinel value treated as a missing cell (NaN always counts).
    pub missing: f32,
    /// Worker threads for page encode/transpose/quantize work.
    /// `0` means one thread per core.
    pub nthreads: usize,
    /// Path prefix for all cache files. Defaults to `"dataset"` in the
    /// working directory; a per-rank marker is appended when distributed.
    pub cache_prefix: Option<PathBuf>,
    /// Collective used for the construction-time column-count reduction.
    pub comm: Arc<dyn Communicator>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            missing: f32::NAN,
            nthreads: 0,
            cache_prefix: None,
            comm: crate::dist::single_worker(),
        }
    }
}

impl DatasetConfig {
    pub fn missing(mut self, missing: f32) -> Self {
        self.missing = missing;
        self
    }

    pub fn nthreads(mut self, nthreads: usize) -> Self {
        self.nthreads = nthreads;
        self
    }

    pub fn cache_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.cache_prefix = Some(prefix.into());
        self
    }

    pub fn communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }
}

/// Parameters controlling histogram-index generation.
///
/// Equality deliberately compares `max_bin` only: the per-row weights are
/// fresh data every boosting iteration and carrying them into the staleness
/// check would invalidate the cache on every call, and `regen` is a request,
/// not an identity. The all-default value (`max_bin == 0`) acts as a
/// wildcard that never triggers invalidation.
#[derive(Debug, Clone, Default)]
pub struct BatchParam {
    /// Maximum number of quantile bins per feature. Must be at least 2 for
    /// any histogram-batch request.
    pub max_bin: u32,
    /// Optional per-row weights (global row id order) applied to the
    /// quantile sketch. Their presence selects the disk-backed regime.
    pub weights: Option<Arc<[f32]>>,
    /// Force a rebuild of cuts and pages even if a cache exists; the
    /// rebuild uses exact sorted-order statistics.
    pub regen: bool,
}

impl BatchParam {
    pub fn with_max_bin(max_bin: u32) -> Self {
        Self {
            max_bin,
            ..Self::default()
        }
    }

    pub fn weights(mut self, weights: Arc<[f32]>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn regen(mut self, regen: bool) -> Self {
        self.regen = regen;
        self
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

impl PartialEq for BatchParam {
    fn eq(&self, other: &Self) -> bool {
        self.max_bin == other.max_bin
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// An external-memory dataset: rows live in on-disk pages, iterated lazily
/// in the format the training loop asks for.
pub struct PagedDataset {
    id: MatrixId,
    missing: f32,
    pool: Arc<ThreadPool>,
    prefix: PathBuf,
    comm: Arc<dyn Communicator>,
    /// Shared iterator + staging buffer; dropped once the row cache is
    /// fully written, releasing the caller's data source.
    iter: Option<SharedIter>,
    registry: CacheRegistry,
    meta: DatasetMeta,
    meta_path: PathBuf,
    n_pages: u32,

    row_source: Option<Arc<Mutex<RowPageSource>>>,
    column_source: Option<Arc<Mutex<ColumnPageSource>>>,
    sorted_source: Option<Arc<Mutex<SortedColumnPageSource>>>,
    hist_source: Option<Arc<Mutex<HistogramPageSource>>>,

    /// Whole-dataset page for the in-memory histogram regime.
    hist_single: Option<Arc<HistogramPage>>,
    /// Cuts behind the most recent histogram build (either regime).
    last_cuts: Option<Arc<BinCuts>>,
    /// Parameters of the most recent histogram build; a pure invalidation
    /// gate, not a state machine.
    last_param: BatchParam,
}

impl PagedDataset {
    /// Ingest a dataset through `iter`, performing the single
    /// metadata-gathering pass (which also writes the row-page cache).
    ///
    /// # Panics
    /// Panics if the reduced column count is zero: a dataset with no
    /// columns is invalid and there is no recovery path.
    pub fn new(iter: Box<dyn RawBatchIterator>, config: DatasetConfig) -> Result<Self, DataError> {
        let DatasetConfig {
            missing,
            nthreads,
            cache_prefix,
            comm,
        } = config;

        let mut prefix = cache_prefix.unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PREFIX));
        if comm.is_distributed() {
            let mut name = prefix.into_os_string();
            name.push(format!("-r{}", comm.rank()));
            prefix = PathBuf::from(name);
        }

        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(nthreads)
                .build()?,
        );
        let id = MatrixId::next();
        let meta_path = cache_file_path(&prefix, id, 0, META_SUFFIX);

        let mut dataset = Self {
            id,
            missing,
            pool,
            prefix,
            comm,
            iter: Some(Arc::new(Mutex::new(IterState {
                iter,
                proxy: BatchProxy::default(),
            }))),
            registry: CacheRegistry::new(),
            meta: DatasetMeta::default(),
            meta_path,
            n_pages: 0,
            row_source: None,
            column_source: None,
            sorted_source: None,
            hist_source: None,
            hist_single: None,
            last_cuts: None,
            last_param: BatchParam::default(),
        };

        info!(
            prefix = %dataset.prefix.display(),
            threads = nthreads,
            "starting dataset metadata pass",
        );

        // The proxy is iterated together with the row-page source, so all
        // shape information is collected in one pass while the row pages
        // are cached as a side effect.
        let mut n_rows = 0u64;
        let mut n_cols = 0u64;
        let mut nnz = 0u64;
        let mut n_batches = 0u32;

        dataset.initialize_row_source();
        let source = Arc::clone(dataset.row_source.as_ref().unwrap());
        loop {
            let page = source.lock().unwrap().advance();
            let Some(page) = page else { break };
            {
                let shared = dataset
                    .iter
                    .as_ref()
                    .expect("iterator released during the metadata pass");
                let state = shared.lock().unwrap();
                n_cols = n_cols.max(state.proxy.num_cols());
                n_rows += state.proxy.num_rows();
                dataset.meta.merge_batch(state.proxy.feature_types());
            }
            nnz += page.nnz();
            n_batches += 1;
        }

        // Leave the iterator rewound and ready for the caller.
        dataset
            .iter
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .iter
            .reset();

        dataset.n_pages = n_batches;
        dataset.meta.num_rows = n_rows;
        dataset.meta.num_cols = dataset.comm.allreduce_max(n_cols);
        dataset.meta.num_nonzero = nnz;
        assert_ne!(
            dataset.meta.num_cols, 0,
            "dataset has zero columns after the distributed reduction and cannot be used for training",
        );
        dataset.meta.save(&dataset.meta_path)?;

        // The row cache is complete; the iterator and staging buffer are
        // no longer needed by any page source.
        dataset.iter = None;

        info!(
            rows = n_rows,
            cols = dataset.meta.num_cols,
            nnz,
            pages = n_batches,
            "dataset metadata pass complete",
        );
        Ok(dataset)
    }

    /// Dataset-wide shape and schema. Never mutated after construction.
    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    /// Number of row pages in the cache (one per raw batch).
    pub fn n_pages(&self) -> u32 {
        self.n_pages
    }

    /// Effective cache prefix (per-rank marker included when distributed).
    pub fn cache_prefix(&self) -> &Path {
        &self.prefix
    }

    /// Cuts behind the most recent histogram build, if any.
    pub fn bin_cuts(&self) -> Option<&Arc<BinCuts>> {
        self.last_cuts.as_ref()
    }

    /// Create the primary row-page source, or rewind the existing one.
    ///
    /// While the row cache is not yet fully written, any existing instance
    /// is discarded and a fresh one is bound to the iterator/proxy pairing;
    /// afterwards the cached instance is reused forever.
    fn initialize_row_source(&mut self) {
        let entry = self
            .registry
            .get_or_create(self.id, ROW_PAGE_SUFFIX, &self.prefix);
        if entry.is_written() {
            let source = self
                .row_source
                .as_ref()
                .expect("row page cache is written but no row page source exists");
            source.lock().unwrap().reset();
            return;
        }
        let iter = Arc::clone(
            self.iter
                .as_ref()
                .expect("row page cache is absent but the external iterator was released"),
        );
        // Drop any previous instance before creating the new one to avoid
        // two writers on the same cache file.
        self.row_source = None;
        self.row_source = Some(Arc::new(Mutex::new(RowPageSource::new(
            iter,
            self.missing,
            Arc::clone(&self.pool),
            entry,
        ))));
    }

    /// Lazy sequence of row pages, replayed from the start.
    pub fn row_batches(&mut self) -> Batches<RowPage> {
        self.initialize_row_source();
        let source = Arc::clone(self.row_source.as_ref().unwrap());
        Batches::from_source(source as Arc<Mutex<dyn PageSource<Page = RowPage>>>)
    }

    /// Lazy sequence of column pages (transposed), derived and cached on
    /// first use.
    ///
    /// # Panics
    /// Panics if dataset metadata has not been established (zero columns).
    pub fn column_batches(&mut self) -> Batches<ColumnPage> {
        let entry = self
            .registry
            .get_or_create(self.id, COLUMN_PAGE_SUFFIX, &self.prefix);
        assert_ne!(
            self.meta.num_cols, 0,
            "column batches requested before dataset metadata was established",
        );
        self.initialize_row_source();
        match &self.column_source {
            Some(source) => source.lock().unwrap().reset(),
            None => {
                let upstream = Arc::clone(self.row_source.as_ref().unwrap());
                self.column_source = Some(Arc::new(Mutex::new(DerivedSource::new(
                    upstream,
                    ColumnTransform {
                        num_cols: self.meta.num_cols,
                    },
                    entry,
                ))));
            }
        }
        let source = Arc::clone(self.column_source.as_ref().unwrap());
        Batches::from_source(source as Arc<Mutex<dyn PageSource<Page = ColumnPage>>>)
    }

    /// Lazy sequence of value-ordered column pages.
    ///
    /// # Panics
    /// Panics if dataset metadata has not been established (zero columns).
    pub fn sorted_column_batches(&mut self) -> Batches<SortedColumnPage> {
        let entry =
            self.registry
                .get_or_create(self.id, SORTED_COLUMN_PAGE_SUFFIX, &self.prefix);
        assert_ne!(
            self.meta.num_cols, 0,
            "sorted column batches requested before dataset metadata was established",
        );
        self.initialize_row_source();
        match &self.sorted_source {
            Some(source) => source.lock().unwrap().reset(),
            None => {
                let upstream = Arc::clone(self.row_source.as_ref().unwrap());
                self.sorted_source = Some(Arc::new(Mutex::new(DerivedSource::new(
                    upstream,
                    SortedColumnTransform {
                        num_cols: self.meta.num_cols,
                        pool: Arc::clone(&self.pool),
                    },
                    entry,
                ))));
            }
        }
        let source = Arc::clone(self.sorted_source.as_ref().unwrap());
        Batches::from_source(source as Arc<Mutex<dyn PageSource<Page = SortedColumnPage>>>)
    }

    /// Lazy sequence of histogram-index pages under `param`.
    ///
    /// Without row weights and without a forced regeneration, the index is
    /// built once as a single whole-dataset page held in memory and served
    /// as a one-element sequence, rebuilt only when parameters change.
    /// Otherwise the disk-backed derived source is used, with stale caches
    /// erased and recreated, and cuts computed from sorted-order statistics
    /// when the regeneration was forced.
    ///
    /// # Panics
    /// Panics if `param.max_bin < 2` (before any I/O occurs), or if the
    /// computed cuts come out empty.
    pub fn histogram_batches(&mut self, param: &BatchParam) -> Batches<HistogramPage> {
        assert!(
            param.max_bin >= 2,
            "histogram batches require max_bin >= 2, got {}",
            param.max_bin,
        );

        if param.weights.is_none() && !param.regen {
            // In-memory regime: external-memory histogram construction for
            // this case concatenates everything into one page.
            if self.hist_single.is_none() || (*param != self.last_param && !param.is_default()) {
                debug!(max_bin = param.max_bin, "building in-memory histogram index");
                self.initialize_row_source();
                let cuts = Arc::new(self.sketch_cuts(param.max_bin, None, false));
                assert!(
                    !cuts.is_empty(),
                    "computed histogram cuts are empty; dataset cannot be quantized",
                );

                self.initialize_row_source();
                let dense = self.meta.is_dense();
                let source = Arc::clone(self.row_source.as_ref().unwrap());
                let mut pages = Vec::new();
                loop {
                    let page = source.lock().unwrap().advance();
                    let Some(page) = page else { break };
                    pages.push(HistogramPage::from_row_page(&page, &cuts, dense, &self.pool));
                }
                let page = HistogramPage::concat(&pages);

                self.initialize_row_source();
                self.last_param = param.clone();
                self.last_cuts = Some(cuts);
                self.hist_single = Some(Arc::new(page));
            }
            return Batches::single(Arc::clone(self.hist_single.as_ref().unwrap()));
        }

        // Disk-backed regime.
        let entry = self
            .registry
            .get_or_create(self.id, HISTOGRAM_PAGE_SUFFIX, &self.prefix);
        self.initialize_row_source();
        let stale = !entry.is_written()
            || (self.last_param != *param && !param.is_default())
            || param.regen;
        if stale {
            self.registry
                .erase(self.id, HISTOGRAM_PAGE_SUFFIX, &self.prefix);
            let entry = self
                .registry
                .get_or_create(self.id, HISTOGRAM_PAGE_SUFFIX, &self.prefix);

            // Sorted-order statistics for a forced regeneration.
            let sorted = param.regen;
            let cuts = Arc::new(self.sketch_cuts(
                param.max_bin,
                param.weights.as_deref(),
                sorted,
            ));
            self.initialize_row_source();

            self.last_param = param.clone();
            self.hist_source = None;
            assert!(
                !cuts.is_empty(),
                "computed histogram cuts are empty; dataset cannot be quantized",
            );
            let transform = HistogramTransform::new(
                Arc::clone(&cuts),
                self.meta.feature_types.clone(),
                self.meta.is_dense(),
                Arc::clone(&self.pool),
            );
            let upstream = Arc::clone(self.row_source.as_ref().unwrap());
            self.hist_source = Some(Arc::new(Mutex::new(DerivedSource::new(
                upstream, transform, entry,
            ))));
            self.last_cuts = Some(cuts);
        } else {
            let source = self
                .hist_source
                .as_ref()
                .expect("histogram cache is written but no histogram source exists");
            source.lock().unwrap().reset();
        }
        let source = Arc::clone(self.hist_source.as_ref().unwrap());
        Batches::from_source(source as Arc<Mutex<dyn PageSource<Page = HistogramPage>>>)
    }

    /// Compute bin cuts from a full replay of the row-page sequence.
    fn sketch_cuts(&self, max_bin: u32, weights: Option<&[f32]>, sorted: bool) -> BinCuts {
        let source = Arc::clone(
            self.row_source
                .as_ref()
                .expect("row page source missing during cut computation"),
        );
        let mut guard = source.lock().unwrap();
        guard.reset();
        let pages = std::iter::from_fn(|| guard.advance());
        compute_cuts(
            pages,
            self.meta.num_cols,
            max_bin,
            weights,
            sorted,
            &self.pool,
        )
    }
}

impl Drop for PagedDataset {
    fn drop(&mut self) {
        // Cache files live exactly as long as the owning dataset.
        for path in self.registry.paths() {
            let _ = std::fs::remove_file(path);
        }
        let _ = std::fs::remove_file(&self.meta_path);
        debug!(id = %self.id, "removed page cache files");
    }
}
