//! Page sources: restartable generators of one page format.
//!
//! The primary [`RowPageSource`] pulls raw batches from the external
//! iterator on a cache miss, writing each encoded page to disk as it is
//! produced; once the pass completes it releases the iterator and all later
//! passes replay from disk. Derived sources ([`DerivedSource`]) transform
//! row pages into another layout, with the same write-once / replay-forever
//! cache discipline. Several derived sources may share one upstream row
//! source; each replay explicitly resets the upstream first and never
//! assumes it retained its position.
//!
//! Every source follows the same protocol: `reset` rewinds to the first
//! page (valid at any time; a reset mid-generation discards the partial
//! cache file and starts the pass over), `advance` produces the next page
//! or signals end-of-sequence, and a completed pass flips the cache entry's
//! "written" flag exactly once.

use std::sync::{Arc, Mutex};

use rayon::ThreadPool;
use tracing::info;

use crate::adapter::{BatchProxy, RawBatchIterator};
use crate::cache::CacheEntry;
use crate::cuts::BinCuts;
use crate::meta::FeatureType;
use crate::page::{
    ColumnPage, HistogramPage, PageCodec, PageFileReader, PageWriter, RowPage, SortedColumnPage,
};

/// The external iterator together with its staging buffer. The orchestrator
/// and the primary row-page source share one of these; the proxy always
/// holds the batch most recently delivered by `iter`.
pub(crate) struct IterState {
    pub iter: Box<dyn RawBatchIterator>,
    pub proxy: BatchProxy,
}

pub(crate) type SharedIter = Arc<Mutex<IterState>>;

/// A restartable generator of pages of one concrete format.
pub trait PageSource: Send {
    type Page;

    /// Rewind to the first page. Valid at any time; a reset during a
    /// generation pass discards pending cache writes cleanly.
    fn reset(&mut self);

    /// Produce the next page, or `None` at end-of-sequence. May block on
    /// disk I/O or on the external iterator's callback.
    fn advance(&mut self) -> Option<Arc<Self::Page>>;
}

// ============================================================================
// Primary row-page source
// ============================================================================

/// Source of truth for all other formats: materializes row pages from the
/// external iterator on the first pass (caching them to disk), replays from
/// disk afterwards. Row encoding is parallelized across the dataset's
/// worker pool; pages remain strictly ordered.
pub struct RowPageSource {
    /// Dropped after the first successful full pass, after which the
    /// caller may release its own iterator resources too.
    iter: Option<SharedIter>,
    missing: f32,
    pool: Arc<ThreadPool>,
    cache: Arc<CacheEntry>,
    writer: Option<PageWriter<RowPage>>,
    reader: Option<PageFileReader<RowPage>>,
    next_base_rowid: u64,
    n_pages: Option<u32>,
    finished: bool,
}

impl RowPageSource {
    pub(crate) fn new(
        iter: SharedIter,
        missing: f32,
        pool: Arc<ThreadPool>,
        cache: Arc<CacheEntry>,
    ) -> Self {
        let mut source = Self {
            iter: Some(iter),
            missing,
            pool,
            cache,
            writer: None,
            reader: None,
            next_base_rowid: 0,
            n_pages: None,
            finished: false,
        };
        source.reset();
        source
    }

    /// Page count of the completed pass, once one has completed.
    pub fn n_pages(&self) -> Option<u32> {
        self.n_pages
    }

    fn open_reader(&mut self) -> &mut PageFileReader<RowPage> {
        if self.reader.is_none() {
            let reader = PageFileReader::open(self.cache.path()).unwrap_or_else(|e| {
                panic!(
                    "failed to open row page cache {}: {e}",
                    self.cache.path().display(),
                )
            });
            self.reader = Some(reader);
        }
        self.reader.as_mut().unwrap()
    }
}

impl PageSource for RowPageSource {
    type Page = RowPage;

    fn reset(&mut self) {
        self.finished = false;
        self.next_base_rowid = 0;
        if self.cache.is_written() {
            if let Some(reader) = &mut self.reader {
                reader.rewind();
            }
            return;
        }
        // Restart the generation pass: rewind the external iterator and
        // truncate whatever a previous partial pass left behind.
        let shared = self
            .iter
            .as_ref()
            .expect("row page cache is not written but the external iterator was released");
        shared.lock().unwrap().iter.reset();
        let writer = PageWriter::create(self.cache.path()).unwrap_or_else(|e| {
            panic!(
                "failed to create row page cache {}: {e}",
                self.cache.path().display(),
            )
        });
        self.writer = Some(writer);
    }

    fn advance(&mut self) -> Option<Arc<RowPage>> {
        if self.finished {
            return None;
        }
        if self.cache.is_written() {
            match self.open_reader().next_page() {
                Some(page) => {
                    self.next_base_rowid += page.num_rows();
                    return Some(Arc::new(page));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }

        let shared = Arc::clone(
            self.iter
                .as_ref()
                .expect("row page generation requires the external iterator"),
        );
        let mut guard = shared.lock().unwrap();
        let state = &mut *guard;
        if state.iter.next(&mut state.proxy) {
            let page =
                RowPage::from_proxy(&state.proxy, self.missing, self.next_base_rowid, &self.pool);
            drop(guard);
            let writer = self
                .writer
                .as_mut()
                .expect("row page writer missing during generation pass");
            writer.append(&page).unwrap_or_else(|e| {
                panic!(
                    "failed to append row page to {}: {e}",
                    self.cache.path().display(),
                )
            });
            self.next_base_rowid += page.num_rows();
            Some(Arc::new(page))
        } else {
            drop(guard);
            let writer = self
                .writer
                .take()
                .expect("row page writer missing at end of generation pass");
            let pages = writer.finalize().unwrap_or_else(|e| {
                panic!(
                    "failed to finalize row page cache {}: {e}",
                    self.cache.path().display(),
                )
            });
            self.n_pages = Some(pages);
            self.cache.mark_written();
            // The iterator and its staging buffer are no longer needed;
            // dropping our handle lets the caller release them.
            self.iter = None;
            self.finished = true;
            info!(
                pages,
                path = %self.cache.path().display(),
                "row page cache complete",
            );
            None
        }
    }
}

// ============================================================================
// Derived sources
// ============================================================================

/// Conversion of one row page into a derived page format. Implementations
/// carry whatever dataset-wide context the format needs (column count, bin
/// cuts, ...); the conversion must be independent of page order.
pub trait PageTransform: Send {
    type Out: PageCodec;

    fn transform(&self, page: &RowPage) -> Self::Out;
}

/// Transpose into compressed sparse-column layout.
pub struct ColumnTransform {
    pub(crate) num_cols: u64,
}

impl PageTransform for ColumnTransform {
    type Out = ColumnPage;

    fn transform(&self, page: &RowPage) -> ColumnPage {
        ColumnPage::from_row_page(page, self.num_cols)
    }
}

/// Transpose, then order each column's entries by value.
pub struct SortedColumnTransform {
    pub(crate) num_cols: u64,
    pub(crate) pool: Arc<ThreadPool>,
}

impl PageTransform for SortedColumnTransform {
    type Out = SortedColumnPage;

    fn transform(&self, page: &RowPage) -> SortedColumnPage {
        SortedColumnPage::from_row_page(page, self.num_cols, &self.pool)
    }
}

/// Quantize stored values into global bin indices under fixed cuts.
pub struct HistogramTransform {
    cuts: Arc<BinCuts>,
    feature_types: Vec<FeatureType>,
    dense: bool,
    pool: Arc<ThreadPool>,
}

impl HistogramTransform {
    /// # Panics
    /// Panics if `cuts` is empty (a dataset that cannot be quantized is
    /// unusable) or if feature type tags disagree with the cut count.
    pub(crate) fn new(
        cuts: Arc<BinCuts>,
        feature_types: Vec<FeatureType>,
        dense: bool,
        pool: Arc<ThreadPool>,
    ) -> Self {
        assert!(
            !cuts.is_empty(),
            "histogram transform requires non-empty bin cuts",
        );
        if !feature_types.is_empty() {
            assert_eq!(
                feature_types.len() as u64,
                cuts.num_features(),
                "feature type tags cover {} features but cuts cover {}",
                feature_types.len(),
                cuts.num_features(),
            );
        }
        Self {
            cuts,
            feature_types,
            dense,
            pool,
        }
    }

    pub fn cuts(&self) -> &BinCuts {
        &self.cuts
    }

    pub fn feature_types(&self) -> &[FeatureType] {
        &self.feature_types
    }
}

impl PageTransform for HistogramTransform {
    type Out = HistogramPage;

    fn transform(&self, page: &RowPage) -> HistogramPage {
        HistogramPage::from_row_page(page, &self.cuts, self.dense, &self.pool)
    }
}

/// A page source derived from the shared row-page source.
///
/// On a cache miss it replays the upstream from its start, converts each row
/// page, and persists the result; on a cache hit it reads directly from disk
/// and never touches the upstream.
pub struct DerivedSource<T: PageTransform> {
    upstream: Arc<Mutex<RowPageSource>>,
    transform: T,
    cache: Arc<CacheEntry>,
    writer: Option<PageWriter<T::Out>>,
    reader: Option<PageFileReader<T::Out>>,
    finished: bool,
}

impl<T: PageTransform> DerivedSource<T> {
    pub(crate) fn new(
        upstream: Arc<Mutex<RowPageSource>>,
        transform: T,
        cache: Arc<CacheEntry>,
    ) -> Self {
        let mut source = Self {
            upstream,
            transform,
            cache,
            writer: None,
            reader: None,
            finished: false,
        };
        source.reset();
        source
    }

    /// The transform's dataset-wide context (cuts, tags, ...).
    pub fn transform(&self) -> &T {
        &self.transform
    }

    fn open_reader(&mut self) -> &mut PageFileReader<T::Out> {
        if self.reader.is_none() {
            let reader = PageFileReader::open(self.cache.path()).unwrap_or_else(|e| {
                panic!(
                    "failed to open {} page cache {}: {e}",
                    T::Out::FORMAT,
                    self.cache.path().display(),
                )
            });
            self.reader = Some(reader);
        }
        self.reader.as_mut().unwrap()
    }
}

impl<T: PageTransform> PageSource for DerivedSource<T> {
    type Page = T::Out;

    fn reset(&mut self) {
        self.finished = false;
        if self.cache.is_written() {
            if let Some(reader) = &mut self.reader {
                reader.rewind();
            }
            return;
        }
        // Regenerate from the upstream: it may have been left at any
        // position by another consumer, so rewind it explicitly.
        self.upstream.lock().unwrap().reset();
        let writer = PageWriter::create(self.cache.path()).unwrap_or_else(|e| {
            panic!(
                "failed to create {} page cache {}: {e}",
                T::Out::FORMAT,
                self.cache.path().display(),
            )
        });
        self.writer = Some(writer);
    }

    fn advance(&mut self) -> Option<Arc<T::Out>> {
        if self.finished {
            return None;
        }
        if self.cache.is_written() {
            match self.open_reader().next_page() {
                Some(page) => return Some(Arc::new(page)),
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }

        let upstream_page = self.upstream.lock().unwrap().advance();
        match upstream_page {
            Some(row_page) => {
                let page = self.transform.transform(&row_page);
                let writer = self
                    .writer
                    .as_mut()
                    .unwrap_or_else(|| panic!("{} page writer missing", T::Out::FORMAT));
                writer.append(&page).unwrap_or_else(|e| {
                    panic!(
                        "failed to append {} page to {}: {e}",
                        T::Out::FORMAT,
                        self.cache.path().display(),
                    )
                });
                Some(Arc::new(page))
            }
            None => {
                let writer = self
                    .writer
                    .take()
                    .unwrap_or_else(|| panic!("{} page writer missing", T::Out::FORMAT));
                let pages = writer.finalize().unwrap_or_else(|e| {
                    panic!(
                        "failed to finalize {} page cache {}: {e}",
                        T::Out::FORMAT,
                        self.cache.path().display(),
                    )
                });
                self.cache.mark_written();
                self.finished = true;
                info!(
                    pages,
                    format = T::Out::FORMAT,
                    path = %self.cache.path().display(),
                    "derived page cache complete",
                );
                None
            }
        }
    }
}

/// Column-major derived source.
pub type ColumnPageSource = DerivedSource<ColumnTransform>;
/// Value-ordered column-major derived source.
pub type SortedColumnPageSource = DerivedSource<SortedColumnTransform>;
/// Quantized histogram-index derived source.
pub type HistogramPageSource = DerivedSource<HistogramTransform>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RawBatch;
    use crate::cache::{CacheRegistry, MatrixId, COLUMN_PAGE_SUFFIX, ROW_PAGE_SUFFIX};

    struct DenseChunks {
        chunks: Vec<Vec<f32>>,
        num_cols: u64,
        cursor: usize,
    }

    impl RawBatchIterator for DenseChunks {
        fn reset(&mut self) {
            self.cursor = 0;
        }

        fn next(&mut self, staging: &mut BatchProxy) -> bool {
            if self.cursor >= self.chunks.len() {
                return false;
            }
            let values = self.chunks[self.cursor].clone();
            let num_rows = values.len() as u64 / self.num_cols;
            staging.stage(RawBatch::Dense {
                values,
                num_rows,
                num_cols: self.num_cols,
            });
            self.cursor += 1;
            true
        }
    }

    fn shared_iter(chunks: Vec<Vec<f32>>, num_cols: u64) -> SharedIter {
        Arc::new(Mutex::new(IterState {
            iter: Box::new(DenseChunks {
                chunks,
                num_cols,
                cursor: 0,
            }),
            proxy: BatchProxy::default(),
        }))
    }

    fn pool() -> Arc<ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    #[test]
    fn generation_pass_then_disk_replay() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cache");
        let mut registry = CacheRegistry::new();
        let id = MatrixId::next();
        let cache = registry.get_or_create(id, ROW_PAGE_SUFFIX, &prefix);

        let iter = shared_iter(vec![vec![1.0, 0.0, 0.0, 2.0], vec![3.0, 4.0]], 2);
        let mut source = RowPageSource::new(iter.clone(), 0.0, pool(), cache.clone());

        let first: Vec<Arc<RowPage>> = std::iter::from_fn(|| source.advance()).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].base_rowid(), 0);
        assert_eq!(first[1].base_rowid(), 2);
        assert!(cache.is_written());
        assert_eq!(source.n_pages(), Some(2));

        // Second pass replays from disk and must match the first.
        source.reset();
        let second: Vec<Arc<RowPage>> = std::iter::from_fn(|| source.advance()).collect();
        assert_eq!(second.len(), 2);
        assert_eq!(*second[0], *first[0]);
        assert_eq!(*second[1], *first[1]);
    }

    #[test]
    fn reset_mid_generation_restarts_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cache");
        let mut registry = CacheRegistry::new();
        let id = MatrixId::next();
        let cache = registry.get_or_create(id, ROW_PAGE_SUFFIX, &prefix);

        let iter = shared_iter(vec![vec![1.0, 2.0], vec![3.0, 4.0]], 2);
        let mut source = RowPageSource::new(iter, 0.0, pool(), cache.clone());

        let partial = source.advance().unwrap();
        assert_eq!(partial.base_rowid(), 0);
        source.reset();
        assert!(!cache.is_written());

        let pages: Vec<Arc<RowPage>> = std::iter::from_fn(|| source.advance()).collect();
        assert_eq!(pages.len(), 2);
        assert!(cache.is_written());
    }

    #[test]
    fn derived_source_generates_then_replays_without_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cache");
        let mut registry = CacheRegistry::new();
        let id = MatrixId::next();
        let row_cache = registry.get_or_create(id, ROW_PAGE_SUFFIX, &prefix);
        let col_cache = registry.get_or_create(id, COLUMN_PAGE_SUFFIX, &prefix);

        let iter = shared_iter(vec![vec![1.0, 0.0, 0.0, 2.0], vec![3.0, 4.0]], 2);
        let upstream = Arc::new(Mutex::new(RowPageSource::new(
            iter,
            0.0,
            pool(),
            row_cache,
        )));
        let mut derived = ColumnPageSource::new(
            Arc::clone(&upstream),
            ColumnTransform { num_cols: 2 },
            col_cache.clone(),
        );

        let first: Vec<Arc<ColumnPage>> = std::iter::from_fn(|| derived.advance()).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].column_values(0), &[1.0]);
        assert_eq!(first[1].column_values(1), &[4.0]);
        assert!(col_cache.is_written());

        // Park the upstream at a bogus position; a cache-hit replay must
        // not care.
        upstream.lock().unwrap().reset();
        let _ = upstream.lock().unwrap().advance();

        derived.reset();
        let second: Vec<Arc<ColumnPage>> = std::iter::from_fn(|| derived.advance()).collect();
        assert_eq!(second.len(), 2);
        assert_eq!(*second[0], *first[0]);
    }
}
