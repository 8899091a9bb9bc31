//! External-memory dataset paging for gradient-boosted training.
//!
//! A training engine points `sluice` at a caller-supplied batch iterator;
//! one metadata-gathering pass materializes the dataset as on-disk row
//! pages, and the training loop then pulls restartable lazy sequences of
//! row, column, sorted-column, or quantized-histogram pages. Re-iteration
//! is idempotent: each format is written to disk once and replayed from its
//! cache afterwards, and the external iterator can be released as soon as
//! the first pass completes.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod adapter;
pub mod batch;
pub mod cache;
pub mod cuts;
pub mod dataset;
pub mod dist;
pub mod error;
pub mod meta;
pub mod page;
pub mod source;

pub use adapter::{BatchProxy, DeviceBatch, RawBatch, RawBatchIterator};
pub use batch::Batches;
pub use cache::{CacheEntry, CacheRegistry, MatrixId};
pub use cuts::BinCuts;
pub use dataset::{BatchParam, DatasetConfig, PagedDataset};
pub use dist::{Communicator, SingleWorker};
pub use error::DataError;
pub use meta::{DatasetMeta, FeatureType};
pub use page::{ColumnPage, HistogramPage, RowPage, SortedColumnPage};
