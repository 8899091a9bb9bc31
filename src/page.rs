//! Page data structures and the on-disk page-file codec.
//!
//! A page is a contiguous batch of dataset rows in one of four layouts:
//! row-major sparse ([`RowPage`]), column-major sparse ([`ColumnPage`]),
//! column-major with value-ordered columns ([`SortedColumnPage`]), and
//! quantized bin indices ([`HistogramPage`]). Row pages are produced from
//! the external iterator; the other three are derived from row pages and
//! never written by the iterator directly.
//!
//! ## File layout
//!
//! Each page format is cached in its own append-only file:
//!
//! ```text
//! File header (8 bytes):
//!   magic    : u32  — 0x534C5047 ("SLPG")
//!   version  : u32  — 1
//! Then one record per page:
//!   Page header (32 bytes):
//!     [0] n_primary  (u64) — rows (row/histogram pages) or columns (column pages)
//!     [1] nnz        (u64) — stored entries in this page
//!     [2] base_rowid (u64) — global row id of the page's first row
//!     [3] aux        (u64) — format-specific (see each format's docs)
//!   Sections (packed sequentially, each 8-byte aligned):
//!     offsets / col_ptrs : [u64; n_primary + 1]
//!     indices / bins     : [u32; nnz]           (padded to 8B)
//!     values             : [f32; nnz]           (padded to 8B, absent for histogram pages)
//! ```
//!
//! All values are native byte order. Readers memory-map the file and walk
//! records with fatal size validation; the cache registry guarantees a file
//! is only read after a full write pass completed.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::adapter::{BatchProxy, RawBatch};
use crate::cuts::BinCuts;

const PAGE_FILE_MAGIC: u32 = 0x534C_5047;
const PAGE_FILE_VERSION: u32 = 1;

/// Byte length of the per-file header.
pub const PAGE_FILE_HEADER_BYTES: usize = 8;

/// Alignment guarantee for all sections within page files.
const PAGE_ALIGNMENT: usize = 8;

/// Round `offset` up to the next multiple of `alignment` (a power of two).
#[inline]
const fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

// ============================================================================
// Row page (CSR)
// ============================================================================

/// A contiguous batch of rows in compressed sparse-row layout.
///
/// Immutable once written. `aux` in the page header stores `num_cols` as
/// observed from the staging proxy at build time.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPage {
    base_rowid: u64,
    num_cols: u64,
    /// `offsets[r]..offsets[r+1]` indexes `indices`/`values` for row `r`.
    offsets: Vec<u64>,
    indices: Vec<u32>,
    values: Vec<f32>,
}

impl RowPage {
    pub fn num_rows(&self) -> u64 {
        self.offsets.len() as u64 - 1
    }

    pub fn nnz(&self) -> u64 {
        self.indices.len() as u64
    }

    pub fn base_rowid(&self) -> u64 {
        self.base_rowid
    }

    /// Column count of the raw batch this page was built from.
    pub fn num_cols(&self) -> u64 {
        self.num_cols
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Column indices of row `r`'s stored entries.
    pub fn row_indices(&self, r: u64) -> &[u32] {
        let start = self.offsets[r as usize] as usize;
        let end = self.offsets[r as usize + 1] as usize;
        &self.indices[start..end]
    }

    /// Values of row `r`'s stored entries, parallel to [`row_indices`](Self::row_indices).
    pub fn row_values(&self, r: u64) -> &[f32] {
        let start = self.offsets[r as usize] as usize;
        let end = self.offsets[r as usize + 1] as usize;
        &self.values[start..end]
    }

    /// Materialize one row page from the staged raw batch, dropping entries
    /// equal to the missing sentinel (NaN always counts as missing).
    ///
    /// Row encoding is parallelized across `pool`; rows keep their order.
    ///
    /// # Panics
    /// Panics on a device-resident batch: GPU page formats are handled by a
    /// separate pipeline and cannot be materialized into host row pages.
    pub fn from_proxy(
        proxy: &BatchProxy,
        missing: f32,
        base_rowid: u64,
        pool: &ThreadPool,
    ) -> Self {
        let keep = |v: f32| !v.is_nan() && v != missing;
        match proxy.batch() {
            RawBatch::Dense {
                values,
                num_rows,
                num_cols,
            } => {
                let (nr, nc) = (*num_rows as usize, *num_cols as usize);
                let rows: Vec<Vec<(u32, f32)>> = pool.install(|| {
                    (0..nr)
                        .into_par_iter()
                        .map(|r| {
                            let row = &values[r * nc..(r + 1) * nc];
                            row.iter()
                                .enumerate()
                                .filter(|(_, &v)| keep(v))
                                .map(|(c, &v)| (c as u32, v))
                                .collect()
                        })
                        .collect()
                });
                Self::assemble(rows, *num_cols, base_rowid)
            }
            RawBatch::Csr {
                offsets,
                indices,
                values,
                num_cols,
            } => {
                let nr = offsets.len() - 1;
                let rows: Vec<Vec<(u32, f32)>> = pool.install(|| {
                    (0..nr)
                        .into_par_iter()
                        .map(|r| {
                            let start = offsets[r] as usize;
                            let end = offsets[r + 1] as usize;
                            indices[start..end]
                                .iter()
                                .zip(&values[start..end])
                                .filter(|(_, &v)| keep(v))
                                .map(|(&c, &v)| (c, v))
                                .collect()
                        })
                        .collect()
                });
                Self::assemble(rows, *num_cols, base_rowid)
            }
            RawBatch::Device(d) => panic!(
                "raw batch on device {} cannot be materialized into a host row page; \
                 GPU-resident page formats are not supported",
                d.device_ordinal(),
            ),
        }
    }

    fn assemble(rows: Vec<Vec<(u32, f32)>>, num_cols: u64, base_rowid: u64) -> Self {
        let nnz: usize = rows.iter().map(Vec::len).sum();
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        offsets.push(0u64);
        for row in rows {
            for (c, v) in row {
                indices.push(c);
                values.push(v);
            }
            offsets.push(indices.len() as u64);
        }
        Self {
            base_rowid,
            num_cols,
            offsets,
            indices,
            values,
        }
    }
}

// ============================================================================
// Column page (CSC) and sorted variant
// ============================================================================

/// The same logical rows transposed into compressed sparse-column layout.
///
/// Row indices are page-local (`0..num_rows`); the global row id of entry
/// `r` is `base_rowid + r`. `aux` in the page header stores `num_rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPage {
    base_rowid: u64,
    num_rows: u64,
    /// `col_ptrs[c]..col_ptrs[c+1]` indexes `row_indices`/`values` for column `c`.
    col_ptrs: Vec<u64>,
    row_indices: Vec<u32>,
    values: Vec<f32>,
}

impl ColumnPage {
    pub fn num_cols(&self) -> u64 {
        self.col_ptrs.len() as u64 - 1
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn nnz(&self) -> u64 {
        self.row_indices.len() as u64
    }

    pub fn base_rowid(&self) -> u64 {
        self.base_rowid
    }

    /// Page-local row indices of column `c`'s stored entries.
    pub fn column_rows(&self, c: u64) -> &[u32] {
        let start = self.col_ptrs[c as usize] as usize;
        let end = self.col_ptrs[c as usize + 1] as usize;
        &self.row_indices[start..end]
    }

    /// Values of column `c`'s stored entries, parallel to [`column_rows`](Self::column_rows).
    pub fn column_values(&self, c: u64) -> &[f32] {
        let start = self.col_ptrs[c as usize] as usize;
        let end = self.col_ptrs[c as usize + 1] as usize;
        &self.values[start..end]
    }

    /// Transpose a row page into column-major layout with a counting sort:
    /// count entries per column, prefix-sum into `col_ptrs`, then scatter.
    /// O(rows + nnz), no intermediate entry list.
    ///
    /// `num_cols` is the dataset-wide column count, which may exceed the
    /// largest column index present in this page.
    ///
    /// # Panics
    /// Panics if the page contains a column index `>= num_cols`.
    pub fn from_row_page(page: &RowPage, num_cols: u64) -> Self {
        let nc = num_cols as usize;
        let nnz = page.nnz() as usize;

        let mut col_ptrs = vec![0u64; nc + 1];
        for &c in &page.indices {
            assert!(
                (c as u64) < num_cols,
                "row page contains column index {c} but the dataset has {num_cols} columns",
            );
            col_ptrs[c as usize + 1] += 1;
        }
        for c in 1..=nc {
            col_ptrs[c] += col_ptrs[c - 1];
        }

        let mut row_indices = vec![0u32; nnz];
        let mut values = vec![0f32; nnz];
        let mut cursors = col_ptrs[..nc].to_vec();
        for r in 0..page.num_rows() {
            let cols = page.row_indices(r);
            let vals = page.row_values(r);
            for (&c, &v) in cols.iter().zip(vals) {
                let pos = cursors[c as usize] as usize;
                row_indices[pos] = r as u32;
                values[pos] = v;
                cursors[c as usize] += 1;
            }
        }

        Self {
            base_rowid: page.base_rowid(),
            num_rows: page.num_rows(),
            col_ptrs,
            row_indices,
            values,
        }
    }
}

/// A [`ColumnPage`] whose columns are additionally ordered by value.
#[derive(Debug, Clone, PartialEq)]
pub struct SortedColumnPage(ColumnPage);

impl SortedColumnPage {
    /// Transpose a row page and order each column's entries by value
    /// (ascending, ties by row). Per-column sorting runs on `pool`.
    pub fn from_row_page(page: &RowPage, num_cols: u64, pool: &ThreadPool) -> Self {
        let mut cols = ColumnPage::from_row_page(page, num_cols);
        let nc = cols.num_cols() as usize;

        let sorted: Vec<Vec<(u32, f32)>> = pool.install(|| {
            (0..nc)
                .into_par_iter()
                .map(|c| {
                    let mut entries: Vec<(u32, f32)> = cols
                        .column_rows(c as u64)
                        .iter()
                        .copied()
                        .zip(cols.column_values(c as u64).iter().copied())
                        .collect();
                    entries.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                    entries
                })
                .collect()
        });

        let mut pos = 0usize;
        for col in sorted {
            for (r, v) in col {
                cols.row_indices[pos] = r;
                cols.values[pos] = v;
                pos += 1;
            }
        }
        debug_assert_eq!(pos, cols.nnz() as usize);

        Self(cols)
    }

    pub fn as_column_page(&self) -> &ColumnPage {
        &self.0
    }

    pub fn num_cols(&self) -> u64 {
        self.0.num_cols()
    }

    pub fn nnz(&self) -> u64 {
        self.0.nnz()
    }

    pub fn base_rowid(&self) -> u64 {
        self.0.base_rowid()
    }

    pub fn column_rows(&self, c: u64) -> &[u32] {
        self.0.column_rows(c)
    }

    pub fn column_values(&self, c: u64) -> &[f32] {
        self.0.column_values(c)
    }
}

// ============================================================================
// Histogram index page
// ============================================================================

/// Quantized page: each stored value replaced by its global bin index under
/// a fixed set of [`BinCuts`]. `aux` bit 0 in the page header records the
/// density flag the page was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramPage {
    base_rowid: u64,
    dense: bool,
    offsets: Vec<u64>,
    /// Global bin ids: `cuts.feature_offset(c) + local_bin`.
    bins: Vec<u32>,
}

impl HistogramPage {
    pub fn num_rows(&self) -> u64 {
        self.offsets.len() as u64 - 1
    }

    pub fn nnz(&self) -> u64 {
        self.bins.len() as u64
    }

    pub fn base_rowid(&self) -> u64 {
        self.base_rowid
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    /// Global bin indices of row `r`'s stored entries.
    pub fn row_bins(&self, r: u64) -> &[u32] {
        let start = self.offsets[r as usize] as usize;
        let end = self.offsets[r as usize + 1] as usize;
        &self.bins[start..end]
    }

    /// Quantize one row page under global cuts. Bin lookup is independent of
    /// row order across pages, so pages can be built in any sequence.
    ///
    /// When `dense` is set every row must store exactly `num_cols` entries;
    /// this is checked because dense consumers rely on the uniform stride.
    pub fn from_row_page(page: &RowPage, cuts: &BinCuts, dense: bool, pool: &ThreadPool) -> Self {
        if dense {
            let nc = page.num_cols();
            for r in 0..page.num_rows() {
                let width = page.row_indices(r).len() as u64;
                assert_eq!(
                    width, nc,
                    "dense histogram page requires {nc} entries per row, row {r} has {width}",
                );
            }
        }

        let nr = page.num_rows() as usize;
        let rows: Vec<Vec<u32>> = pool.install(|| {
            (0..nr)
                .into_par_iter()
                .map(|r| {
                    page.row_indices(r as u64)
                        .iter()
                        .zip(page.row_values(r as u64))
                        .map(|(&c, &v)| cuts.search_bin(c, v))
                        .collect()
                })
                .collect()
        });

        let mut offsets = Vec::with_capacity(nr + 1);
        let mut bins = Vec::with_capacity(page.nnz() as usize);
        offsets.push(0u64);
        for row in rows {
            bins.extend(row);
            offsets.push(bins.len() as u64);
        }

        Self {
            base_rowid: page.base_rowid(),
            dense,
            offsets,
            bins,
        }
    }

    /// Concatenate pages (in order) into one page covering the whole
    /// dataset; used by the in-memory single-page histogram regime.
    ///
    /// # Panics
    /// Panics if `pages` is empty or the pages are not contiguous in row id.
    pub fn concat(pages: &[HistogramPage]) -> Self {
        assert!(!pages.is_empty(), "cannot concatenate zero histogram pages");
        let mut offsets = vec![0u64];
        let mut bins = Vec::new();
        let mut next_rowid = pages[0].base_rowid;
        for page in pages {
            assert_eq!(
                page.base_rowid, next_rowid,
                "histogram pages are not contiguous: expected base row {next_rowid}, got {}",
                page.base_rowid,
            );
            let shift = bins.len() as u64;
            bins.extend_from_slice(&page.bins);
            offsets.extend(page.offsets[1..].iter().map(|&o| o + shift));
            next_rowid += page.num_rows();
        }
        Self {
            base_rowid: pages[0].base_rowid,
            dense: pages[0].dense,
            offsets,
            bins,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// One page format's on-disk encoding.
///
/// `encode` appends a record (header + 8-byte-aligned sections) and `decode`
/// reads the record starting at `offset`, returning the page and the offset
/// of the next record. Decoding validates sizes fatally: a malformed page
/// file means the cache is unusable.
pub trait PageCodec: Sized + Send + Sync + 'static {
    /// Short format name for logs and tooling.
    const FORMAT: &'static str;

    fn encode(&self, w: &mut BufWriter<File>, offset: &mut usize) -> io::Result<()>;
    fn decode(view: &PageFileView, offset: usize) -> (Self, usize);
}

/// Reinterpret a `&[u64]` as raw bytes.
fn u64_as_bytes(s: &[u64]) -> &[u8] {
    // SAFETY: u64 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// Reinterpret a `&[u32]` as raw bytes.
fn u32_as_bytes(s: &[u32]) -> &[u8] {
    // SAFETY: u32 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// Reinterpret a `&[f32]` as raw bytes.
fn f32_as_bytes(s: &[f32]) -> &[u8] {
    // SAFETY: f32 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// Write `data` followed by zero-padding to [`PAGE_ALIGNMENT`].
fn write_padded(w: &mut BufWriter<File>, data: &[u8], offset: &mut usize) -> io::Result<()> {
    w.write_all(data)?;
    *offset += data.len();
    let aligned = align_up(*offset, PAGE_ALIGNMENT);
    let pad = aligned - *offset;
    if pad > 0 {
        w.write_all(&[0u8; PAGE_ALIGNMENT][..pad])?;
    }
    *offset = aligned;
    Ok(())
}

fn write_page_header(
    w: &mut BufWriter<File>,
    offset: &mut usize,
    header: [u64; 4],
) -> io::Result<()> {
    write_padded(w, u64_as_bytes(&header), offset)
}

impl PageCodec for RowPage {
    const FORMAT: &'static str = "row";

    fn encode(&self, w: &mut BufWriter<File>, offset: &mut usize) -> io::Result<()> {
        write_page_header(
            w,
            offset,
            [self.num_rows(), self.nnz(), self.base_rowid, self.num_cols],
        )?;
        write_padded(w, u64_as_bytes(&self.offsets), offset)?;
        write_padded(w, u32_as_bytes(&self.indices), offset)?;
        write_padded(w, f32_as_bytes(&self.values), offset)
    }

    fn decode(view: &PageFileView, offset: usize) -> (Self, usize) {
        let (header, mut offset) = view.page_header(offset);
        let [num_rows, nnz, base_rowid, num_cols] = header;
        let offsets = view.u64_section(&mut offset, num_rows as usize + 1).to_vec();
        let indices = view.u32_section(&mut offset, nnz as usize).to_vec();
        let values = view.f32_section(&mut offset, nnz as usize).to_vec();
        (
            Self {
                base_rowid,
                num_cols,
                offsets,
                indices,
                values,
            },
            offset,
        )
    }
}

impl PageCodec for ColumnPage {
    const FORMAT: &'static str = "column";

    fn encode(&self, w: &mut BufWriter<File>, offset: &mut usize) -> io::Result<()> {
        write_page_header(
            w,
            offset,
            [self.num_cols(), self.nnz(), self.base_rowid, self.num_rows],
        )?;
        write_padded(w, u64_as_bytes(&self.col_ptrs), offset)?;
        write_padded(w, u32_as_bytes(&self.row_indices), offset)?;
        write_padded(w, f32_as_bytes(&self.values), offset)
    }

    fn decode(view: &PageFileView, offset: usize) -> (Self, usize) {
        let (header, mut offset) = view.page_header(offset);
        let [num_cols, nnz, base_rowid, num_rows] = header;
        let col_ptrs = view.u64_section(&mut offset, num_cols as usize + 1).to_vec();
        let row_indices = view.u32_section(&mut offset, nnz as usize).to_vec();
        let values = view.f32_section(&mut offset, nnz as usize).to_vec();
        (
            Self {
                base_rowid,
                num_rows,
                col_ptrs,
                row_indices,
                values,
            },
            offset,
        )
    }
}

impl PageCodec for SortedColumnPage {
    const FORMAT: &'static str = "sorted-column";

    fn encode(&self, w: &mut BufWriter<File>, offset: &mut usize) -> io::Result<()> {
        self.0.encode(w, offset)
    }

    fn decode(view: &PageFileView, offset: usize) -> (Self, usize) {
        let (page, next) = ColumnPage::decode(view, offset);
        (Self(page), next)
    }
}

impl PageCodec for HistogramPage {
    const FORMAT: &'static str = "histogram";

    fn encode(&self, w: &mut BufWriter<File>, offset: &mut usize) -> io::Result<()> {
        write_page_header(
            w,
            offset,
            [
                self.num_rows(),
                self.nnz(),
                self.base_rowid,
                u64::from(self.dense),
            ],
        )?;
        write_padded(w, u64_as_bytes(&self.offsets), offset)?;
        write_padded(w, u32_as_bytes(&self.bins), offset)
    }

    fn decode(view: &PageFileView, offset: usize) -> (Self, usize) {
        let (header, mut offset) = view.page_header(offset);
        let [num_rows, nnz, base_rowid, flags] = header;
        let offsets = view.u64_section(&mut offset, num_rows as usize + 1).to_vec();
        let bins = view.u32_section(&mut offset, nnz as usize).to_vec();
        (
            Self {
                base_rowid,
                dense: flags & 1 != 0,
                offsets,
                bins,
            },
            offset,
        )
    }
}

// ============================================================================
// Page file writer / reader
// ============================================================================

/// Append-only writer for one page-format cache file.
///
/// Created at the start of a generation pass (truncating any partial file
/// from an interrupted pass) and finalized once the pass completes. The
/// owning page source flips the cache entry's "written" flag only after
/// [`finalize`](Self::finalize) returns.
pub struct PageWriter<P: PageCodec> {
    w: BufWriter<File>,
    path: PathBuf,
    offset: usize,
    pages: u32,
    _format: PhantomData<P>,
}

impl<P: PageCodec> PageWriter<P> {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&PAGE_FILE_MAGIC.to_ne_bytes())?;
        w.write_all(&PAGE_FILE_VERSION.to_ne_bytes())?;
        Ok(Self {
            w,
            path: path.to_path_buf(),
            offset: PAGE_FILE_HEADER_BYTES,
            pages: 0,
            _format: PhantomData,
        })
    }

    pub fn append(&mut self, page: &P) -> io::Result<()> {
        page.encode(&mut self.w, &mut self.offset)?;
        self.pages += 1;
        Ok(())
    }

    pub fn pages_written(&self) -> u32 {
        self.pages
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file; returns the number of pages written.
    pub fn finalize(mut self) -> io::Result<u32> {
        self.w.flush()?;
        Ok(self.pages)
    }
}

/// Memory-mapped view of a fully written page file.
///
/// Sections are 8-byte aligned by construction, so the typed accessors can
/// hand out zero-copy slices directly into the mapped pages.
pub struct PageFileView {
    mmap: Mmap,
}

impl PageFileView {
    /// Map a page file and validate its header.
    ///
    /// # Panics
    /// Panics if the file is too small for the header or the magic/version
    /// do not match: a corrupt cache file is fatal.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the cache file is fully written and never modified while
        // mapped; the registry only routes readers here after the owning
        // source finished its write pass.
        let mmap = unsafe { Mmap::map(&file)? };
        assert!(
            mmap.len() >= PAGE_FILE_HEADER_BYTES,
            "page file {} too small for header ({} bytes)",
            path.display(),
            mmap.len(),
        );
        let magic = u32::from_ne_bytes(mmap[0..4].try_into().unwrap());
        let version = u32::from_ne_bytes(mmap[4..8].try_into().unwrap());
        assert_eq!(
            magic,
            PAGE_FILE_MAGIC,
            "page file {} has bad magic {magic:#010x}",
            path.display(),
        );
        assert_eq!(
            version,
            PAGE_FILE_VERSION,
            "page file {} has unsupported version {version}",
            path.display(),
        );
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() <= PAGE_FILE_HEADER_BYTES
    }

    fn page_header(&self, offset: usize) -> ([u64; 4], usize) {
        let mut offset = offset;
        let header = self.u64_section(&mut offset, 4);
        ([header[0], header[1], header[2], header[3]], offset)
    }

    fn u64_section(&self, offset: &mut usize, len: usize) -> &[u64] {
        let bytes = len * std::mem::size_of::<u64>();
        self.check_section(*offset, bytes);
        // SAFETY: bounds checked above; sections are written 8-byte aligned,
        // and the mmap base is page-aligned, so the pointer is aligned for u64.
        let s = unsafe {
            std::slice::from_raw_parts(self.mmap.as_ptr().add(*offset) as *const u64, len)
        };
        *offset = align_up(*offset + bytes, PAGE_ALIGNMENT);
        s
    }

    fn u32_section(&self, offset: &mut usize, len: usize) -> &[u32] {
        let bytes = len * std::mem::size_of::<u32>();
        self.check_section(*offset, bytes);
        // SAFETY: bounds checked above; 8-byte section alignment satisfies u32.
        let s = unsafe {
            std::slice::from_raw_parts(self.mmap.as_ptr().add(*offset) as *const u32, len)
        };
        *offset = align_up(*offset + bytes, PAGE_ALIGNMENT);
        s
    }

    fn f32_section(&self, offset: &mut usize, len: usize) -> &[f32] {
        let bytes = len * std::mem::size_of::<f32>();
        self.check_section(*offset, bytes);
        // SAFETY: bounds checked above; 8-byte section alignment satisfies f32.
        let s = unsafe {
            std::slice::from_raw_parts(self.mmap.as_ptr().add(*offset) as *const f32, len)
        };
        *offset = align_up(*offset + bytes, PAGE_ALIGNMENT);
        s
    }

    fn check_section(&self, offset: usize, bytes: usize) {
        assert!(
            offset % PAGE_ALIGNMENT == 0,
            "page file section at misaligned offset {offset}",
        );
        assert!(
            offset + bytes <= self.mmap.len(),
            "page file truncated: section at {offset} needs {bytes} bytes, file is {}",
            self.mmap.len(),
        );
    }
}

/// Sequential reader over a fully written page file.
pub struct PageFileReader<P: PageCodec> {
    view: PageFileView,
    offset: usize,
    _format: PhantomData<P>,
}

impl<P: PageCodec> PageFileReader<P> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            view: PageFileView::open(path)?,
            offset: PAGE_FILE_HEADER_BYTES,
            _format: PhantomData,
        })
    }

    /// Decode the next page, or `None` past the last record.
    pub fn next_page(&mut self) -> Option<P> {
        if self.offset >= self.view.len() {
            return None;
        }
        let (page, next) = P::decode(&self.view, self.offset);
        self.offset = next;
        Some(page)
    }

    pub fn rewind(&mut self) {
        self.offset = PAGE_FILE_HEADER_BYTES;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::BatchProxy;
    use crate::adapter::RawBatch;

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn page_from_dense(values: Vec<f32>, rows: u64, cols: u64, missing: f32) -> RowPage {
        let mut proxy = BatchProxy::default();
        proxy.stage(RawBatch::Dense {
            values,
            num_rows: rows,
            num_cols: cols,
        });
        RowPage::from_proxy(&proxy, missing, 0, &pool())
    }

    #[test]
    fn dense_batch_drops_missing_and_nan() {
        let page = page_from_dense(
            vec![
                1.0, 0.0, 2.0, //
                f32::NAN, 3.0, 0.0,
            ],
            2,
            3,
            0.0,
        );
        assert_eq!(page.num_rows(), 2);
        assert_eq!(page.num_cols(), 3);
        assert_eq!(page.nnz(), 3);
        assert_eq!(page.row_indices(0), &[0, 2]);
        assert_eq!(page.row_values(0), &[1.0, 2.0]);
        assert_eq!(page.row_indices(1), &[1]);
        assert_eq!(page.row_values(1), &[3.0]);
    }

    #[test]
    fn csr_batch_preserves_explicit_entries() {
        let mut proxy = BatchProxy::default();
        proxy.stage(RawBatch::Csr {
            offsets: vec![0, 2, 2, 3],
            indices: vec![1, 4, 0],
            values: vec![5.0, -1.0, 2.5],
            num_cols: 6,
        });
        let page = RowPage::from_proxy(&proxy, f32::NAN, 100, &pool());
        assert_eq!(page.base_rowid(), 100);
        assert_eq!(page.num_rows(), 3);
        assert_eq!(page.row_indices(0), &[1, 4]);
        assert!(page.row_indices(1).is_empty());
        assert_eq!(page.row_values(2), &[2.5]);
    }

    #[test]
    fn transpose_round_trips_entries() {
        let page = page_from_dense(
            vec![
                1.0, 0.0, 2.0, //
                0.0, 3.0, 0.0, //
                4.0, 0.0, 5.0,
            ],
            3,
            3,
            0.0,
        );
        let cols = ColumnPage::from_row_page(&page, 3);
        assert_eq!(cols.num_cols(), 3);
        assert_eq!(cols.nnz(), 5);
        assert_eq!(cols.column_rows(0), &[0, 2]);
        assert_eq!(cols.column_values(0), &[1.0, 4.0]);
        assert_eq!(cols.column_rows(1), &[1]);
        assert_eq!(cols.column_rows(2), &[0, 2]);
        assert_eq!(cols.column_values(2), &[2.0, 5.0]);
    }

    #[test]
    fn sorted_columns_are_value_ordered() {
        let page = page_from_dense(
            vec![
                9.0, 1.0, //
                3.0, 2.0, //
                6.0, 3.0,
            ],
            3,
            2,
            0.0,
        );
        let sorted = SortedColumnPage::from_row_page(&page, 2, &pool());
        // Column 0 held [9, 3, 6] at rows [0, 1, 2]; sorted by value.
        assert_eq!(sorted.column_values(0), &[3.0, 6.0, 9.0]);
        assert_eq!(sorted.column_rows(0), &[1, 2, 0]);
        // Column 1 was already ordered.
        assert_eq!(sorted.column_values(1), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn writer_reader_replays_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.row.page");

        let a = page_from_dense(vec![1.0, 0.0, 0.0, 2.0], 2, 2, 0.0);
        let b = page_from_dense(vec![0.0, 3.0], 1, 2, 0.0);

        let mut w: PageWriter<RowPage> = PageWriter::create(&path).unwrap();
        w.append(&a).unwrap();
        w.append(&b).unwrap();
        assert_eq!(w.finalize().unwrap(), 2);

        let mut r: PageFileReader<RowPage> = PageFileReader::open(&path).unwrap();
        assert_eq!(r.next_page().unwrap(), a);
        assert_eq!(r.next_page().unwrap(), b);
        assert!(r.next_page().is_none());

        r.rewind();
        assert_eq!(r.next_page().unwrap(), a);
    }

    #[test]
    #[should_panic(expected = "bad magic")]
    fn garbage_page_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.row.page");
        std::fs::write(&path, b"not a page file").unwrap();
        let _ = PageFileView::open(&path);
    }

    #[test]
    fn histogram_concat_restitches_offsets() {
        let p = pool();
        let cuts = BinCuts::from_feature_cuts(&[vec![1.0, 2.0], vec![1.0, 2.0]]);
        let a = HistogramPage::from_row_page(
            &page_from_dense(vec![0.5, 1.5, 2.5, 0.5], 2, 2, 0.0),
            &cuts,
            true,
            &p,
        );
        let b = {
            let mut proxy = BatchProxy::default();
            proxy.stage(RawBatch::Dense {
                values: vec![1.5, 1.5],
                num_rows: 1,
                num_cols: 2,
            });
            let page = RowPage::from_proxy(&proxy, 0.0, 2, &p);
            HistogramPage::from_row_page(&page, &cuts, true, &p)
        };
        let merged = HistogramPage::concat(&[a.clone(), b]);
        assert_eq!(merged.num_rows(), 3);
        assert_eq!(merged.nnz(), 6);
        assert_eq!(merged.row_bins(0), a.row_bins(0));
        assert_eq!(merged.row_bins(2).len(), 2);
    }
}
