//! Page transformation throughput benchmarks.
//!
//! Benchmarks the three hot conversions in the paging pipeline on synthetic
//! sparse batches:
//! - **encode_sweep**: raw dense batch to row page, across batch sizes.
//!   Reveals how row encoding scales with the configured thread count.
//! - **derive**: row page to column, sorted column, and histogram pages
//!   at a fixed shape. The per-page cost each derived source pays.
//!
//! # Running
//!
//! ```sh
//! cargo bench --bench page_throughput
//! ```

use criterion::{BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sluice::adapter::{BatchProxy, RawBatch};
use sluice::cuts::BinCuts;
use sluice::page::{ColumnPage, HistogramPage, RowPage, SortedColumnPage};

// ============================================================================
// Test data generators
// ============================================================================

/// Row-major dense values with roughly `density` of cells populated; the
/// rest are NaN (the default missing sentinel).
fn generate_dense_batch(num_rows: usize, num_cols: usize, density: f64, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..num_rows * num_cols)
        .map(|_| {
            if rng.gen_bool(density) {
                rng.gen_range(-100.0f32..100.0)
            } else {
                f32::NAN
            }
        })
        .collect()
}

fn stage(values: Vec<f32>, num_rows: usize, num_cols: usize) -> BatchProxy {
    let mut proxy = BatchProxy::default();
    proxy.stage(RawBatch::Dense {
        values,
        num_rows: num_rows as u64,
        num_cols: num_cols as u64,
    });
    proxy
}

fn uniform_cuts(num_cols: usize, bins: usize) -> BinCuts {
    let feature: Vec<f32> = (1..=bins).map(|b| b as f32 * 200.0 / bins as f32 - 100.0).collect();
    BinCuts::from_feature_cuts(&vec![feature; num_cols])
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_encode_sweep(c: &mut Criterion) {
    let pool = rayon::ThreadPoolBuilder::new().build().unwrap();
    let num_cols = 64;

    let mut group = c.benchmark_group("encode_sweep");
    group.sample_size(20);
    group.noise_threshold(0.05);

    for num_rows in [1_024usize, 8_192, 65_536] {
        let proxy = stage(
            generate_dense_batch(num_rows, num_cols, 0.25, 42),
            num_rows,
            num_cols,
        );
        group.throughput(Throughput::Elements((num_rows * num_cols) as u64));
        group.bench_with_input(BenchmarkId::new("row_page", num_rows), &proxy, |b, proxy| {
            b.iter(|| RowPage::from_proxy(proxy, f32::NAN, 0, &pool));
        });
    }
    group.finish();
}

fn bench_derive(c: &mut Criterion) {
    let pool = rayon::ThreadPoolBuilder::new().build().unwrap();
    let (num_rows, num_cols) = (16_384usize, 64usize);
    let proxy = stage(
        generate_dense_batch(num_rows, num_cols, 0.25, 7),
        num_rows,
        num_cols,
    );
    let page = RowPage::from_proxy(&proxy, f32::NAN, 0, &pool);
    let cuts = uniform_cuts(num_cols, 256);

    let mut group = c.benchmark_group("derive");
    group.sample_size(20);
    group.noise_threshold(0.05);
    group.throughput(Throughput::Elements(page.nnz()));

    group.bench_function("column_page", |b| {
        b.iter(|| ColumnPage::from_row_page(&page, num_cols as u64));
    });
    group.bench_function("sorted_column_page", |b| {
        b.iter(|| SortedColumnPage::from_row_page(&page, num_cols as u64, &pool));
    });
    group.bench_function("histogram_page", |b| {
        b.iter(|| HistogramPage::from_row_page(&page, &cuts, false, &pool));
    });
    group.finish();
}

// ============================================================================
// Criterion main
// ============================================================================

fn main() {
    let mut criterion = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(2))
        .measurement_time(std::time::Duration::from_secs(8))
        .configure_from_args();

    bench_encode_sweep(&mut criterion);
    bench_derive(&mut criterion);

    criterion.final_summary();
}
