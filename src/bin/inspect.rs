//! Inspect an on-disk page cache: dump dataset shape, cache state, and
//! per-page statistics in a human-readable format.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --cache-prefix /data/cache/dataset
//! cargo run --release --bin inspect -- --cache-prefix /data/cache/dataset --max-pages 10
//! ```

use std::path::PathBuf;

use clap::Parser;

use sluice::cache::{
    COLUMN_PAGE_SUFFIX, HISTOGRAM_PAGE_SUFFIX, META_SUFFIX, ROW_PAGE_SUFFIX,
    SORTED_COLUMN_PAGE_SUFFIX,
};
use sluice::meta::DatasetMeta;
use sluice::page::{ColumnPage, HistogramPage, PageFileReader, RowPage, SortedColumnPage};

#[derive(Parser, Debug)]
#[command(about = "Inspect an on-disk page cache")]
struct Args {
    /// Cache path prefix the dataset was built with (per-rank marker
    /// included, if distributed).
    #[arg(long)]
    cache_prefix: PathBuf,

    /// Maximum number of pages to list per format (0 to list all).
    #[arg(long, default_value_t = 20)]
    max_pages: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let dir = args
        .cache_prefix
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = args
        .cache_prefix
        .file_name()
        .ok_or("cache prefix has no file name component")?
        .to_string_lossy()
        .into_owned();

    let mut cache_files: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&stem))
                .unwrap_or(false)
        })
        .collect();
    cache_files.sort();

    if cache_files.is_empty() {
        println!(
            "no cache files matching prefix {} in {}",
            stem,
            dir.display(),
        );
        return Ok(());
    }

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Page cache: {}", args.cache_prefix.display());
    println!("╠══════════════════════════════════════════════════════════════╣");

    for path in &cache_files {
        let name = path.file_name().unwrap().to_string_lossy();
        if name.ends_with(META_SUFFIX) {
            let meta = DatasetMeta::load(path)?;
            println!("║  Metadata:   {name}");
            println!("║    rows: {:>12}", meta.num_rows);
            println!("║    cols: {:>12}", meta.num_cols);
            println!("║    nnz:  {:>12}", meta.num_nonzero);
            println!(
                "║    feature types: {}",
                if meta.feature_types.is_empty() {
                    "(none, all numerical)".to_string()
                } else {
                    format!("{} tagged", meta.feature_types.len())
                },
            );
        }
    }
    println!("╚══════════════════════════════════════════════════════════════╝");

    for path in &cache_files {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if name.ends_with(ROW_PAGE_SUFFIX) {
            println!("\n── {name} (row pages) ──");
            let mut reader: PageFileReader<RowPage> = PageFileReader::open(path)?;
            let mut i = 0usize;
            while let Some(page) = reader.next_page() {
                if args.max_pages == 0 || i < args.max_pages {
                    println!(
                        "  page {i:>4}: base_row {:>10}  rows {:>8}  nnz {:>10}  cols {:>6}",
                        page.base_rowid(),
                        page.num_rows(),
                        page.nnz(),
                        page.num_cols(),
                    );
                }
                i += 1;
            }
            println!("  {i} page(s) total");
        } else if name.ends_with(SORTED_COLUMN_PAGE_SUFFIX) {
            println!("\n── {name} (sorted column pages) ──");
            let mut reader: PageFileReader<SortedColumnPage> = PageFileReader::open(path)?;
            let mut i = 0usize;
            while let Some(page) = reader.next_page() {
                if args.max_pages == 0 || i < args.max_pages {
                    println!(
                        "  page {i:>4}: base_row {:>10}  cols {:>6}  nnz {:>10}",
                        page.base_rowid(),
                        page.num_cols(),
                        page.nnz(),
                    );
                }
                i += 1;
            }
            println!("  {i} page(s) total");
        } else if name.ends_with(COLUMN_PAGE_SUFFIX) {
            println!("\n── {name} (column pages) ──");
            let mut reader: PageFileReader<ColumnPage> = PageFileReader::open(path)?;
            let mut i = 0usize;
            while let Some(page) = reader.next_page() {
                if args.max_pages == 0 || i < args.max_pages {
                    println!(
                        "  page {i:>4}: base_row {:>10}  cols {:>6}  nnz {:>10}",
                        page.base_rowid(),
                        page.num_cols(),
                        page.nnz(),
                    );
                }
                i += 1;
            }
            println!("  {i} page(s) total");
        } else if name.ends_with(HISTOGRAM_PAGE_SUFFIX) {
            println!("\n── {name} (histogram index pages) ──");
            let mut reader: PageFileReader<HistogramPage> = PageFileReader::open(path)?;
            let mut i = 0usize;
            while let Some(page) = reader.next_page() {
                if args.max_pages == 0 || i < args.max_pages {
                    println!(
                        "  page {i:>4}: base_row {:>10}  rows {:>8}  nnz {:>10}  dense {}",
                        page.base_rowid(),
                        page.num_rows(),
                        page.nnz(),
                        page.is_dense(),
                    );
                }
                i += 1;
            }
            println!("  {i} page(s) total");
        }
    }

    Ok(())
}
