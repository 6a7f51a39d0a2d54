use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use office_geocoder::{
    init_tracing, run_batch, AppConfig, BatchItem, Geocoder, ManualReviewRecord, OfficeRecord,
    QueryBuilder,
};

/// Resolve office descriptions to coordinates through the provider chain.
#[derive(Parser, Debug)]
#[command(name = "office-geocoder")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Queries to resolve, used verbatim as cache keys
    #[arg(value_name = "QUERY")]
    queries: Vec<String>,

    /// File with one query per line
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// JSON lines of office records (office_location, landmark, county)
    #[arg(long, value_name = "FILE")]
    records: Option<PathBuf>,

    /// Resolutions in flight at once (defaults to GEOCODE_CONCURRENCY)
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Drop cached failures before resolving
    #[arg(long)]
    invalidate_failures: bool,

    /// Drop the cached entry for this query before resolving
    #[arg(long, value_name = "QUERY")]
    invalidate: Vec<String>,

    /// Write unresolved records here as JSON lines
    #[arg(long, value_name = "FILE")]
    review_out: Option<PathBuf>,

    /// Print the effective configuration (without secrets) and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    if cli.show_config {
        println!("{}", serde_json::to_string_pretty(&config.public_profile())?);
        return Ok(());
    }

    let items = collect_items(&cli, &config)?;
    let geocoder = Geocoder::from_config(&config).context("failed to start geocoder")?;

    if cli.invalidate_failures {
        let removed = geocoder.cache().invalidate_failures()?;
        info!(removed, "invalidated cached failures");
    }
    for query in &cli.invalidate {
        let removed = geocoder.cache().invalidate(query)?;
        info!(query = %query, removed, "invalidated cache entry");
    }
    if items.is_empty() {
        return Ok(());
    }

    let concurrency = cli.concurrency.unwrap_or(config.concurrency).max(1);
    let report = run_batch(&geocoder, &items, concurrency, None, None).await?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for outcome in &report.results {
        serde_json::to_writer(&mut out, outcome)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    if let Some(path) = &cli.review_out {
        write_review_queue(path, &report.manual_review)?;
        info!(
            path = %path.display(),
            records = report.manual_review.len(),
            "wrote manual review queue"
        );
    }

    eprintln!(
        "{} resolved, {} failed, {} from cache",
        report.resolved, report.failed, report.cache_hits
    );
    Ok(())
}

fn collect_items(cli: &Cli, config: &AppConfig) -> Result<Vec<BatchItem>> {
    let mut items: Vec<BatchItem> = cli
        .queries
        .iter()
        .enumerate()
        .map(|(idx, query)| BatchItem::new(format!("arg-{}", idx + 1), query.clone()))
        .collect();

    if let Some(path) = &cli.input {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        items.extend(
            contents
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(idx, line)| BatchItem::new(format!("line-{}", idx + 1), line.trim())),
        );
    }

    if let Some(path) = &cli.records {
        let builder = QueryBuilder::new(config.country_name.clone());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: OfficeRecord = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid office record", path.display(), idx + 1))?;
            items.push(BatchItem::new(
                format!("record-{}", idx + 1),
                builder.build(&record),
            ));
        }
    }

    Ok(items)
}

fn write_review_queue(path: &Path, records: &[ManualReviewRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
    );
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
