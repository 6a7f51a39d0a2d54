use std::collections::BTreeMap;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{Geocoder, Resolution, ResolutionSource};
use crate::errors::AppResult;
use crate::resolution::{CacheEntry, ProviderId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub query: String,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub current_query: String,
}

/// A record no provider could place, queued for a human to locate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualReviewRecord {
    pub record_id: String,
    pub query: String,
    pub providers_tried: Vec<ProviderId>,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfidenceSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub id: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub processed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub provider_calls: u64,
    pub cancelled: bool,
    /// Count of entries by `method`, failures included as `failed`.
    pub method_counts: BTreeMap<String, usize>,
    pub confidence: Option<ConfidenceSummary>,
    pub manual_review: Vec<ManualReviewRecord>,
    pub results: Vec<BatchOutcome>,
}

impl BatchReport {
    fn with_total(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    fn absorb(&mut self, id: String, resolution: Resolution) {
        self.processed += 1;
        self.provider_calls += u64::from(resolution.provider_calls);
        if resolution.source == ResolutionSource::Cache {
            self.cache_hits += 1;
        }
        *self
            .method_counts
            .entry(resolution.entry.method().to_string())
            .or_default() += 1;

        match &resolution.entry {
            CacheEntry::Resolved(_) => self.resolved += 1,
            CacheEntry::Failed(failure) => {
                self.failed += 1;
                self.manual_review.push(ManualReviewRecord {
                    record_id: id.clone(),
                    query: resolution.query.clone(),
                    providers_tried: failure.providers_tried.clone(),
                    flagged_at: Utc::now(),
                });
            }
        }
        self.results.push(BatchOutcome { id, resolution });
    }

    fn summarize_confidence(&mut self) {
        let scores: Vec<f64> = self
            .results
            .iter()
            .filter_map(|outcome| outcome.resolution.entry.as_resolved())
            .map(|result| result.confidence)
            .collect();
        if scores.is_empty() {
            self.confidence = None;
            return;
        }
        let sum: f64 = scores.iter().sum();
        self.confidence = Some(ConfidenceSummary {
            mean: sum / scores.len() as f64,
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        });
    }
}

/// Resolves every item with up to `concurrency` resolutions in flight.
///
/// Setting `cancel_flag` stops new resolutions from starting; those already
/// running finish and are reported. A cache write failure aborts the batch.
pub async fn run_batch(
    geocoder: &Geocoder,
    items: &[BatchItem],
    concurrency: usize,
    observer: Option<Arc<dyn Fn(BatchProgress) + Send + Sync>>,
    cancel_flag: Option<Arc<AtomicBool>>,
) -> AppResult<BatchReport> {
    let mut report = BatchReport::with_total(items.len());
    let is_cancelled = || {
        cancel_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    };

    let mut pending = stream::iter(items.iter())
        .take_while(|_| future::ready(!is_cancelled()))
        .map(|item| async move { (item, geocoder.resolve(&item.query).await) })
        .buffered(concurrency.max(1));

    while let Some((item, resolution)) = pending.next().await {
        let resolution = resolution?;
        let current_query = resolution.query.clone();
        report.absorb(item.id.clone(), resolution);
        if report.processed % 10 == 0 {
            info!(
                processed = report.processed,
                total = report.total,
                "geocoding progress"
            );
        }
        if let Some(callback) = &observer {
            callback(BatchProgress {
                total: report.total,
                processed: report.processed,
                resolved: report.resolved,
                failed: report.failed,
                current_query,
            });
        }
    }

    report.cancelled = report.processed < report.total && is_cancelled();
    report.summarize_confidence();
    if let Err(err) = geocoder.flush_audit() {
        warn!(target: "attempt_log", error = %err, "failed to flush attempt log");
    }
    info!(
        resolved = report.resolved,
        failed = report.failed,
        cache_hits = report.cache_hits,
        cancelled = report.cancelled,
        "geocoding batch finished"
    );
    for (method, count) in &report.method_counts {
        info!(method = %method, count, "method distribution");
    }
    Ok(report)
}
