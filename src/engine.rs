use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audit::{AttemptEvent, AttemptLog};
use crate::bounds::BoundingBox;
use crate::cache::{open_cache, ResolutionCache};
use crate::config::{AppConfig, ProviderSettings};
use crate::errors::{AppError, AppResult};
use crate::pipeline::{ProviderStage, StageOutcome, StageReport};
use crate::providers::{build_providers, GeocodeProvider};
use crate::rate_limit::RateLimiterRegistry;
use crate::resolution::{CacheEntry, FailureResult, ProviderId};
use crate::retry::RetryController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Providers,
    /// Blank query; nothing was looked up or stored.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub query: String,
    pub entry: CacheEntry,
    pub source: ResolutionSource,
    pub provider_calls: u32,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        self.entry.is_resolved()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub calls: u64,
    pub accepted: u64,
    pub no_match: u64,
    pub out_of_bounds: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionStats {
    pub resolutions: u64,
    pub cache_hits: u64,
    pub resolved: u64,
    pub failed: u64,
    pub providers: BTreeMap<String, ProviderStats>,
}

/// Fallback orchestrator: cache lookup, then each provider stage in order,
/// then a cache write of whichever result ends the chain.
pub struct Geocoder {
    cache: Arc<dyn ResolutionCache>,
    stages: Vec<ProviderStage>,
    bounds: BoundingBox,
    audit: Option<AttemptLog>,
    stats: Mutex<ResolutionStats>,
}

pub struct GeocoderBuilder {
    cache: Arc<dyn ResolutionCache>,
    bounds: BoundingBox,
    limiters: Arc<RateLimiterRegistry>,
    audit: Option<AttemptLog>,
    providers: Vec<(Arc<dyn GeocodeProvider>, ProviderSettings)>,
}

impl GeocoderBuilder {
    pub fn new(cache: Arc<dyn ResolutionCache>) -> Self {
        Self {
            cache,
            bounds: BoundingBox::default(),
            limiters: Arc::new(RateLimiterRegistry::new()),
            audit: None,
            providers: Vec::new(),
        }
    }

    pub fn bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = bounds;
        self
    }

    /// Shares rate limiter state with other engines talking to the same
    /// providers.
    pub fn limiters(mut self, limiters: Arc<RateLimiterRegistry>) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn audit_log(mut self, audit: AttemptLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Appends a provider to the chain; call order is preference order.
    pub fn provider(
        mut self,
        provider: Arc<dyn GeocodeProvider>,
        settings: ProviderSettings,
    ) -> Self {
        self.providers.push((provider, settings));
        self
    }

    pub fn build(self) -> Geocoder {
        let stages = self
            .providers
            .into_iter()
            .map(|(provider, settings)| {
                let limiter = self.limiters.register(&provider.id(), settings.quota);
                ProviderStage::new(provider, limiter, RetryController::new(settings.retry))
            })
            .collect();
        Geocoder {
            cache: self.cache,
            stages,
            bounds: self.bounds,
            audit: self.audit,
            stats: Mutex::new(ResolutionStats::default()),
        }
    }
}

impl Geocoder {
    pub fn builder(cache: Arc<dyn ResolutionCache>) -> GeocoderBuilder {
        GeocoderBuilder::new(cache)
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let cache = open_cache(config)?;
        if config.retry_failed {
            let removed = cache.invalidate_failures()?;
            info!(
                target: "geocode_cache",
                removed, "retrying previously failed queries"
            );
        }

        let mut builder = GeocoderBuilder::new(cache).bounds(config.bounds);
        if let Some(audit) = AttemptLog::from_config(config)? {
            builder = builder.audit_log(audit);
        }
        for provider in build_providers(config)? {
            let settings = config.provider_settings(&provider.id()).ok_or_else(|| {
                AppError::Config(format!("no settings for provider {}", provider.id()))
            })?;
            builder = builder.provider(provider, settings);
        }
        let geocoder = builder.build();
        info!(
            providers = ?geocoder.provider_order(),
            cache = ?config.cache_backend,
            "geocoder ready"
        );
        Ok(geocoder)
    }

    pub fn provider_order(&self) -> Vec<ProviderId> {
        self.stages.iter().map(ProviderStage::id).collect()
    }

    pub fn cache(&self) -> &Arc<dyn ResolutionCache> {
        &self.cache
    }

    pub fn stats(&self) -> ResolutionStats {
        self.stats.lock().clone()
    }

    /// Resolves one query. Failures to resolve are returned as data; only a
    /// failed cache write is an error.
    pub async fn resolve(&self, query: &str) -> AppResult<Resolution> {
        if query.trim().is_empty() {
            warn!("blank geocode query; skipping");
            return Ok(Resolution {
                query: query.to_string(),
                entry: CacheEntry::Failed(FailureResult::new(Vec::new())),
                source: ResolutionSource::Skipped,
                provider_calls: 0,
            });
        }

        match self.cache.get(query) {
            Ok(Some(entry)) if self.stale_coordinate(&entry) => {
                warn!(
                    target: "geocode_cache",
                    query,
                    coordinate = ?entry.coordinate(),
                    "cached coordinate outside bounds; resolving again"
                );
            }
            Ok(Some(entry)) => {
                debug!(target: "geocode_cache", query, method = entry.method(), "cache hit");
                self.record_audit(AttemptEvent::new(query, None, 0, "cache_hit", None));
                let mut stats = self.stats.lock();
                stats.resolutions += 1;
                stats.cache_hits += 1;
                return Ok(Resolution {
                    query: query.to_string(),
                    entry,
                    source: ResolutionSource::Cache,
                    provider_calls: 0,
                });
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target: "geocode_cache",
                    query,
                    error = %err,
                    "cache read failed; treating as miss"
                );
            }
        }

        let mut provider_calls = 0;
        let mut providers_tried = Vec::new();
        for stage in &self.stages {
            let report = stage.attempt(query, &self.bounds).await;
            provider_calls += report.calls;
            self.record_stage(query, &report);
            if report.calls > 0 {
                providers_tried.push(report.provider.clone());
            }

            if let StageOutcome::Accepted(result) = report.outcome {
                info!(
                    provider = %result.method,
                    query,
                    confidence = result.confidence,
                    "geocoded"
                );
                let entry = CacheEntry::Resolved(result);
                self.cache.put(query, &entry)?;
                let mut stats = self.stats.lock();
                stats.resolutions += 1;
                stats.resolved += 1;
                return Ok(Resolution {
                    query: query.to_string(),
                    entry,
                    source: ResolutionSource::Providers,
                    provider_calls,
                });
            }
        }

        warn!(query, tried = ?providers_tried, "no provider resolved query; caching failure");
        let entry = CacheEntry::Failed(FailureResult::new(providers_tried));
        self.cache.put(query, &entry)?;
        {
            let mut stats = self.stats.lock();
            stats.resolutions += 1;
            stats.failed += 1;
        }
        Ok(Resolution {
            query: query.to_string(),
            entry,
            source: ResolutionSource::Providers,
            provider_calls,
        })
    }

    /// Resolves queries with at most `concurrency` in flight. Results come
    /// back in input order. Rate limits still apply across all of them.
    pub async fn resolve_many<S>(
        &self,
        queries: &[S],
        concurrency: usize,
    ) -> Vec<AppResult<Resolution>>
    where
        S: AsRef<str>,
    {
        stream::iter(queries.iter())
            .map(|query| self.resolve(query.as_ref()))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    pub fn flush_audit(&self) -> AppResult<()> {
        match &self.audit {
            Some(audit) => audit.flush(),
            None => Ok(()),
        }
    }

    fn stale_coordinate(&self, entry: &CacheEntry) -> bool {
        entry
            .coordinate()
            .is_some_and(|(latitude, longitude)| !self.bounds.contains(latitude, longitude))
    }

    fn record_stage(&self, query: &str, report: &StageReport) {
        self.record_audit(AttemptEvent::new(
            query,
            Some(report.provider.clone()),
            report.calls,
            report.outcome.label(),
            report.outcome.detail(),
        ));

        let mut stats = self.stats.lock();
        let entry = stats
            .providers
            .entry(report.provider.to_string())
            .or_default();
        entry.calls += u64::from(report.calls);
        match &report.outcome {
            StageOutcome::Accepted(_) => entry.accepted += 1,
            StageOutcome::NoMatch => entry.no_match += 1,
            StageOutcome::OutOfBounds { .. } => entry.out_of_bounds += 1,
            StageOutcome::Exhausted { .. } | StageOutcome::Rejected { .. } => entry.errors += 1,
            StageOutcome::Unconfigured => {}
        }
    }

    fn record_audit(&self, event: AttemptEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }
}
