use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::bounds::BoundingBox;
use crate::confidence;
use crate::providers::{GeocodeProvider, ProviderOutcome};
use crate::rate_limit::RateLimiter;
use crate::resolution::{GeocodeResult, ProviderId};
use crate::retry::{RetryController, RetryOutcome};

/// How one provider's turn in the fallback chain ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Accepted(GeocodeResult),
    NoMatch,
    Unconfigured,
    OutOfBounds { latitude: f64, longitude: f64 },
    Exhausted { error: String },
    Rejected { error: String },
}

impl StageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Accepted(_) => "accepted",
            StageOutcome::NoMatch => "no_match",
            StageOutcome::Unconfigured => "unconfigured",
            StageOutcome::OutOfBounds { .. } => "out_of_bounds",
            StageOutcome::Exhausted { .. } => "exhausted",
            StageOutcome::Rejected { .. } => "rejected",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            StageOutcome::OutOfBounds {
                latitude,
                longitude,
            } => Some(format!("{latitude},{longitude}")),
            StageOutcome::Exhausted { error } | StageOutcome::Rejected { error } => {
                Some(error.clone())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub provider: ProviderId,
    pub outcome: StageOutcome,
    /// Calls actually sent to the provider.
    pub calls: u32,
}

/// One link of the fallback chain: rate limiter, retry controller and
/// provider adapter, followed by bounds validation and normalization.
pub struct ProviderStage {
    provider: Arc<dyn GeocodeProvider>,
    limiter: Arc<RateLimiter>,
    retry: RetryController,
}

impl ProviderStage {
    pub fn new(
        provider: Arc<dyn GeocodeProvider>,
        limiter: Arc<RateLimiter>,
        retry: RetryController,
    ) -> Self {
        Self {
            provider,
            limiter,
            retry,
        }
    }

    pub fn id(&self) -> ProviderId {
        self.provider.id()
    }

    pub async fn attempt(&self, query: &str, bounds: &BoundingBox) -> StageReport {
        let provider = self.provider.id();
        if !self.provider.is_configured() {
            debug!(%provider, "provider not configured; skipping");
            return StageReport {
                provider,
                outcome: StageOutcome::Unconfigured,
                calls: 0,
            };
        }

        let outcome = self
            .retry
            .run(move |_attempt| async move {
                self.limiter.acquire().await;
                self.retry.timed(self.provider.geocode(query)).await
            })
            .await;
        let calls = outcome.attempts();

        let outcome = match outcome {
            RetryOutcome::Completed {
                outcome: ProviderOutcome::Found(hit),
                ..
            } => {
                if bounds.contains(hit.latitude, hit.longitude) {
                    StageOutcome::Accepted(GeocodeResult {
                        latitude: hit.latitude,
                        longitude: hit.longitude,
                        formatted_address: hit.formatted_address,
                        method: provider.clone(),
                        confidence: confidence::normalize(&hit.signal),
                        raw_result_type: hit.raw_result_type,
                        importance: hit.importance.max(0.0),
                        resolved_at: Some(Utc::now()),
                    })
                } else {
                    warn!(
                        %provider,
                        latitude = hit.latitude,
                        longitude = hit.longitude,
                        "coordinate outside bounding box; treating as no match"
                    );
                    StageOutcome::OutOfBounds {
                        latitude: hit.latitude,
                        longitude: hit.longitude,
                    }
                }
            }
            RetryOutcome::Completed {
                outcome: ProviderOutcome::NoMatch,
                ..
            } => StageOutcome::NoMatch,
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(%provider, attempts, error = %last_error, "provider retries exhausted");
                StageOutcome::Exhausted {
                    error: last_error.to_string(),
                }
            }
            RetryOutcome::Rejected { error, .. } => {
                warn!(%provider, %error, "provider rejected query");
                StageOutcome::Rejected {
                    error: error.to_string(),
                }
            }
        };

        StageReport {
            provider,
            outcome,
            calls,
        }
    }
}
