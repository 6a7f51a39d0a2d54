mod google;
mod mapbox;
mod nominatim;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::bounds::BoundingBox;
use crate::confidence::QualitySignal;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::resolution::ProviderId;

pub use google::{GoogleGeocoder, DEFAULT_ENDPOINT as GOOGLE_DEFAULT_ENDPOINT};
pub use mapbox::{MapboxGeocoder, DEFAULT_ENDPOINT as MAPBOX_DEFAULT_ENDPOINT};
pub use nominatim::{NominatimGeocoder, DEFAULT_ENDPOINT as NOMINATIM_DEFAULT_ENDPOINT};

/// Best candidate returned by a provider, before bounds checking.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderHit {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
    pub raw_result_type: String,
    pub importance: f64,
    pub signal: QualitySignal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome {
    Found(ProviderHit),
    NoMatch,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider answered HTTP {0}")]
    Status(u16),
    #[error("provider throttled the request: {0}")]
    Throttled(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("unreadable provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Timeouts, transport failures, 5xx, 429 and provider-side throttling
    /// are worth another attempt; everything else is final for this query.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Transport(_) | ProviderError::Throttled(_) => {
                true
            }
            ProviderError::Status(code) => {
                *code == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(code)
            }
            ProviderError::Rejected(_) | ProviderError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::Status(status.as_u16())
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else if err.is_builder() {
            ProviderError::Rejected(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Unconfigured providers are skipped without touching their quota.
    fn is_configured(&self) -> bool {
        true
    }

    async fn geocode(&self, query: &str) -> Result<ProviderOutcome, ProviderError>;
}

/// Settings every HTTP adapter shares.
#[derive(Clone)]
pub struct RequestContext {
    pub http: Client,
    pub country_code: String,
    pub bounds: BoundingBox,
}

impl RequestContext {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        country_code: impl Into<String>,
        bounds: BoundingBox,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            country_code: country_code.into(),
            bounds,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::new(
            &config.user_agent,
            Duration::from_secs(config.request_timeout_secs),
            config.country_code.clone(),
            config.bounds,
        )
    }
}

/// Instantiates the configured providers in preference order.
pub fn build_providers(config: &AppConfig) -> AppResult<Vec<Arc<dyn GeocodeProvider>>> {
    let context = RequestContext::from_config(config)?;
    let providers = config
        .provider_order
        .iter()
        .filter_map(|id| -> Option<Arc<dyn GeocodeProvider>> {
            if *id == ProviderId::GOOGLE {
                Some(Arc::new(GoogleGeocoder::new(
                    context.clone(),
                    config.google_endpoint.clone(),
                    config.google_api_key.clone(),
                )))
            } else if *id == ProviderId::MAPBOX {
                Some(Arc::new(MapboxGeocoder::new(
                    context.clone(),
                    config.mapbox_endpoint.clone(),
                    config.mapbox_api_key.clone(),
                )))
            } else if *id == ProviderId::NOMINATIM {
                Some(Arc::new(NominatimGeocoder::new(
                    context.clone(),
                    config.nominatim_endpoint.clone(),
                )))
            } else {
                None
            }
        })
        .collect();
    Ok(providers)
}

fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        Err(ProviderError::Rejected(format!("HTTP {}", status.as_u16())))
    } else {
        Err(ProviderError::Status(status.as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::Status(429).is_transient());
        assert!(ProviderError::Status(503).is_transient());
        assert!(ProviderError::Throttled("OVER_QUERY_LIMIT".into()).is_transient());
        assert!(!ProviderError::Status(404).is_transient());
        assert!(!ProviderError::Rejected("REQUEST_DENIED".into()).is_transient());
        assert!(!ProviderError::Decode("bad json".into()).is_transient());
    }
}
