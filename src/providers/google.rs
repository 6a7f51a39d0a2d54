use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{error_for_status, GeocodeProvider, ProviderError, ProviderHit, ProviderOutcome, RequestContext};
use crate::confidence::QualitySignal;
use crate::resolution::ProviderId;

pub const DEFAULT_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Google reports no per-result score; every hit carries the same weight.
const GOOGLE_IMPORTANCE: f64 = 0.9;

pub struct GoogleGeocoder {
    context: RequestContext,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl GoogleGeocoder {
    pub fn new(
        context: RequestContext,
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Self {
        Self {
            context,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct Response {
    status: String,
    #[serde(default)]
    results: Vec<ResponseResult>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct ResponseResult {
    formatted_address: Option<String>,
    geometry: ResponseGeometry,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Deserialize)]
struct ResponseGeometry {
    location: ResponseLocation,
    location_type: Option<String>,
}

#[derive(Deserialize)]
struct ResponseLocation {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl GeocodeProvider for GoogleGeocoder {
    fn id(&self) -> ProviderId {
        ProviderId::GOOGLE
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn geocode(&self, query: &str) -> Result<ProviderOutcome, ProviderError> {
        let Some(api_key) = &self.api_key else {
            return Ok(ProviderOutcome::NoMatch);
        };

        let components = format!("country:{}", self.context.country_code.to_uppercase());
        let bounds = self.context.bounds.google_bounds();
        let response = self
            .context
            .http
            .get(&self.endpoint)
            .query(&[
                ("address", query),
                ("key", api_key.expose_secret()),
                ("region", self.context.country_code.as_str()),
                ("components", components.as_str()),
                ("bounds", bounds.as_str()),
            ])
            .send()
            .await?;
        let parsed: Response = error_for_status(response)?.json().await?;

        match parsed.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Ok(ProviderOutcome::NoMatch),
            "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => {
                return Err(ProviderError::Throttled(parsed.status));
            }
            other => {
                let detail = parsed
                    .error_message
                    .map(|message| format!("{other}: {message}"))
                    .unwrap_or_else(|| other.to_string());
                return Err(ProviderError::Rejected(detail));
            }
        }

        let Some(result) = parsed.results.into_iter().next() else {
            debug!(provider = "google", "status OK without results");
            return Ok(ProviderOutcome::NoMatch);
        };

        Ok(ProviderOutcome::Found(ProviderHit {
            latitude: result.geometry.location.lat,
            longitude: result.geometry.location.lng,
            formatted_address: result.formatted_address.unwrap_or_default(),
            raw_result_type: result.types.into_iter().next().unwrap_or_default(),
            importance: GOOGLE_IMPORTANCE,
            signal: QualitySignal::LocationType(
                result.geometry.location_type.unwrap_or_default(),
            ),
        }))
    }
}
