use async_trait::async_trait;
use serde::Deserialize;

use super::{error_for_status, GeocodeProvider, ProviderError, ProviderHit, ProviderOutcome, RequestContext};
use crate::confidence::QualitySignal;
use crate::resolution::ProviderId;

pub const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";

/// OpenStreetMap Nominatim: free, unauthenticated, and strictly rate limited.
pub struct NominatimGeocoder {
    context: RequestContext,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(context: RequestContext, endpoint: impl Into<String>) -> Self {
        Self {
            context,
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Deserialize)]
struct Place {
    lat: String,
    lon: String,
    display_name: Option<String>,
    #[serde(rename = "type")]
    result_type: Option<String>,
    importance: Option<f64>,
}

#[async_trait]
impl GeocodeProvider for NominatimGeocoder {
    fn id(&self) -> ProviderId {
        ProviderId::NOMINATIM
    }

    async fn geocode(&self, query: &str) -> Result<ProviderOutcome, ProviderError> {
        let viewbox = self.context.bounds.lon_lat_box();
        let response = self
            .context
            .http
            .get(&self.endpoint)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en")
            .query(&[
                ("q", query),
                ("format", "json"),
                ("countrycodes", self.context.country_code.as_str()),
                ("limit", "1"),
                ("addressdetails", "1"),
                ("viewbox", viewbox.as_str()),
                ("bounded", "1"),
            ])
            .send()
            .await?;
        let places: Vec<Place> = error_for_status(response)?.json().await?;

        let Some(place) = places.into_iter().next() else {
            return Ok(ProviderOutcome::NoMatch);
        };
        let latitude = parse_coordinate(&place.lat, "lat")?;
        let longitude = parse_coordinate(&place.lon, "lon")?;
        let importance = place.importance.unwrap_or_default().max(0.0);
        let result_type = place.result_type.unwrap_or_default();

        Ok(ProviderOutcome::Found(ProviderHit {
            latitude,
            longitude,
            formatted_address: place.display_name.unwrap_or_default(),
            raw_result_type: result_type.clone(),
            importance,
            signal: QualitySignal::Importance {
                importance,
                result_type,
            },
        }))
    }
}

fn parse_coordinate(value: &str, field: &str) -> Result<f64, ProviderError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|err| ProviderError::Decode(format!("{field} {value:?}: {err}")))
}
