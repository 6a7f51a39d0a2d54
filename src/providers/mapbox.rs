use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{error_for_status, GeocodeProvider, ProviderError, ProviderHit, ProviderOutcome, RequestContext};
use crate::confidence::QualitySignal;
use crate::resolution::ProviderId;

pub const DEFAULT_ENDPOINT: &str = "https://api.mapbox.com/geocoding/v5/mapbox.places";

/// Feature types precise enough for an office; regions and countries are left out.
const FEATURE_TYPES: &str = "address,place,poi";

pub struct MapboxGeocoder {
    context: RequestContext,
    endpoint: String,
    access_token: Option<SecretString>,
}

impl MapboxGeocoder {
    pub fn new(
        context: RequestContext,
        endpoint: impl Into<String>,
        access_token: Option<SecretString>,
    ) -> Self {
        Self {
            context,
            endpoint: endpoint.into(),
            access_token,
        }
    }

    /// The query travels as a single percent-encoded path segment.
    fn search_url(&self, query: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|err| ProviderError::Rejected(format!("invalid endpoint: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Rejected("endpoint cannot carry a path".into()))?
            .pop_if_empty()
            .push(&format!("{query}.json"));
        Ok(url)
    }
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    center: [f64; 2],
    place_name: Option<String>,
    relevance: Option<f64>,
    #[serde(default)]
    place_type: Vec<String>,
}

#[async_trait]
impl GeocodeProvider for MapboxGeocoder {
    fn id(&self) -> ProviderId {
        ProviderId::MAPBOX
    }

    fn is_configured(&self) -> bool {
        self.access_token.is_some()
    }

    async fn geocode(&self, query: &str) -> Result<ProviderOutcome, ProviderError> {
        let Some(token) = &self.access_token else {
            return Ok(ProviderOutcome::NoMatch);
        };

        let bbox = self.context.bounds.lon_lat_box();
        let response = self
            .context
            .http
            .get(self.search_url(query)?)
            .query(&[
                ("access_token", token.expose_secret()),
                ("country", self.context.country_code.as_str()),
                ("limit", "1"),
                ("types", FEATURE_TYPES),
                ("bbox", bbox.as_str()),
            ])
            .send()
            .await?;
        let parsed: Response = error_for_status(response)?.json().await?;

        let Some(feature) = parsed.features.into_iter().next() else {
            return Ok(ProviderOutcome::NoMatch);
        };
        let [longitude, latitude] = feature.center;

        Ok(ProviderOutcome::Found(ProviderHit {
            latitude,
            longitude,
            formatted_address: feature.place_name.unwrap_or_default(),
            raw_result_type: feature.place_type.into_iter().next().unwrap_or_default(),
            importance: feature.relevance.unwrap_or_default().max(0.0),
            signal: QualitySignal::Relevance(feature.relevance),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httptest::matchers::{all_of, contains, matches, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;
    use crate::bounds::BoundingBox;

    fn geocoder(server: &Server) -> MapboxGeocoder {
        let context =
            RequestContext::new("test-agent", Duration::from_secs(5), "ke", BoundingBox::KENYA)
                .unwrap();
        MapboxGeocoder::new(
            context,
            server.url("/mapbox.places").to_string(),
            Some(SecretString::new("pk.test".into())),
        )
    }

    #[test]
    fn encodes_query_into_single_segment() {
        let server = Server::run();
        let url = geocoder(&server)
            .search_url("Kisumu Central/Office, Kisumu")
            .unwrap();
        let last = url.path_segments().unwrap().last().unwrap().to_string();
        assert!(last.ends_with(".json"));
        assert!(!last.contains('/'));
        assert!(last.starts_with("Kisumu%20Central%2FOffice"));
    }

    #[tokio::test]
    async fn reads_center_as_lon_lat() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path(matches("^/mapbox.places/.+\\.json$")),
                request::query(url_decoded(contains(("country", "ke")))),
                request::query(url_decoded(contains(("access_token", "pk.test")))),
                request::query(url_decoded(contains(("types", "address,place,poi")))),
            ])
            .respond_with(json_encoded(json!({
                "features": [{
                    "center": [34.7617, -0.0917],
                    "place_name": "Kisumu, Kenya",
                    "relevance": 0.82,
                    "place_type": ["place"]
                }]
            }))),
        );

        let outcome = geocoder(&server).geocode("Kisumu, Kenya").await.unwrap();
        let ProviderOutcome::Found(hit) = outcome else {
            panic!("expected a hit");
        };
        assert_eq!(hit.latitude, -0.0917);
        assert_eq!(hit.longitude, 34.7617);
        assert_eq!(hit.raw_result_type, "place");
        assert_eq!(hit.signal, QualitySignal::Relevance(Some(0.82)));
    }

    #[tokio::test]
    async fn empty_features_is_no_match() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .respond_with(json_encoded(json!({ "features": [] }))),
        );
        let outcome = geocoder(&server).geocode("nowhere").await.unwrap();
        assert_eq!(outcome, ProviderOutcome::NoMatch);
    }

    #[tokio::test]
    async fn too_many_requests_is_transient() {
        let server = Server::run();
        server.expect(Expectation::matching(request::method("GET")).respond_with(status_code(429)));
        let err = geocoder(&server).geocode("busy").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unauthorized_is_final() {
        let server = Server::run();
        server.expect(Expectation::matching(request::method("GET")).respond_with(status_code(401)));
        let err = geocoder(&server).geocode("denied").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
