use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::confidence::{self, QualitySignal};

pub const FAILED_METHOD: &str = "failed";

/// Name of a geocoding provider as recorded in `method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Cow<'static, str>);

impl ProviderId {
    pub const GOOGLE: ProviderId = ProviderId(Cow::Borrowed("google"));
    pub const MAPBOX: ProviderId = ProviderId(Cow::Borrowed("mapbox"));
    pub const NOMINATIM: ProviderId = ProviderId(Cow::Borrowed("nominatim"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon")]
    pub longitude: f64,
    #[serde(default, alias = "address", deserialize_with = "string_or_null")]
    pub formatted_address: String,
    pub method: ProviderId,
    /// Older caches stored raw provider scores here; they are clamped on read.
    #[serde(default, deserialize_with = "capped_confidence")]
    pub confidence: f64,
    #[serde(default, alias = "type", deserialize_with = "string_or_null")]
    pub raw_result_type: String,
    #[serde(default, deserialize_with = "non_negative")]
    pub importance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Terminal outcome once every provider in the chain was exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureResult {
    pub method: FailureLabel,
    #[serde(default, deserialize_with = "f64_or_null")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers_tried: Vec<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<DateTime<Utc>>,
}

impl FailureResult {
    pub fn new(providers_tried: Vec<ProviderId>) -> Self {
        Self {
            method: FailureLabel::Failed,
            confidence: 0.0,
            providers_tried,
            attempted_at: Some(Utc::now()),
        }
    }
}

/// Older caches labelled terminal failures `manual`; both read as `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureLabel {
    #[serde(rename = "failed", alias = "manual")]
    Failed,
}

/// What the cache stores for a query and what a resolution returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheEntry {
    Resolved(GeocodeResult),
    Failed(FailureResult),
}

impl CacheEntry {
    pub fn is_resolved(&self) -> bool {
        matches!(self, CacheEntry::Resolved(_))
    }

    pub fn as_resolved(&self) -> Option<&GeocodeResult> {
        match self {
            CacheEntry::Resolved(result) => Some(result),
            CacheEntry::Failed(_) => None,
        }
    }

    pub fn coordinate(&self) -> Option<(f64, f64)> {
        self.as_resolved()
            .map(|result| (result.latitude, result.longitude))
    }

    pub fn method(&self) -> &str {
        match self {
            CacheEntry::Resolved(result) => result.method.as_str(),
            CacheEntry::Failed(_) => FAILED_METHOD,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            CacheEntry::Resolved(result) => result.confidence,
            CacheEntry::Failed(_) => 0.0,
        }
    }
}

fn string_or_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn f64_or_null<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or_default())
}

fn capped_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64_or_null(deserializer)?;
    Ok(confidence::normalize(&QualitySignal::Fixed(raw)))
}

fn non_negative<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64_or_null(deserializer)?;
    Ok(if raw.is_nan() { 0.0 } else { raw.max(0.0) })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_legacy_success_records() {
        let entry: CacheEntry = serde_json::from_value(json!({
            "lat": -1.2833,
            "lon": 36.8167,
            "address": "Starehe, Nairobi, Kenya",
            "confidence": 0.7,
            "type": "administrative",
            "importance": 0.5,
            "raw_result": { "osm_id": 42 },
            "method": "nominatim"
        }))
        .unwrap();

        let result = entry.as_resolved().unwrap();
        assert_eq!(result.method, ProviderId::NOMINATIM);
        assert_eq!(result.formatted_address, "Starehe, Nairobi, Kenya");
        assert_eq!(result.raw_result_type, "administrative");
        assert!(result.resolved_at.is_none());
    }

    #[test]
    fn reads_legacy_failure_labels() {
        for label in ["failed", "manual"] {
            let entry: CacheEntry = serde_json::from_value(json!({
                "lat": null,
                "lon": null,
                "method": label,
                "address": null,
                "confidence": 0
            }))
            .unwrap();
            assert!(!entry.is_resolved());
            assert_eq!(entry.method(), FAILED_METHOD);
            assert_eq!(entry.coordinate(), None);
        }
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let entry: CacheEntry = serde_json::from_value(json!({
            "latitude": 0.5,
            "longitude": 37.0,
            "method": "mapbox"
        }))
        .unwrap();
        let result = entry.as_resolved().unwrap();
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.importance, 0.0);
        assert!(result.formatted_address.is_empty());
    }

    #[test]
    fn clamps_stored_scores_from_older_caches() {
        let entry: CacheEntry = serde_json::from_value(json!({
            "lat": -1.2921,
            "lon": 36.8219,
            "address": "Nairobi, Kenya",
            "confidence": 1.0,
            "importance": -0.3,
            "method": "mapbox"
        }))
        .unwrap();
        let result = entry.as_resolved().unwrap();
        assert_eq!(result.confidence, confidence::CONFIDENCE_CAP);
        assert_eq!(result.importance, 0.0);
    }

    #[test]
    fn rejects_unknown_failure_labels() {
        let parsed = serde_json::from_value::<CacheEntry>(json!({
            "method": "gave_up",
            "confidence": 0
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn failure_serializes_with_failed_label() {
        let entry = CacheEntry::Failed(FailureResult::new(vec![ProviderId::GOOGLE]));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["method"], "failed");
        assert_eq!(value["confidence"], 0.0);
        assert_eq!(value["providers_tried"], json!(["google"]));
    }
}
