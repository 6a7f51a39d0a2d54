use serde::{Deserialize, Serialize};

/// Office row as it comes out of the cleaned address table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficeRecord {
    #[serde(default)]
    pub office_location: Option<String>,
    #[serde(default)]
    pub landmark: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
}

/// Joins office fields into the comma separated query sent to providers.
///
/// The output is the cache key, so the same record must always produce the
/// same string.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    country_name: String,
}

impl QueryBuilder {
    pub fn new(country_name: impl Into<String>) -> Self {
        Self {
            country_name: country_name.into(),
        }
    }

    pub fn build(&self, record: &OfficeRecord) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(4);
        if let Some(location) = non_empty(&record.office_location) {
            parts.push(location.to_string());
        }
        if let Some(landmark) = non_empty(&record.landmark) {
            parts.push(landmark.to_string());
        }
        if let Some(county) = non_empty(&record.county) {
            if county.to_ascii_lowercase().ends_with(" county") {
                parts.push(county.to_string());
            } else {
                parts.push(format!("{county} County"));
            }
        }
        let country = self.country_name.trim();
        if !country.is_empty() {
            parts.push(country.to_string());
        }
        parts.join(", ")
    }
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new("Kenya")
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(location: &str, landmark: &str, county: &str) -> OfficeRecord {
        OfficeRecord {
            office_location: Some(location.into()),
            landmark: Some(landmark.into()),
            county: Some(county.into()),
        }
    }

    #[test]
    fn joins_all_parts() {
        let query = QueryBuilder::default().build(&record(
            "Kibra Sub-County Office",
            "Next to DC's office",
            "Nairobi",
        ));
        assert_eq!(
            query,
            "Kibra Sub-County Office, Next to DC's office, Nairobi County, Kenya"
        );
    }

    #[test]
    fn skips_blank_parts_and_trims() {
        let query = QueryBuilder::default().build(&record("  Eldoret Town ", "   ", "Uasin Gishu"));
        assert_eq!(query, "Eldoret Town, Uasin Gishu County, Kenya");

        let only_country = QueryBuilder::default().build(&OfficeRecord::default());
        assert_eq!(only_country, "Kenya");
    }

    #[test]
    fn does_not_double_the_county_suffix() {
        let query = QueryBuilder::default().build(&record("Kisumu", "", "Kisumu County"));
        assert_eq!(query, "Kisumu, Kisumu County, Kenya");
    }
}
