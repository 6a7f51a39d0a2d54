use serde::{Deserialize, Serialize};

/// Rectangular region a geocoded coordinate must fall inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub const KENYA: BoundingBox = BoundingBox {
        min_lat: -4.9,
        max_lat: 5.0,
        min_lon: 33.5,
        max_lon: 42.0,
    };

    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Option<Self> {
        let finite = [min_lat, max_lat, min_lon, max_lon]
            .iter()
            .all(|value| value.is_finite());
        if !finite || min_lat > max_lat || min_lon > max_lon {
            return None;
        }
        Some(Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }

    /// Inclusive on every edge. NaN coordinates are never contained.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }

    /// `south,west|north,east`, the Google `bounds` parameter.
    pub fn google_bounds(&self) -> String {
        format!(
            "{},{}|{},{}",
            self.min_lat, self.min_lon, self.max_lat, self.max_lon
        )
    }

    /// `west,south,east,north`, shared by the Mapbox `bbox` and Nominatim
    /// `viewbox` parameters.
    pub fn lon_lat_box(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::KENYA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_nairobi_and_rejects_lagos() {
        let kenya = BoundingBox::KENYA;
        assert!(kenya.contains(-1.283, 36.821));
        assert!(!kenya.contains(6.524, 3.379));
    }

    #[test]
    fn edges_are_inclusive() {
        let kenya = BoundingBox::KENYA;
        assert!(kenya.contains(-4.9, 33.5));
        assert!(kenya.contains(5.0, 42.0));
        assert!(!kenya.contains(5.0001, 40.0));
        assert!(!kenya.contains(0.0, 33.4999));
    }

    #[test]
    fn rejects_nan_coordinates() {
        assert!(!BoundingBox::KENYA.contains(f64::NAN, 36.8));
        assert!(!BoundingBox::KENYA.contains(-1.2, f64::NAN));
    }

    #[test]
    fn refuses_inverted_boxes() {
        assert!(BoundingBox::new(5.0, -4.9, 33.5, 42.0).is_none());
        assert!(BoundingBox::new(-4.9, 5.0, 33.5, f64::INFINITY).is_none());
        assert_eq!(
            BoundingBox::new(-4.9, 5.0, 33.5, 42.0),
            Some(BoundingBox::KENYA)
        );
    }

    #[test]
    fn formats_provider_parameters() {
        let kenya = BoundingBox::KENYA;
        assert_eq!(kenya.google_bounds(), "-4.9,33.5|5,42");
        assert_eq!(kenya.lon_lat_box(), "33.5,-4.9,42,5");
    }
}
