use serde::{Deserialize, Serialize};

/// No provider is ever trusted beyond this score.
pub const CONFIDENCE_CAP: f64 = 0.95;

const GOOGLE_ROOFTOP: f64 = 0.95;
const GOOGLE_APPROXIMATE: f64 = 0.85;
const MAPBOX_DEFAULT_RELEVANCE: f64 = 0.7;

/// Quality signal as reported by a provider, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualitySignal {
    /// Google `geometry.location_type` (`ROOFTOP`, `RANGE_INTERPOLATED`, ...).
    LocationType(String),
    /// Mapbox feature `relevance`.
    Relevance(Option<f64>),
    /// Nominatim `importance` together with the OSM `type` tag.
    Importance { importance: f64, result_type: String },
    /// Already on the shared scale; still clamped.
    Fixed(f64),
}

/// Maps a provider signal onto `[0, CONFIDENCE_CAP]`.
pub fn normalize(signal: &QualitySignal) -> f64 {
    let raw = match signal {
        QualitySignal::LocationType(kind) => {
            if kind.eq_ignore_ascii_case("ROOFTOP") {
                GOOGLE_ROOFTOP
            } else {
                GOOGLE_APPROXIMATE
            }
        }
        QualitySignal::Relevance(relevance) => relevance.unwrap_or(MAPBOX_DEFAULT_RELEVANCE),
        QualitySignal::Importance {
            importance,
            result_type,
        } => match type_boost(result_type) {
            Some(boost) => (importance + boost) / 2.0,
            None => *importance,
        },
        QualitySignal::Fixed(value) => *value,
    };
    clamp(raw)
}

fn type_boost(result_type: &str) -> Option<f64> {
    let boost = match result_type {
        "administrative" => 0.9,
        "town" => 0.8,
        "village" => 0.7,
        "hamlet" => 0.6,
        "suburb" => 0.5,
        "road" => 0.4,
        "building" => 0.9,
        _ => return None,
    };
    Some(boost)
}

fn clamp(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, CONFIDENCE_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn importance(importance: f64, result_type: &str) -> QualitySignal {
        QualitySignal::Importance {
            importance,
            result_type: result_type.into(),
        }
    }

    #[test]
    fn google_rooftop_outranks_approximate() {
        assert_eq!(normalize(&QualitySignal::LocationType("ROOFTOP".into())), 0.95);
        assert_eq!(
            normalize(&QualitySignal::LocationType("APPROXIMATE".into())),
            0.85
        );
    }

    #[test]
    fn mapbox_relevance_is_capped_and_defaulted() {
        assert_eq!(normalize(&QualitySignal::Relevance(Some(1.0))), CONFIDENCE_CAP);
        assert_eq!(normalize(&QualitySignal::Relevance(Some(0.42))), 0.42);
        assert_eq!(normalize(&QualitySignal::Relevance(None)), 0.7);
    }

    #[test]
    fn nominatim_averages_with_type_boost() {
        let score = normalize(&importance(0.5, "administrative"));
        assert!((score - 0.7).abs() < 1e-9);
        let score = normalize(&importance(0.2, "road"));
        assert!((score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn nominatim_unknown_type_uses_raw_importance() {
        assert_eq!(normalize(&importance(0.31, "yes")), 0.31);
        assert_eq!(normalize(&importance(1.4, "yes")), CONFIDENCE_CAP);
    }

    #[test]
    fn every_signal_stays_within_range() {
        let signals = [
            QualitySignal::Fixed(-3.0),
            QualitySignal::Fixed(f64::NAN),
            QualitySignal::Fixed(7.0),
            QualitySignal::Relevance(Some(-0.1)),
            importance(2.0, "building"),
            importance(-1.0, "hamlet"),
        ];
        for signal in signals {
            let score = normalize(&signal);
            assert!((0.0..=CONFIDENCE_CAP).contains(&score), "{signal:?} -> {score}");
        }
    }

    #[test]
    fn normalization_is_stable_across_calls() {
        let signal = importance(0.61, "town");
        assert_eq!(normalize(&signal), normalize(&signal));
    }
}
