use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::bounds::BoundingBox;
use crate::providers::{
    GOOGLE_DEFAULT_ENDPOINT, MAPBOX_DEFAULT_ENDPOINT, NOMINATIM_DEFAULT_ENDPOINT,
};
use crate::rate_limit::Quota;
use crate::resolution::ProviderId;
use crate::retry::RetryPolicy;

const DEFAULT_CACHE_PATH: &str = "data/processed/geocode_cache.json";
const DEFAULT_USER_AGENT: &str = "office-geocoder/0.1.0 (constituency office locator)";
const DEFAULT_AUDIT_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_AUDIT_BUFFER_MAX_FILES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Json,
    Sqlite,
}

/// Quota and retry budget for one provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProviderSettings {
    pub quota: Quota,
    pub retry: RetryPolicy,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub google_api_key: Option<SecretString>,
    pub mapbox_api_key: Option<SecretString>,
    pub provider_order: Vec<ProviderId>,
    pub google: ProviderSettings,
    pub mapbox: ProviderSettings,
    pub nominatim: ProviderSettings,
    pub google_endpoint: String,
    pub mapbox_endpoint: String,
    pub nominatim_endpoint: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub cache_path: PathBuf,
    pub cache_backend: CacheBackend,
    pub retry_failed: bool,
    pub bounds: BoundingBox,
    pub country_code: String,
    pub country_name: String,
    pub concurrency: usize,
    pub audit_log_dir: Option<PathBuf>,
    pub audit_buffer_max_bytes: u64,
    pub audit_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub provider_order: Vec<String>,
    pub cache_path: String,
    pub cache_backend: CacheBackend,
    pub retry_failed: bool,
    pub bounds: BoundingBox,
    pub country_code: String,
    pub country_name: String,
    pub request_timeout_secs: u64,
    pub concurrency: usize,
    pub audit_log_dir: Option<String>,
    pub has_google_api_key: bool,
    pub has_mapbox_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let request_timeout_secs = parse_u64("GEOCODE_REQUEST_TIMEOUT_SECS", 15).max(1);
        let attempt_timeout = Duration::from_secs(request_timeout_secs);
        let jitter = Duration::from_millis(parse_u64("GEOCODE_RETRY_JITTER_MS", 250));
        Self {
            google_api_key: parse_secret("GOOGLE_MAPS_API_KEY"),
            mapbox_api_key: parse_secret("MAPBOX_API_KEY"),
            provider_order: parse_provider_order("GEOCODE_PROVIDER_ORDER"),
            google: provider_settings("GOOGLE", (50, 60), (2, 1_000, 5_000))
                .with_timing(attempt_timeout, jitter),
            mapbox: provider_settings("MAPBOX", (60, 60), (2, 1_000, 5_000))
                .with_timing(attempt_timeout, jitter),
            nominatim: provider_settings("NOMINATIM", (1, 1), (3, 2_000, 10_000))
                .with_timing(attempt_timeout, jitter),
            google_endpoint: parse_string("GOOGLE_GEOCODE_ENDPOINT", GOOGLE_DEFAULT_ENDPOINT),
            mapbox_endpoint: parse_string("MAPBOX_GEOCODE_ENDPOINT", MAPBOX_DEFAULT_ENDPOINT),
            nominatim_endpoint: parse_string(
                "NOMINATIM_SEARCH_ENDPOINT",
                NOMINATIM_DEFAULT_ENDPOINT,
            ),
            user_agent: parse_string("GEOCODE_USER_AGENT", DEFAULT_USER_AGENT),
            request_timeout_secs,
            cache_path: PathBuf::from(parse_string("GEOCODE_CACHE_PATH", DEFAULT_CACHE_PATH)),
            cache_backend: parse_cache_backend("GEOCODE_CACHE_BACKEND"),
            retry_failed: parse_bool("GEOCODE_RETRY_FAILED", false),
            bounds: parse_bounds(),
            country_code: parse_string("GEOCODE_COUNTRY_CODE", "ke").to_ascii_lowercase(),
            country_name: parse_string("GEOCODE_COUNTRY_NAME", "Kenya"),
            concurrency: parse_usize("GEOCODE_CONCURRENCY", 4).max(1),
            audit_log_dir: env::var("GEOCODE_AUDIT_LOG_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            audit_buffer_max_bytes: parse_u64(
                "GEOCODE_AUDIT_BUFFER_MAX_BYTES",
                DEFAULT_AUDIT_BUFFER_MAX_BYTES,
            ),
            audit_buffer_max_files: parse_usize(
                "GEOCODE_AUDIT_BUFFER_MAX_FILES",
                DEFAULT_AUDIT_BUFFER_MAX_FILES,
            )
            .max(1),
        }
    }

    pub fn provider_settings(&self, provider: &ProviderId) -> Option<ProviderSettings> {
        if *provider == ProviderId::GOOGLE {
            Some(self.google)
        } else if *provider == ProviderId::MAPBOX {
            Some(self.mapbox)
        } else if *provider == ProviderId::NOMINATIM {
            Some(self.nominatim)
        } else {
            None
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            provider_order: self
                .provider_order
                .iter()
                .map(|id| id.to_string())
                .collect(),
            cache_path: self.cache_path.to_string_lossy().to_string(),
            cache_backend: self.cache_backend,
            retry_failed: self.retry_failed,
            bounds: self.bounds,
            country_code: self.country_code.clone(),
            country_name: self.country_name.clone(),
            request_timeout_secs: self.request_timeout_secs,
            concurrency: self.concurrency,
            audit_log_dir: self
                .audit_log_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().to_string()),
            has_google_api_key: self.google_api_key.is_some(),
            has_mapbox_api_key: self.mapbox_api_key.is_some(),
        }
    }
}

impl ProviderSettings {
    fn with_timing(mut self, attempt_timeout: Duration, jitter: Duration) -> Self {
        self.retry = self
            .retry
            .with_attempt_timeout(attempt_timeout)
            .with_jitter(jitter);
        self
    }
}

/// Reads `<PREFIX>_MAX_CALLS`, `<PREFIX>_PERIOD_SECS`, `<PREFIX>_MAX_ATTEMPTS`,
/// `<PREFIX>_MIN_DELAY_MS` and `<PREFIX>_MAX_DELAY_MS`.
fn provider_settings(
    prefix: &str,
    (max_calls, period_secs): (u32, u64),
    (max_attempts, min_delay_ms, max_delay_ms): (u32, u64, u64),
) -> ProviderSettings {
    let quota = Quota::new(
        parse_u32(&format!("{prefix}_MAX_CALLS"), max_calls),
        Duration::from_secs(parse_u64(&format!("{prefix}_PERIOD_SECS"), period_secs).max(1)),
    );
    let retry = RetryPolicy::new(
        parse_u32(&format!("{prefix}_MAX_ATTEMPTS"), max_attempts),
        Duration::from_millis(parse_u64(&format!("{prefix}_MIN_DELAY_MS"), min_delay_ms)),
        Duration::from_millis(parse_u64(&format!("{prefix}_MAX_DELAY_MS"), max_delay_ms)),
    );
    ProviderSettings { quota, retry }
}

fn default_provider_order() -> Vec<ProviderId> {
    vec![ProviderId::GOOGLE, ProviderId::MAPBOX, ProviderId::NOMINATIM]
}

fn parse_provider_order(key: &str) -> Vec<ProviderId> {
    let Ok(raw) = env::var(key) else {
        return default_provider_order();
    };
    let mut order: Vec<ProviderId> = Vec::new();
    for name in raw.split(',').map(|part| part.trim().to_ascii_lowercase()) {
        if name.is_empty() {
            continue;
        }
        let id = match name.as_str() {
            "google" => ProviderId::GOOGLE,
            "mapbox" => ProviderId::MAPBOX,
            "nominatim" => ProviderId::NOMINATIM,
            other => {
                warn!(provider = other, "ignoring unknown provider in {key}");
                continue;
            }
        };
        if !order.contains(&id) {
            order.push(id);
        }
    }
    if order.is_empty() {
        warn!("{key} names no known provider; using default order");
        return default_provider_order();
    }
    order
}

fn parse_bounds() -> BoundingBox {
    let kenya = BoundingBox::KENYA;
    let min_lat = parse_f64("GEOCODE_BOUNDS_MIN_LAT", kenya.min_lat);
    let max_lat = parse_f64("GEOCODE_BOUNDS_MAX_LAT", kenya.max_lat);
    let min_lon = parse_f64("GEOCODE_BOUNDS_MIN_LON", kenya.min_lon);
    let max_lon = parse_f64("GEOCODE_BOUNDS_MAX_LON", kenya.max_lon);
    BoundingBox::new(min_lat, max_lat, min_lon, max_lon).unwrap_or_else(|| {
        warn!(
            min_lat,
            max_lat, min_lon, max_lon, "invalid bounding box configured; using Kenya"
        );
        kenya
    })
}

fn parse_cache_backend(key: &str) -> CacheBackend {
    match env::var(key).map(|v| v.trim().to_ascii_lowercase()) {
        Ok(value) if value == "sqlite" => CacheBackend::Sqlite,
        Ok(value) if value == "json" || value.is_empty() => CacheBackend::Json,
        Ok(value) => {
            warn!(backend = %value, "unknown cache backend; using json");
            CacheBackend::Json
        }
        Err(_) => CacheBackend::Json,
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}
