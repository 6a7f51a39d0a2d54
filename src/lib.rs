pub mod audit;
pub mod batch;
pub mod bounds;
pub mod cache;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod errors;
pub mod pipeline;
pub mod providers;
pub mod query;
pub mod rate_limit;
pub mod resolution;
pub mod retry;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use audit::{AttemptEvent, AttemptLog};
pub use batch::{run_batch, BatchItem, BatchProgress, BatchReport, ManualReviewRecord};
pub use bounds::BoundingBox;
pub use cache::{open_cache, JsonFileCache, MemoryCache, ResolutionCache, SqliteCache};
pub use config::{AppConfig, CacheBackend, ProviderSettings};
pub use engine::{Geocoder, GeocoderBuilder, Resolution, ResolutionSource, ResolutionStats};
pub use errors::{AppError, AppResult};
pub use providers::{GeocodeProvider, ProviderError, ProviderHit, ProviderOutcome};
pub use query::{OfficeRecord, QueryBuilder};
pub use rate_limit::{Quota, RateLimiter, RateLimiterRegistry};
pub use resolution::{CacheEntry, FailureResult, GeocodeResult, ProviderId};
pub use retry::{RetryController, RetryPolicy};

/// Installs the global subscriber once. Output goes to stderr so stdout
/// stays free for results.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,office_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
