pub mod cache;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod geocoder;
pub mod multi;
pub mod normalize;
pub mod rate_limit;
pub mod records;
pub mod review;
pub mod sql;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::GeoCache;
pub use config::{AppConfig, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use fallback::{FallbackGeocoder, Resolution, ResolutionSource, ResolveStats};
pub use geocoder::{
    parse_response, GeocodeClient, GeocodeResult, Geocoder, ProviderKind, ProviderSettings,
    RetryPolicy,
};
pub use multi::MultiProviderGeocoder;
pub use normalize::build_ladder;
pub use rate_limit::RateLimiter;
pub use records::{ColumnLayout, CsvEnricher, EnrichProgress, EnrichStats};
pub use review::{ReviewEntry, ReviewLog};
pub use sql::{RewriteStats, SqlRewriter, TableRule};

/// Installs the global subscriber once; `RUST_LOG` wins over `debug`.
pub fn init_tracing(debug: bool) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let default_filter = if debug { "info,geofill=debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
